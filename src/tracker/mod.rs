//! Wires the job store to the polling scheduler: the pending job ids are the
//! dependency set of one subscription whose check queries the remote worker.

pub mod worker;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::errors::TrackerError;
use crate::models::{CheckOutcome, JobPatch, JobStatus, NewJob};
use crate::poller::{Liveness, PollTask, PollingScheduler};
use crate::storage::{JobStore, WriteReport};

pub use worker::{HttpStatusClient, StatusClient};

/// Subscription key for the pending-job status loop.
pub const JOB_STATUS_SUBSCRIPTION: &str = "job-status";

/// One status sweep over a fixed set of job ids.
pub struct JobStatusTask {
    store: Arc<JobStore>,
    client: Arc<dyn StatusClient>,
    clock: Arc<dyn Clock>,
    job_ids: Vec<String>,
}

impl JobStatusTask {
    pub fn new(
        store: Arc<JobStore>,
        client: Arc<dyn StatusClient>,
        clock: Arc<dyn Clock>,
        job_ids: &BTreeSet<String>,
    ) -> Self {
        Self {
            store,
            client,
            clock,
            job_ids: job_ids.iter().cloned().collect(),
        }
    }
}

#[async_trait]
impl PollTask for JobStatusTask {
    type Output = Vec<(String, CheckOutcome)>;

    /// Query every job concurrently. Individual failures are logged and
    /// leave the job untouched; the cycle only fails if every lookup did.
    async fn check(&self, cycle: u64) -> Result<Self::Output> {
        let lookups = self.job_ids.iter().map(|job_id| async move {
            (job_id.clone(), self.client.check_status(job_id).await)
        });
        let results = join_all(lookups).await;

        let mut outcomes = Vec::with_capacity(results.len());
        let mut failures = 0usize;
        for (job_id, result) in results {
            match result {
                Ok(outcome) => outcomes.push((job_id, outcome)),
                Err(e) => {
                    failures += 1;
                    tracing::warn!("Status check for '{}' failed: {:#}", job_id, e);
                }
            }
        }

        if outcomes.is_empty() && failures > 0 {
            return Err(TrackerError::CheckFailure(format!(
                "all {} status lookup(s) failed in cycle {}",
                failures, cycle
            ))
            .into());
        }
        Ok(outcomes)
    }

    /// Write every outcome as one store batch. The batch commits only if
    /// this loop's generation is still live once the store lock is held.
    async fn apply(&self, outcomes: Self::Output, live: &Liveness) -> Result<()> {
        let now = self.clock.now();
        let report = self
            .store
            .update_batch(outcomes, || live.is_live(), |record, outcome| {
                if record.status != JobStatus::Pending {
                    tracing::debug!(
                        "Skipping outcome for '{}': no longer pending ({})",
                        record.job_id,
                        record.status
                    );
                    return None;
                }
                Some(match outcome {
                    CheckOutcome::StillPending if record.is_past_deadline(now) => {
                        tracing::info!("Job '{}' passed its deadline", record.job_id);
                        JobPatch::status(JobStatus::Reassignable)
                    }
                    CheckOutcome::StillPending => JobPatch::default(),
                    CheckOutcome::Completed { result_id } => JobPatch::completed(result_id),
                    CheckOutcome::Failed { reason } => JobPatch::failed(reason),
                })
            })
            .await;

        let Some(report) = report else {
            tracing::debug!("Subscription retired before its outcomes were written");
            return Ok(());
        };
        if let Some(e) = &report.persist_error {
            tracing::warn!(
                "{} job(s) updated but not persisted: {}",
                report.applied.len(),
                e
            );
        }
        match report.rejected.into_iter().next() {
            Some((_, e)) => Err(e.into()),
            None => Ok(()),
        }
    }
}

/// Owns the store, the scheduler and the worker client.
pub struct JobTracker {
    store: Arc<JobStore>,
    scheduler: PollingScheduler,
    client: Arc<dyn StatusClient>,
    clock: Arc<dyn Clock>,
    deadline: Option<chrono::Duration>,
}

impl JobTracker {
    pub fn new(
        store: Arc<JobStore>,
        client: Arc<dyn StatusClient>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        event_capacity: usize,
    ) -> Self {
        Self {
            store,
            scheduler: PollingScheduler::new(interval, event_capacity),
            client,
            clock,
            deadline: None,
        }
    }

    /// Jobs submitted from now on become reassignable after `deadline`.
    pub fn with_deadline(mut self, deadline: Option<chrono::Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &PollingScheduler {
        &self.scheduler
    }

    /// Record a newly submitted job as pending.
    pub async fn submit(&self, mut new: NewJob) -> Result<WriteReport, TrackerError> {
        let now = self.clock.now();
        new.status = JobStatus::Pending;
        new.requested_at = new.requested_at.or(Some(now));
        if new.deadline.is_none() {
            new.deadline = self.deadline.map(|d| now + d);
        }
        self.store.add_job(new).await
    }

    /// Put a reassignable job back to pending, optionally on another worker.
    pub async fn resubmit(
        &self,
        job_id: &str,
        worker_address: Option<String>,
    ) -> Result<WriteReport, TrackerError> {
        let Some(record) = self.store.get_job(job_id).await else {
            return Ok(WriteReport::default());
        };
        if record.status != JobStatus::Reassignable {
            return Err(TrackerError::InvalidTransition {
                job_id: job_id.to_string(),
                from: record.status,
                to: JobStatus::Pending,
            });
        }

        // Without a configured deadline the job keeps its original window.
        let window = self.deadline.or(match (record.requested_at, record.deadline) {
            (Some(requested), Some(deadline)) => Some(deadline - requested),
            _ => None,
        });
        let now = self.clock.now();
        let patch = JobPatch {
            status: Some(JobStatus::Pending),
            worker_address,
            requested_at: Some(now),
            deadline: window.map(|d| now + d),
            ..Default::default()
        };
        self.store.update_job(job_id, patch).await
    }

    /// Align the status subscription with the current pending set. Returns
    /// true if the subscription was restarted or stopped.
    pub async fn refresh(&self) -> bool {
        let pending = self.store.pending_ids().await;
        self.scheduler
            .sync(JOB_STATUS_SUBSCRIPTION, pending, |ids| {
                JobStatusTask::new(
                    Arc::clone(&self.store),
                    Arc::clone(&self.client),
                    Arc::clone(&self.clock),
                    ids,
                )
            })
    }

    /// Keep polling in step with the store until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut changes = self.store.subscribe();
        self.refresh().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                change = changes.recv() => match change {
                    Ok(_) => {
                        self.refresh().await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("Store observer lagged by {} change(s)", skipped);
                        self.refresh().await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        tracing::info!("Job tracker stopping");
        self.scheduler.shutdown();
        Ok(())
    }
}
