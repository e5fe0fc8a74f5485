use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};

use crate::clock::Clock;
use crate::errors::TrackerError;
use crate::events::{ChangeKind, StoreChange};
use crate::models::job::{merge_patch, validate_new_job, validate_patch};
use crate::models::{JobPatch, JobRecord, JobStatus, NewJob};
use crate::storage::BlobStore;

/// Blob key holding the serialized job table.
pub const JOBS_NAMESPACE: &str = "jobwatch.indexed-videos";

/// Outcome of a mutating call.
///
/// `applied` is false when the call was a no-op (unknown job id).
/// `persist_error` carries a storage failure: the in-memory table stays
/// authoritative and the next mutation rewrites the full table.
#[must_use]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub applied: bool,
    pub persist_error: Option<String>,
}

impl WriteReport {
    fn noop() -> Self {
        Self::default()
    }
}

/// Outcome of [`JobStore::update_batch`].
///
/// `applied` lists the jobs that changed, in input order. `rejected` holds
/// the patches that failed validation. `persist_error` is as for
/// [`WriteReport`]; all applied jobs share the one persist.
#[must_use]
#[derive(Debug, Default)]
pub struct BatchReport {
    pub applied: Vec<String>,
    pub rejected: Vec<(String, TrackerError)>,
    pub persist_error: Option<String>,
}

/// In-memory table of job records with write-through persistence and
/// change notification.
pub struct JobStore {
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    jobs: RwLock<HashMap<String, JobRecord>>,
    dirty: AtomicBool,
    changes: broadcast::Sender<StoreChange>,
}

impl JobStore {
    /// Open the store, rehydrating from the blob under `JOBS_NAMESPACE`.
    ///
    /// A blob that does not parse is copied to `<namespace>.bak`, logged, and
    /// the store starts empty.
    pub async fn open(
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        event_capacity: usize,
    ) -> Result<Self> {
        let raw = blobs
            .get(JOBS_NAMESPACE)
            .await
            .context("Failed to read job table")?;

        let records = match raw {
            None => Vec::new(),
            Some(bytes) => match serde_json::from_slice::<Vec<JobRecord>>(&bytes) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!(
                        "Job table is corrupted ({}), creating backup and starting empty",
                        e
                    );
                    let backup_key = format!("{}.bak", JOBS_NAMESPACE);
                    if let Err(backup_err) = blobs.set(&backup_key, &bytes).await {
                        tracing::error!(
                            "Failed to back up corrupted job table: {:#}",
                            backup_err
                        );
                    }
                    Vec::new()
                }
            },
        };

        let jobs: HashMap<String, JobRecord> = records
            .into_iter()
            .map(|r| (r.job_id.clone(), r))
            .collect();
        tracing::info!("Job store opened with {} record(s)", jobs.len());

        let (changes, _) = broadcast::channel(event_capacity.max(1));

        Ok(Self {
            blobs,
            clock,
            jobs: RwLock::new(jobs),
            dirty: AtomicBool::new(false),
            changes,
        })
    }

    /// Register an observer. Every applied mutation sends one `StoreChange`
    /// after the table has been persisted.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    /// True when the last persistence attempt failed.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub async fn get_job(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.read().await.get(job_id).cloned()
    }

    /// Every record, ordered by job id.
    pub async fn list_jobs(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        jobs
    }

    /// Ids of every job currently `Pending`.
    pub async fn pending_ids(&self) -> BTreeSet<String> {
        self.jobs
            .read()
            .await
            .values()
            .filter(|r| r.status == JobStatus::Pending)
            .map(|r| r.job_id.clone())
            .collect()
    }

    pub async fn add_job(&self, new: NewJob) -> Result<WriteReport, TrackerError> {
        validate_new_job(&new)?;

        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&new.job_id) {
            return Err(TrackerError::DuplicateJob(new.job_id));
        }

        let now = self.clock.now();
        let record = JobRecord {
            job_id: new.job_id.clone(),
            result_id: new.result_id,
            worker_address: new.worker_address,
            requested_at: new.requested_at.or(Some(now)),
            deadline: new.deadline,
            status: new.status,
            file_name: new.file_name,
            file_size: new.file_size,
            last_checked_at: now,
            title: new.title,
            description: new.description,
            failure_reason: None,
        };
        tracing::info!("Tracking job '{}' ({})", record.job_id, record.status);
        jobs.insert(new.job_id.clone(), record);

        Ok(self.commit(&jobs, ChangeKind::Added, &new.job_id).await)
    }

    /// Merge `patch` over the stored record and refresh `last_checked_at`.
    /// Unknown ids are a no-op.
    pub async fn update_job(
        &self,
        job_id: &str,
        patch: JobPatch,
    ) -> Result<WriteReport, TrackerError> {
        let mut jobs = self.jobs.write().await;
        let Some(record) = jobs.get_mut(job_id) else {
            tracing::debug!("Ignoring update for unknown job '{}'", job_id);
            return Ok(WriteReport::noop());
        };

        apply_patch(record, patch, self.clock.now())?;

        Ok(self.commit(&jobs, ChangeKind::Updated, job_id).await)
    }

    /// Apply one patch per job under a single write guard with a single
    /// persist, so either the whole batch lands or none of it does.
    ///
    /// `proceed` runs once the guard is held; when it returns false nothing
    /// is written and `None` comes back. `patch_for` sees the current record
    /// and returns the patch to merge, or `None` to leave the job alone.
    /// Unknown ids are skipped. A patch that fails validation is reported in
    /// `rejected` and the others still apply.
    pub async fn update_batch<T, P, F>(
        &self,
        items: Vec<(String, T)>,
        proceed: P,
        mut patch_for: F,
    ) -> Option<BatchReport>
    where
        P: FnOnce() -> bool,
        F: FnMut(&JobRecord, T) -> Option<JobPatch>,
    {
        let mut jobs = self.jobs.write().await;
        if !proceed() {
            tracing::debug!("Dropping batch of {} update(s) before commit", items.len());
            return None;
        }

        let now = self.clock.now();
        let mut report = BatchReport::default();
        for (job_id, item) in items {
            let Some(record) = jobs.get_mut(&job_id) else {
                tracing::debug!("Ignoring update for unknown job '{}'", job_id);
                continue;
            };
            let Some(patch) = patch_for(&*record, item) else {
                continue;
            };
            match apply_patch(record, patch, now) {
                Ok(()) => report.applied.push(job_id),
                Err(e) => {
                    tracing::warn!("Rejected update for job '{}': {}", job_id, e);
                    report.rejected.push((job_id, e));
                }
            }
        }

        if report.applied.is_empty() {
            return Some(report);
        }

        report.persist_error = self.persist_or_mark_dirty(&jobs).await;
        let snapshot = snapshot(&jobs);
        for job_id in &report.applied {
            self.notify(Arc::clone(&snapshot), ChangeKind::Updated, job_id);
        }
        Some(report)
    }

    /// Delete a record. Removing an unknown id is a no-op.
    pub async fn remove_job(&self, job_id: &str) -> Result<WriteReport, TrackerError> {
        let mut jobs = self.jobs.write().await;
        if jobs.remove(job_id).is_none() {
            return Ok(WriteReport::noop());
        }
        tracing::info!("Removed job '{}'", job_id);

        Ok(self.commit(&jobs, ChangeKind::Removed, job_id).await)
    }

    /// Retry persistence after an earlier failure. No-op when clean.
    pub async fn flush(&self) -> Result<(), TrackerError> {
        if !self.is_dirty() {
            return Ok(());
        }
        let jobs = self.jobs.read().await;
        self.persist(&jobs).await?;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Persist then notify. Called with the write guard held so observers
    /// never see a table newer than what storage was asked to hold.
    async fn commit(
        &self,
        jobs: &HashMap<String, JobRecord>,
        kind: ChangeKind,
        job_id: &str,
    ) -> WriteReport {
        let persist_error = self.persist_or_mark_dirty(jobs).await;
        self.notify(snapshot(jobs), kind, job_id);

        WriteReport {
            applied: true,
            persist_error,
        }
    }

    async fn persist_or_mark_dirty(&self, jobs: &HashMap<String, JobRecord>) -> Option<String> {
        match self.persist(jobs).await {
            Ok(()) => {
                self.dirty.store(false, Ordering::SeqCst);
                None
            }
            Err(e) => {
                tracing::warn!("Failed to persist job table: {}", e);
                self.dirty.store(true, Ordering::SeqCst);
                Some(e.to_string())
            }
        }
    }

    fn notify(&self, snapshot: Arc<Vec<JobRecord>>, kind: ChangeKind, job_id: &str) {
        // No receivers is fine.
        let _ = self.changes.send(StoreChange {
            kind,
            job_id: job_id.to_string(),
            snapshot,
            timestamp: self.clock.now(),
        });
    }

    async fn persist(&self, jobs: &HashMap<String, JobRecord>) -> Result<(), TrackerError> {
        let mut records: Vec<&JobRecord> = jobs.values().collect();
        records.sort_by(|a, b| a.job_id.cmp(&b.job_id));

        let json = serde_json::to_vec_pretty(&records)?;
        self.blobs
            .set(JOBS_NAMESPACE, &json)
            .await
            .map_err(|e| TrackerError::Storage(format!("Failed to write job table: {:#}", e)))
    }
}

fn snapshot(jobs: &HashMap<String, JobRecord>) -> Arc<Vec<JobRecord>> {
    Arc::new(jobs.values().cloned().collect())
}

/// Validate and merge `patch`, then move `last_checked_at` forward to `now`.
fn apply_patch(
    record: &mut JobRecord,
    patch: JobPatch,
    now: DateTime<Utc>,
) -> Result<(), TrackerError> {
    validate_patch(record, &patch)?;

    let previous = record.status;
    merge_patch(record, patch);
    if now > record.last_checked_at {
        record.last_checked_at = now;
    }
    if record.status != previous {
        tracing::info!("Job '{}': {} -> {}", record.job_id, previous, record.status);
    }
    Ok(())
}
