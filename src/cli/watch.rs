// CLI watch command: poll the worker for pending jobs until interrupted

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::events::{ChangeKind, PollEvent, StoreChange};
use crate::models::{JobStatus, TrackerConfig};
use crate::tracker::JobTracker;

fn describe_change(change: &StoreChange) -> Option<String> {
    let job = change.snapshot.iter().find(|j| j.job_id == change.job_id);
    match (change.kind, job) {
        (ChangeKind::Added, _) => Some(format!("{}: tracking", change.job_id)),
        (ChangeKind::Removed, _) => Some(format!("{}: removed", change.job_id)),
        (ChangeKind::Updated, Some(job)) if job.status.is_terminal() => Some(match job.result_id {
            Some(ref result_id) => format!("{}: {} ({})", job.job_id, job.status, result_id),
            None => format!("{}: {}", job.job_id, job.status),
        }),
        (ChangeKind::Updated, Some(job)) if job.status == JobStatus::Reassignable => {
            Some(format!("{}: deadline passed, reassignable", job.job_id))
        }
        _ => None,
    }
}

/// jobwatch watch
pub async fn cmd_watch(tracker: Arc<JobTracker>, config: &TrackerConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();

    let mut changes = tracker.store().subscribe();
    let reporter_token = shutdown.clone();
    let reporter = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = reporter_token.cancelled() => break,
                change = changes.recv() => match change {
                    Ok(change) => {
                        if let Some(line) = describe_change(&change) {
                            println!("{}", line);
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Watch output lagged by {} change(s)", n);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });

    let mut poll_events = tracker.scheduler().subscribe_events();
    let events_token = shutdown.clone();
    let event_logger = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = events_token.cancelled() => break,
                event = poll_events.recv() => match event {
                    Ok(PollEvent::CheckFailed { cycle, error, .. }) => {
                        eprintln!("Status check {} failed: {}", cycle, error);
                    }
                    Ok(event) => tracing::debug!("Poll event: {:?}", event),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });

    let run_token = shutdown.clone();
    let runner = Arc::clone(&tracker);
    let run_handle = tokio::spawn(async move { runner.run(run_token).await });

    let pending = tracker.store().pending_ids().await.len();
    println!(
        "Watching {} pending job(s) at {} every {}ms. Press Ctrl+C to stop.",
        pending, config.worker_url, config.poll_interval_ms
    );

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C signal");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM signal");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received Ctrl+C signal");
    }

    shutdown.cancel();
    match run_handle.await {
        Ok(result) => result?,
        Err(e) => tracing::warn!("Tracker task ended abnormally: {}", e),
    }
    let _ = reporter.await;
    let _ = event_logger.await;

    tracker.store().flush().await?;
    Ok(())
}
