// CLI job commands: add, list, show, remove, resubmit

use std::io::{self, BufRead, Write};

use chrono::{DateTime, Utc};

use crate::models::{JobRecord, JobStatus, NewJob};
use crate::storage::WriteReport;
use crate::tracker::JobTracker;

pub struct AddArgs<'a> {
    pub job_id: &'a str,
    pub worker: Option<&'a str>,
    pub file_name: Option<&'a str>,
    pub file_size: Option<u64>,
    pub title: Option<&'a str>,
    pub description: Option<&'a str>,
}

/// Format the distance between `dt` and `now` as "5m ago" / "in 2h".
fn format_relative_time(dt: &DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = now.signed_duration_since(*dt).num_seconds();
    let abs = secs.unsigned_abs();
    let amount = if abs < 60 {
        format!("{}s", abs)
    } else if abs < 3600 {
        format!("{}m", abs / 60)
    } else if abs < 86400 {
        format!("{}h", abs / 3600)
    } else {
        format!("{}d", abs / 86400)
    };

    if secs < 0 {
        format!("in {}", amount)
    } else {
        format!("{} ago", amount)
    }
}

fn truncate(value: &str, width: usize) -> String {
    if value.chars().count() > width {
        let kept: String = value.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", kept)
    } else {
        value.to_string()
    }
}

fn warn_unpersisted(report: &WriteReport) {
    if let Some(ref e) = report.persist_error {
        eprintln!("Warning: change applied in memory but not saved: {}", e);
    }
}

/// jobwatch add
pub async fn cmd_add(tracker: &JobTracker, args: AddArgs<'_>) -> anyhow::Result<()> {
    let mut new = NewJob::new(args.job_id);
    new.worker_address = args.worker.map(str::to_string);
    new.file_name = args.file_name.map(str::to_string);
    new.file_size = args.file_size;
    new.title = args.title.map(str::to_string);
    new.description = args.description.map(str::to_string);

    let report = tracker.submit(new).await?;
    warn_unpersisted(&report);

    println!("Job '{}' added.", args.job_id);
    if let Some(job) = tracker.store().get_job(args.job_id).await {
        if let Some(deadline) = job.deadline {
            println!("  Deadline: {}", deadline.to_rfc3339());
        }
    }
    Ok(())
}

/// jobwatch list
pub async fn cmd_list(
    tracker: &JobTracker,
    json: bool,
    status: Option<JobStatus>,
) -> anyhow::Result<()> {
    let jobs: Vec<JobRecord> = tracker
        .store()
        .list_jobs()
        .await
        .into_iter()
        .filter(|job| status.map_or(true, |s| job.status == s))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    let now = Utc::now();
    println!(
        "{:<24}{:<14}{:<14}{:<14}{:<20}",
        "JOB ID", "STATUS", "REQUESTED", "CHECKED", "RESULT"
    );
    for job in &jobs {
        let requested = job
            .requested_at
            .map(|t| format_relative_time(&t, now))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24}{:<14}{:<14}{:<14}{:<20}",
            truncate(&job.job_id, 23),
            job.status,
            requested,
            format_relative_time(&job.last_checked_at, now),
            truncate(job.result_id.as_deref().unwrap_or("-"), 19),
        );
    }
    Ok(())
}

/// jobwatch show
pub async fn cmd_show(tracker: &JobTracker, job_id: &str, json: bool) -> anyhow::Result<()> {
    let Some(job) = tracker.store().get_job(job_id).await else {
        anyhow::bail!("Job '{}' not found", job_id);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&job)?);
        return Ok(());
    }

    let opt = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
    let time = |v: Option<DateTime<Utc>>| {
        v.map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string())
    };

    println!("Job:          {}", job.job_id);
    println!("Status:       {}", job.status);
    println!("Worker:       {}", opt(&job.worker_address));
    println!("Requested:    {}", time(job.requested_at));
    println!("Deadline:     {}", time(job.deadline));
    println!("Last checked: {}", job.last_checked_at.to_rfc3339());
    println!("Result:       {}", opt(&job.result_id));
    if let Some(ref reason) = job.failure_reason {
        println!("Failure:      {}", reason);
    }
    if let Some(ref name) = job.file_name {
        match job.file_size {
            Some(size) => println!("File:         {} ({} bytes)", name, size),
            None => println!("File:         {}", name),
        }
    }
    if let Some(ref title) = job.title {
        println!("Title:        {}", title);
    }
    if let Some(ref description) = job.description {
        println!("Description:  {}", description);
    }
    Ok(())
}

/// jobwatch remove
pub async fn cmd_remove(tracker: &JobTracker, job_id: &str, yes: bool) -> anyhow::Result<()> {
    if !yes {
        print!("Stop tracking job '{}'? [y/N] ", job_id);
        io::stdout().flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        let answer = line.trim().to_lowercase();
        if answer != "y" && answer != "yes" {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let report = tracker.store().remove_job(job_id).await?;
    warn_unpersisted(&report);
    if report.applied {
        println!("Job '{}' removed.", job_id);
    } else {
        println!("Job '{}' was not tracked.", job_id);
    }
    Ok(())
}

/// jobwatch resubmit
pub async fn cmd_resubmit(
    tracker: &JobTracker,
    job_id: &str,
    worker: Option<String>,
) -> anyhow::Result<()> {
    let report = tracker.resubmit(job_id, worker).await?;
    if !report.applied {
        anyhow::bail!("Job '{}' not found", job_id);
    }
    warn_unpersisted(&report);
    println!("Job '{}' is pending again.", job_id);
    Ok(())
}
