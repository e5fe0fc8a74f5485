use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::TrackerError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Completed,
    Failed,
    Reassignable,
}

impl JobStatus {
    /// Completed and Failed accept no further status changes.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether `self -> next` is a legal lifecycle move. Staying in the same
    /// status is not a move and is always allowed.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Completed)
                | (Pending, Failed)
                | (Pending, Reassignable)
                | (Reassignable, Pending)
                | (Reassignable, Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Reassignable => "reassignable",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "reassignable" => Ok(JobStatus::Reassignable),
            other => Err(TrackerError::Validation(format!(
                "Unknown job status '{}'",
                other
            ))),
        }
    }
}

/// One tracked indexing job, keyed by the content identifier of the video.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: String,
    pub result_id: Option<String>,
    pub worker_address: Option<String>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub requested_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub deadline: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_checked_at: DateTime<Utc>,
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl JobRecord {
    /// True once `deadline` lies at or before `now`.
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }
}

/// Fields supplied when a job is submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    pub job_id: String,
    #[serde(default = "default_status")]
    pub status: JobStatus,
    pub result_id: Option<String>,
    pub worker_address: Option<String>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub requested_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub deadline: Option<DateTime<Utc>>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub title: Option<String>,
    pub description: Option<String>,
}

fn default_status() -> JobStatus {
    JobStatus::Pending
}

impl NewJob {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Pending,
            result_id: None,
            worker_address: None,
            requested_at: None,
            deadline: None,
            file_name: None,
            file_size: None,
            title: None,
            description: None,
        }
    }
}

/// Partial overlay for `JobStore::update_job`. Every `Some` field overwrites
/// the stored value; `None` leaves it alone.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub result_id: Option<String>,
    pub worker_address: Option<String>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub requested_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub deadline: Option<DateTime<Utc>>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub failure_reason: Option<String>,
}

impl JobPatch {
    pub fn completed(result_id: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            result_id: Some(result_id.into()),
            ..Default::default()
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            failure_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

fn check_result_invariant(
    job_id: &str,
    status: JobStatus,
    result_id: Option<&str>,
) -> Result<(), TrackerError> {
    match (status, result_id) {
        (JobStatus::Completed, None) => Err(TrackerError::Validation(format!(
            "Job '{}' cannot be completed without a result id",
            job_id
        ))),
        (JobStatus::Completed, Some(_)) => Ok(()),
        (other, Some(_)) => Err(TrackerError::Validation(format!(
            "Job '{}' cannot carry a result id while {}",
            job_id, other
        ))),
        (_, None) => Ok(()),
    }
}

/// Validate a NewJob before insertion.
pub fn validate_new_job(job: &NewJob) -> Result<(), TrackerError> {
    if job.job_id.trim().is_empty() {
        return Err(TrackerError::Validation(
            "Job id cannot be empty".to_string(),
        ));
    }
    check_result_invariant(&job.job_id, job.status, job.result_id.as_deref())
}

/// Validate `patch` against the record it would be merged into.
pub fn validate_patch(record: &JobRecord, patch: &JobPatch) -> Result<(), TrackerError> {
    let next_status = patch.status.unwrap_or(record.status);
    if !record.status.can_transition_to(next_status) {
        return Err(TrackerError::InvalidTransition {
            job_id: record.job_id.clone(),
            from: record.status,
            to: next_status,
        });
    }

    // A status move away from Completed is already rejected above, so the
    // merged result id is either the patch's or the stored one.
    let next_result = patch.result_id.as_deref().or(record.result_id.as_deref());
    check_result_invariant(&record.job_id, next_status, next_result)?;

    if let (Some(current), Some(new)) = (&record.file_name, &patch.file_name) {
        if current != new {
            return Err(TrackerError::Validation(format!(
                "Job '{}' file name is immutable",
                record.job_id
            )));
        }
    }
    if let (Some(current), Some(new)) = (record.file_size, patch.file_size) {
        if current != new {
            return Err(TrackerError::Validation(format!(
                "Job '{}' file size is immutable",
                record.job_id
            )));
        }
    }

    Ok(())
}

/// Overlay every `Some` field of `patch` onto `record`. Callers validate first.
pub fn merge_patch(record: &mut JobRecord, patch: JobPatch) {
    if let Some(status) = patch.status {
        record.status = status;
    }
    if let Some(result_id) = patch.result_id {
        record.result_id = Some(result_id);
    }
    if let Some(worker_address) = patch.worker_address {
        record.worker_address = Some(worker_address);
    }
    if let Some(requested_at) = patch.requested_at {
        record.requested_at = Some(requested_at);
    }
    if let Some(deadline) = patch.deadline {
        record.deadline = Some(deadline);
    }
    if let Some(file_name) = patch.file_name {
        record.file_name = Some(file_name);
    }
    if let Some(file_size) = patch.file_size {
        record.file_size = Some(file_size);
    }
    if let Some(title) = patch.title {
        record.title = Some(title);
    }
    if let Some(description) = patch.description {
        record.description = Some(description);
    }
    if let Some(failure_reason) = patch.failure_reason {
        record.failure_reason = Some(failure_reason);
    }
}
