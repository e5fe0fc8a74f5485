use thiserror::Error;

use crate::models::JobStatus;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Duplicate job: {0}")]
    DuplicateJob(String),

    #[error("Invalid transition for job '{job_id}': {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Check failure: {0}")]
    CheckFailure(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for TrackerError {
    fn from(err: serde_json::Error) -> Self {
        TrackerError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_job_display() {
        let err = TrackerError::DuplicateJob("cid-1".to_string());
        assert_eq!(err.to_string(), "Duplicate job: cid-1");
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = TrackerError::InvalidTransition {
            job_id: "cid-1".to_string(),
            from: JobStatus::Completed,
            to: JobStatus::Pending,
        };
        assert_eq!(
            err.to_string(),
            "Invalid transition for job 'cid-1': completed -> pending"
        );
    }

    #[test]
    fn test_validation_display() {
        let err = TrackerError::Validation("empty job id".to_string());
        assert_eq!(err.to_string(), "Validation error: empty job id");
    }

    #[test]
    fn test_check_failure_display() {
        let err = TrackerError::CheckFailure("worker unreachable".to_string());
        assert_eq!(err.to_string(), "Check failure: worker unreachable");
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<String>("not valid json").unwrap_err();
        let err: TrackerError = json_err.into();
        match err {
            TrackerError::Storage(_) => {}
            other => panic!("Expected Storage, got: {:?}", other),
        }
    }
}
