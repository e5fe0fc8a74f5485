use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::models::JobRecord;

/// Serializes a shared snapshot as a plain JSON array.
fn serialize_snapshot<S>(data: &Arc<Vec<JobRecord>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    data.as_slice().serialize(serializer)
}

/// Sent to store observers after every applied mutation.
#[derive(Debug, Clone, Serialize)]
pub struct StoreChange {
    pub kind: ChangeKind,
    pub job_id: String,
    #[serde(serialize_with = "serialize_snapshot")]
    pub snapshot: Arc<Vec<JobRecord>>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Updated,
    Removed,
}

/// Reported by polling subscriptions on their event channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum PollEvent {
    CheckFailed {
        subscription: String,
        generation: u64,
        cycle: u64,
        error: String,
    },
    ApplyFailed {
        subscription: String,
        generation: u64,
        cycle: u64,
        error: String,
    },
    StaleResultDiscarded {
        subscription: String,
        generation: u64,
        cycle: u64,
    },
    Cancelled {
        subscription: String,
        generation: u64,
        cycles: u64,
    },
}
