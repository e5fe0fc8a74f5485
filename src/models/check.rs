use serde::{Deserialize, Serialize};

/// What the remote worker reported for a single job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckOutcome {
    #[serde(rename = "pending")]
    StillPending,
    Completed {
        result_id: String,
    },
    Failed {
        #[serde(default)]
        reason: String,
    },
}
