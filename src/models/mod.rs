pub mod check;
pub mod config;
pub mod job;

pub use check::CheckOutcome;
pub use config::TrackerConfig;
pub use job::{JobPatch, JobRecord, JobStatus, NewJob};
