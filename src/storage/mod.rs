pub mod blob;
pub mod jobs;

use anyhow::Result;
use async_trait::async_trait;

pub use blob::{FsBlobStore, MemoryBlobStore};
pub use jobs::{BatchReport, JobStore, WriteReport, JOBS_NAMESPACE};

/// Durable key/value blob storage used to persist the job table.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;
}
