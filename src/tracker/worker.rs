use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};

use crate::models::CheckOutcome;

/// The remote indexing worker, reduced to a status query.
#[async_trait]
pub trait StatusClient: Send + Sync {
    async fn check_status(&self, job_id: &str) -> Result<CheckOutcome>;
}

/// Queries `GET {base_url}/jobs/{job_id}/status` and decodes the JSON body
/// straight into a `CheckOutcome`. The job id is percent-encoded as a single
/// path segment.
pub struct HttpStatusClient {
    client: Client,
    base_url: Url,
}

impl HttpStatusClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("Invalid worker URL '{}'", base_url))?;
        if base_url.cannot_be_a_base() {
            bail!("Worker URL '{}' cannot carry a path", base_url);
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, base_url })
    }

    pub fn status_url(&self, job_id: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("Worker URL '{}' cannot carry a path", self.base_url))?
            .pop_if_empty()
            .extend(["jobs", job_id, "status"]);
        Ok(url)
    }
}

#[async_trait]
impl StatusClient for HttpStatusClient {
    async fn check_status(&self, job_id: &str) -> Result<CheckOutcome> {
        let url = self.status_url(job_id)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Status request for '{}' failed", job_id))?
            .error_for_status()
            .with_context(|| format!("Worker rejected status request for '{}'", job_id))?;

        response
            .json::<CheckOutcome>()
            .await
            .with_context(|| format!("Malformed status response for '{}'", job_id))
    }
}
