//! Repeating status checks with drift compensation and safe cancellation.
//!
//! A [`PollHandle`] owns one loop: wait until the cycle deadline, run
//! [`PollTask::check`], and apply its output only if the handle's generation
//! is still live. [`PollingScheduler`] keeps at most one handle per logical
//! subscription key and restarts it when the dependency set changes.

pub mod handle;
pub mod scheduler;

use anyhow::Result;
use async_trait::async_trait;

pub use handle::{Liveness, PollHandle, PollState, Teardown};
pub use scheduler::PollingScheduler;

/// Work driven by a polling loop.
///
/// `check` performs the remote call and must not mutate shared state;
/// `apply` performs the side effect and only runs for results of a live
/// generation. A cancel can still land while `apply` runs, so `apply` must
/// check `live` under the same lock that guards its writes and commit all of
/// them or none.
#[async_trait]
pub trait PollTask: Send + Sync + 'static {
    type Output: Send + 'static;

    async fn check(&self, cycle: u64) -> Result<Self::Output>;

    async fn apply(&self, output: Self::Output, live: &Liveness) -> Result<()>;
}
