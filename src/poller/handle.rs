use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::events::PollEvent;
use crate::poller::PollTask;

/// Runs exactly once when a subscription is cancelled.
pub type Teardown = Box<dyn FnOnce() + Send + 'static>;

/// Marks a handle whose generation is no longer live.
const RETIRED: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PollState {
    Idle,
    Running,
    Cancelled,
}

/// A check result tagged with the generation and cycle that produced it.
struct CycleResult<O> {
    generation: u64,
    cycle: u64,
    payload: anyhow::Result<O>,
}

struct Shared {
    name: String,
    generation: u64,
    live: AtomicU64,
    cycles: AtomicU64,
    token: CancellationToken,
    teardown: Mutex<Option<Teardown>>,
    events: broadcast::Sender<PollEvent>,
}

impl Shared {
    fn accepts(&self, generation: u64) -> bool {
        !self.token.is_cancelled() && self.live.load(Ordering::SeqCst) == generation
    }

    fn cancel(&self) -> bool {
        if self
            .live
            .compare_exchange(self.generation, RETIRED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.token.cancel();

        let teardown = self
            .teardown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(teardown) = teardown {
            teardown();
        }

        let cycles = self.cycles.load(Ordering::SeqCst);
        tracing::debug!(
            "Poll subscription '{}' (gen {}) cancelled after {} cycle(s)",
            self.name,
            self.generation,
            cycles
        );
        let _ = self.events.send(PollEvent::Cancelled {
            subscription: self.name.clone(),
            generation: self.generation,
            cycles,
        });
        true
    }
}

/// Whether the generation that produced a check result is still live.
///
/// Handed to [`PollTask::apply`] so the side effect can re-check liveness
/// under its own lock, right before it commits.
#[derive(Clone)]
pub struct Liveness {
    shared: Option<Arc<Shared>>,
    generation: u64,
}

impl Liveness {
    fn of(shared: &Arc<Shared>, generation: u64) -> Self {
        Self {
            shared: Some(Arc::clone(shared)),
            generation,
        }
    }

    /// Never expires. For driving a task outside a polling loop.
    pub fn detached() -> Self {
        Self {
            shared: None,
            generation: RETIRED,
        }
    }

    pub fn is_live(&self) -> bool {
        match &self.shared {
            Some(shared) => shared.accepts(self.generation),
            None => true,
        }
    }
}

/// Handle to one running polling loop. Dropping the handle cancels it.
pub struct PollHandle {
    shared: Arc<Shared>,
    join: JoinHandle<()>,
}

impl PollHandle {
    /// Start polling `task` every `interval` under `generation`, which must
    /// be unique among the caller's handles and non-zero. The first check
    /// runs one full interval after this call. Must be called inside a tokio
    /// runtime.
    pub fn spawn<T: PollTask>(
        name: impl Into<String>,
        generation: u64,
        task: T,
        interval: Duration,
        on_teardown: Option<Teardown>,
        events: broadcast::Sender<PollEvent>,
    ) -> Self {
        let shared = Arc::new(Shared {
            name: name.into(),
            generation,
            live: AtomicU64::new(generation),
            cycles: AtomicU64::new(0),
            token: CancellationToken::new(),
            teardown: Mutex::new(on_teardown),
            events,
        });
        tracing::debug!(
            "Starting poll subscription '{}' (gen {}, every {:?})",
            shared.name,
            generation,
            interval
        );

        let join = tokio::spawn(run_loop(Arc::clone(&shared), task, interval));
        Self { shared, join }
    }

    /// Stop the loop. No further checks start; a check already in flight is
    /// left to finish and its result is discarded. The teardown callback runs
    /// before this returns, exactly once across all calls.
    pub fn cancel(&self) -> bool {
        self.shared.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == PollState::Cancelled
    }

    pub fn state(&self) -> PollState {
        if self.shared.live.load(Ordering::SeqCst) == RETIRED {
            PollState::Cancelled
        } else {
            PollState::Running
        }
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Completed check cycles.
    pub fn cycles(&self) -> u64 {
        self.shared.cycles.load(Ordering::SeqCst)
    }

    /// True once the loop task has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.shared.cancel();
    }
}

async fn run_loop<T: PollTask>(shared: Arc<Shared>, task: T, interval: Duration) {
    let generation = shared.generation;
    let mut cycle: u64 = 0;
    let mut next_start = Instant::now() + interval;

    loop {
        tokio::select! {
            biased;
            _ = shared.token.cancelled() => break,
            _ = tokio::time::sleep_until(next_start) => {}
        }
        if !shared.accepts(generation) {
            break;
        }

        // The next deadline is fixed before the check runs, so a slow check
        // shortens the following wait instead of pushing the schedule back.
        let cycle_start = Instant::now();
        next_start = cycle_start + interval;
        tracing::debug!("'{}' gen {} cycle {}", shared.name, generation, cycle);

        let result = CycleResult {
            generation,
            cycle,
            payload: task.check(cycle).await,
        };

        if !shared.accepts(result.generation) {
            tracing::debug!(
                "Discarding late result of '{}' gen {} cycle {}",
                shared.name,
                result.generation,
                result.cycle
            );
            let _ = shared.events.send(PollEvent::StaleResultDiscarded {
                subscription: shared.name.clone(),
                generation: result.generation,
                cycle: result.cycle,
            });
            break;
        }

        match result.payload {
            Ok(output) => {
                let live = Liveness::of(&shared, generation);
                if let Err(e) = task.apply(output, &live).await {
                    tracing::warn!(
                        "Applying result of '{}' cycle {} failed: {:#}",
                        shared.name,
                        result.cycle,
                        e
                    );
                    let _ = shared.events.send(PollEvent::ApplyFailed {
                        subscription: shared.name.clone(),
                        generation,
                        cycle: result.cycle,
                        error: format!("{:#}", e),
                    });
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Check '{}' cycle {} failed: {:#}",
                    shared.name,
                    result.cycle,
                    e
                );
                let _ = shared.events.send(PollEvent::CheckFailed {
                    subscription: shared.name.clone(),
                    generation,
                    cycle: result.cycle,
                    error: format!("{:#}", e),
                });
            }
        }

        cycle += 1;
        shared.cycles.store(cycle, Ordering::SeqCst);
    }
}
