use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast;

use crate::events::PollEvent;
use crate::poller::{PollHandle, PollState, PollTask, Teardown};

struct Subscription {
    deps: BTreeSet<String>,
    handle: PollHandle,
}

/// Registry of named polling subscriptions, at most one live loop per key.
///
/// The map lock is never held while a teardown runs or across an await, so
/// independent keys never contend beyond a short map access.
pub struct PollingScheduler {
    interval: Duration,
    events: broadcast::Sender<PollEvent>,
    /// Next generation to hand out. Starts at 1; 0 marks a retired handle.
    generations: AtomicU64,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl PollingScheduler {
    pub fn new(interval: Duration, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            interval,
            events,
            generations: AtomicU64::new(1),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Receive check failures, discarded results and cancellations from every
    /// subscription of this scheduler.
    pub fn subscribe_events(&self) -> broadcast::Receiver<PollEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Subscription>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start polling `task` under `key`, bound to `deps`. A subscription
    /// already running under `key` is fully cancelled first, teardown
    /// included. Returns the new generation.
    pub fn start<T: PollTask>(
        &self,
        key: &str,
        deps: BTreeSet<String>,
        task: T,
        on_teardown: Option<Teardown>,
    ) -> u64 {
        let previous = self.lock().remove(key);
        if let Some(previous) = previous {
            tracing::debug!(
                "Restarting poll subscription '{}' (gen {})",
                key,
                previous.handle.generation()
            );
            previous.handle.cancel();
        }

        let generation = self.generations.fetch_add(1, Ordering::SeqCst);
        let handle = PollHandle::spawn(
            key,
            generation,
            task,
            self.interval,
            on_teardown,
            self.events.clone(),
        );
        tracing::info!(
            "Polling '{}' for {} dependency(ies) (gen {})",
            key,
            deps.len(),
            generation
        );

        // A concurrent start may have slipped in; the later insert wins and
        // the displaced loop is cancelled outside the lock.
        let displaced = self
            .lock()
            .insert(key.to_string(), Subscription { deps, handle });
        if let Some(displaced) = displaced {
            displaced.handle.cancel();
        }
        generation
    }

    /// Dependency-driven restart. If `deps` matches the live subscription
    /// nothing happens; otherwise the old loop is cancelled and a new one is
    /// started from cycle zero with a task built by `make_task`. An empty
    /// dependency set just cancels. Returns true when anything changed.
    pub fn sync<T, F>(&self, key: &str, deps: BTreeSet<String>, make_task: F) -> bool
    where
        T: PollTask,
        F: FnOnce(&BTreeSet<String>) -> T,
    {
        {
            let subscriptions = self.lock();
            if let Some(current) = subscriptions.get(key) {
                if current.deps == deps && !current.handle.is_cancelled() {
                    return false;
                }
            } else if deps.is_empty() {
                return false;
            }
        }

        if deps.is_empty() {
            return self.cancel(key);
        }

        let task = make_task(&deps);
        self.start(key, deps, task, None);
        true
    }

    /// Cancel the subscription under `key`. Returns false if none was live.
    pub fn cancel(&self, key: &str) -> bool {
        let removed = self.lock().remove(key);
        match removed {
            Some(subscription) => {
                tracing::info!("Stopped polling '{}'", key);
                subscription.handle.cancel()
            }
            None => false,
        }
    }

    /// Cancel every subscription.
    pub fn shutdown(&self) {
        let drained: Vec<(String, Subscription)> = self.lock().drain().collect();
        for (key, subscription) in drained {
            tracing::debug!("Shutting down poll subscription '{}'", key);
            subscription.handle.cancel();
        }
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.state(key) == PollState::Running
    }

    pub fn state(&self, key: &str) -> PollState {
        self.lock()
            .get(key)
            .map(|s| s.handle.state())
            .unwrap_or(PollState::Idle)
    }

    pub fn dependencies(&self, key: &str) -> Option<BTreeSet<String>> {
        self.lock().get(key).map(|s| s.deps.clone())
    }

    pub fn generation(&self, key: &str) -> Option<u64> {
        self.lock().get(key).map(|s| s.handle.generation())
    }

    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}
