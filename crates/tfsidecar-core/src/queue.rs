//! Rate-limited work queue feeding the state-update worker.
//!
//! The queue collapses duplicate adds of a key that is currently being
//! processed into a single follow-up item, so a burst of file-watcher
//! events results in at most one queued update behind the in-flight one.
//! `add_rate_limited` re-queues a key after a per-key exponential backoff
//! delay; `shut_down` stops accepting new items but keeps everything
//! already enqueued (including deferred retries) so callers can drain.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

/// Initial backoff delay for rate-limited re-adds.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(10);

/// Backoff delay ceiling for rate-limited re-adds.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
struct QueueState<K> {
    ready: VecDeque<K>,
    /// Keys queued or waiting to be re-queued after processing.
    dirty: HashSet<K>,
    /// Keys currently being processed.
    processing: HashSet<K>,
    /// Per-key failure counts driving the backoff delay.
    failures: HashMap<K, u32>,
    /// Keys parked until their backoff delay elapses.
    deferred: Vec<(Instant, K)>,
    shutting_down: bool,
}

impl<K> QueueState<K> {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            failures: HashMap::new(),
            deferred: Vec::new(),
            shutting_down: false,
        }
    }
}

/// A FIFO work queue with per-key deduplication and exponential backoff.
#[derive(Debug)]
pub struct UpdateQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl<K> Default for UpdateQueue<K>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl<K> UpdateQueue<K>
where
    K: Clone + Eq + Hash,
{
    /// Create a queue with the given backoff floor and ceiling.
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::new()),
            notify: Notify::new(),
            base_delay,
            max_delay,
        }
    }

    /// Enqueue `key` for processing.
    ///
    /// Dropped silently once the queue is shut down. If the key is already
    /// queued, or queued behind an in-flight processing of the same key,
    /// the call is a no-op.
    pub fn add(&self, key: K) {
        {
            let mut state = self.state.lock().unwrap();
            if state.shutting_down {
                return;
            }
            Self::enqueue(&mut state, key);
        }
        self.notify.notify_one();
    }

    /// Re-enqueue `key` after its exponential backoff delay.
    ///
    /// Each call bumps the key's failure count; [`UpdateQueue::forget`]
    /// resets it. Dropped silently once the queue is shut down.
    pub fn add_rate_limited(&self, key: K) {
        {
            let mut state = self.state.lock().unwrap();
            if state.shutting_down {
                return;
            }
            let failures = state.failures.entry(key.clone()).or_insert(0);
            *failures += 1;
            let delay = self.backoff_delay(*failures);
            trace!(failures = *failures, ?delay, "deferring item");
            state.deferred.push((Instant::now() + delay, key));
        }
        self.notify.notify_one();
    }

    /// Dequeue the next item, waiting until one is available.
    ///
    /// Returns `None` once the queue has been shut down and fully drained.
    /// The returned key is marked as processing; callers must pass it to
    /// [`UpdateQueue::done`] when finished.
    pub async fn get(&self) -> Option<K> {
        loop {
            let next_deadline = {
                let mut state = self.state.lock().unwrap();
                let now = Instant::now();

                let mut i = 0;
                while i < state.deferred.len() {
                    if state.deferred[i].0 <= now {
                        let (_, key) = state.deferred.swap_remove(i);
                        Self::enqueue(&mut state, key);
                    } else {
                        i += 1;
                    }
                }

                if let Some(key) = state.ready.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }

                if state.shutting_down && state.deferred.is_empty() {
                    return None;
                }

                state.deferred.iter().map(|(at, _)| *at).min()
            };

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        () = self.notify.notified() => {}
                        () = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Mark `key` as processed.
    ///
    /// If the key was re-added while it was being processed, it is moved
    /// back onto the ready queue now.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.state.lock().unwrap();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.ready.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Clear the backoff history for `key`.
    pub fn forget(&self, key: &K) {
        self.state.lock().unwrap().failures.remove(key);
    }

    /// Number of items queued or deferred (excluding the one being
    /// processed).
    #[must_use]
    pub fn len(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.ready.len() + state.deferred.len()
    }

    /// Returns `true` if no items are queued or deferred.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting new items.
    ///
    /// Items already enqueued (including deferred retries) remain and can
    /// still be dequeued; [`UpdateQueue::get`] returns `None` once they
    /// are gone.
    pub fn shut_down(&self) {
        self.state.lock().unwrap().shutting_down = true;
        self.notify.notify_one();
    }

    fn enqueue(state: &mut QueueState<K>, key: K) {
        if state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if !state.processing.contains(&key) {
            state.ready.push_back(key);
        }
    }

    fn backoff_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(63);
        let secs = self.base_delay.as_secs_f64() * 2f64.powi(exponent as i32);
        Duration::from_secs_f64(secs).min(self.max_delay)
    }
}
