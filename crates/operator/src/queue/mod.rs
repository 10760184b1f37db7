//! Deduplicating, rate-limited work queue.
//!
//! Semantics:
//! * an item waiting in the queue is stored once, however often it is added;
//! * an item being processed is never handed to a second worker; adding it
//!   meanwhile marks it dirty and it is queued again when [`WorkQueue::done`]
//!   is called;
//! * failed items are re-added through [`WorkQueue::add_rate_limited`] with
//!   per-item exponential backoff, reset by [`WorkQueue::forget`];
//! * after [`WorkQueue::shut_down`] every blocked and future `get` returns `None`.

pub mod backoff;
pub mod key;

use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use crate::metrics;
use backoff::ExponentialBackoff;

pub use key::WorkKey;

pub const DEFAULT_BACKOFF_MIN: Duration = Duration::from_secs(5);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    backoff: Mutex<ExponentialBackoff<T>>,
    notify: Notify,
}

/// Cheaply clonable handle; all clones share one queue.
pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Default for WorkQueue<T>
where
    T: Eq + Hash + Clone + Debug + Send + 'static,
{
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_MIN, DEFAULT_BACKOFF_MAX)
    }
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Debug + Send + 'static,
{
    pub fn new(backoff_min: Duration, backoff_max: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                backoff: Mutex::new(ExponentialBackoff::new(backoff_min, backoff_max)),
                notify: Notify::new(),
            }),
        }
    }

    pub fn add(&self, item: T) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            debug!(?item, "Item is being processed, will requeue when done");
            return;
        }
        state.queue.push_back(item);
        metrics::QUEUE_DEPTH.set(state.queue.len() as i64);
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Add `item` once `delay` has elapsed
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Re-add a failed item after its backoff delay
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.backoff().when(&item);
        metrics::QUEUE_RETRIES_TOTAL.inc();
        debug!(?item, ?delay, "Requeueing with backoff");
        self.add_after(item, delay);
    }

    /// Clear the backoff history of `item`
    pub fn forget(&self, item: &T) {
        self.backoff().forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.backoff().num_requeues(item)
    }

    /// Wait for the next item. `None` means the queue was shut down.
    ///
    /// The returned item must be handed back through [`WorkQueue::done`].
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    metrics::QUEUE_DEPTH.set(state.queue.len() as i64);
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        // Hand the wakeup on so other idle workers see the backlog.
                        self.shared.notify.notify_one();
                    }
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark `item` as finished; if it was added while processing it is queued again.
    pub fn done(&self, item: &T) {
        let mut state = self.state();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            metrics::QUEUE_DEPTH.set(state.queue.len() as i64);
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.shared.notify.notify_waiters();
    }

    /// Number of items waiting (not counting those being processed)
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn backoff(&self) -> MutexGuard<'_, ExponentialBackoff<T>> {
        self.shared
            .backoff
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
