//! Work Queue
//!
//! Keyed queue feeding the reconcile workers. A key sits in the queue at most
//! once, and a key being processed is never handed to a second worker: adding
//! it again only marks it dirty so it is queued once the current pass is
//! `done`. Failed keys come back through `add_rate_limited` with a per-key
//! exponential delay.

use crate::metrics::Metrics;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// First retry delay of a failing key
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Retry delay ceiling
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

struct QueueState<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

struct Failures {
    requeues: u32,
    backoff: ExponentialBackoff,
}

/// De-duplicating work queue with per-key retry backoff
pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Notify,
    failures: DashMap<T, Failures>,
    base_delay: Duration,
    max_delay: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl<T> Default for WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_backoff(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }

    /// Queue with custom retry delay bounds
    pub fn with_backoff(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            available: Notify::new(),
            failures: DashMap::new(),
            base_delay,
            max_delay,
            metrics: None,
        }
    }

    /// Report the queue depth
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Queue `item` unless it is already waiting
    pub fn add(&self, item: T) {
        let mut state = self.state.lock();
        if state.shutting_down || !state.dirty.insert(item.clone()) {
            return;
        }
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        self.report_depth(state.queue.len());
        drop(state);
        self.available.notify_one();
    }

    /// Queue `item` once `delay` has passed
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Queue `item` after its next backoff delay
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = self.next_delay(&item);
        self.add_after(item, delay);
    }

    /// Reset the backoff of `item`
    pub fn forget(&self, item: &T) {
        self.failures.remove(item);
    }

    /// How often `item` was requeued since it was last forgotten
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.failures.get(item).map(|f| f.requeues).unwrap_or(0)
    }

    /// Wait for the next item. Returns `None` once the queue shuts down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    self.report_depth(state.queue.len());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark `item` as processed; it is queued again if it was added meanwhile
    pub fn done(&self, item: &T) {
        let mut state = self.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            self.report_depth(state.queue.len());
            drop(state);
            self.available.notify_one();
        }
    }

    /// Stop handing out items and wake every waiting worker
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.available.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Number of items waiting
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_delay(&self, item: &T) -> Duration {
        let mut entry = self.failures.entry(item.clone()).or_insert_with(|| Failures {
            requeues: 0,
            backoff: ExponentialBackoff {
                current_interval: self.base_delay,
                initial_interval: self.base_delay,
                randomization_factor: 0.0,
                multiplier: 2.0,
                max_interval: self.max_delay,
                max_elapsed_time: None,
                ..ExponentialBackoff::default()
            },
        });
        entry.requeues += 1;
        entry.backoff.next_backoff().unwrap_or(self.max_delay)
    }

    fn report_depth(&self, depth: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.set_queue_depth(depth);
        }
    }
}
