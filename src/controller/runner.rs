//! Controller Runner
//!
//! Wires event sources to the work queue and drives reconcile workers. Events
//! for VolumePools enqueue the pool itself, events for owned children enqueue
//! the pool named by their back-reference label, and VolumeClass events enqueue
//! every pool seen so far since any of them may advertise the class.

use crate::controller::naming::owning_pool;
use crate::controller::queue::{WorkQueue, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};
use crate::controller::reconciler::VolumePoolReconciler;
use crate::crd::{VolumeClass, VolumePool};
use crate::domain::ports::{Object, ObjectKey};
use crate::error::ErrorAction;
use crate::event::{Event, EventType, Handler, HandlerRegistration, Source};
use crate::metrics::{Metrics, ReconcileResult};
use dashmap::DashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default number of concurrent reconcile workers
pub const DEFAULT_WORKERS: usize = 2;

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Number of keys reconciled concurrently
    pub workers: usize,
    /// First retry delay for failing keys
    pub base_retry_delay: Duration,
    /// Retry delay ceiling
    pub max_retry_delay: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            base_retry_delay: DEFAULT_BASE_DELAY,
            max_retry_delay: DEFAULT_MAX_DELAY,
        }
    }
}

/// Runs the VolumePool reconciler off a de-duplicating work queue
pub struct VolumePoolController {
    reconciler: Arc<VolumePoolReconciler>,
    queue: Arc<WorkQueue<ObjectKey>>,
    known_pools: Arc<DashSet<ObjectKey>>,
    workers: usize,
    metrics: Option<Arc<Metrics>>,
}

impl VolumePoolController {
    pub fn new(
        reconciler: Arc<VolumePoolReconciler>,
        options: ControllerOptions,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        let mut queue = WorkQueue::with_backoff(options.base_retry_delay, options.max_retry_delay);
        if let Some(metrics) = &metrics {
            queue = queue.with_metrics(metrics.clone());
        }

        Self {
            reconciler,
            queue: Arc::new(queue),
            known_pools: Arc::new(DashSet::new()),
            workers: options.workers.max(1),
            metrics,
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue<ObjectKey>> {
        &self.queue
    }

    // =========================================================================
    // Event Wiring
    // =========================================================================

    /// Enqueue the pool on every VolumePool event
    pub fn watch_pools(&self, source: &dyn Source<VolumePool>) -> HandlerRegistration {
        let queue = self.queue.clone();
        let known = self.known_pools.clone();
        let handler = move |event: Event<VolumePool>| {
            let key = event.object.key();
            if event.event_type == EventType::Deleted {
                known.remove(&key);
            } else {
                known.insert(key.clone());
            }
            queue.add(key);
        };
        source.add_handler(Arc::new(handler) as Arc<dyn Handler<VolumePool>>)
    }

    /// Enqueue the owning pool of a child resource
    pub fn watch_owned<K: Object>(&self, source: &dyn Source<K>) -> HandlerRegistration {
        let queue = self.queue.clone();
        let handler = move |event: Event<K>| match owning_pool(&event.object) {
            Some(key) => queue.add(key),
            None => debug!(object = %event.object.key(), "Ignoring object without pool label"),
        };
        source.add_handler(Arc::new(handler) as Arc<dyn Handler<K>>)
    }

    /// Enqueue every known pool when a VolumeClass changes
    pub fn watch_volume_classes(&self, source: &dyn Source<VolumeClass>) -> HandlerRegistration {
        let queue = self.queue.clone();
        let known = self.known_pools.clone();
        let handler = move |event: Event<VolumeClass>| {
            if event.event_type == EventType::Generic {
                // Periodic resyncs of VolumePools already cover every pool
                return;
            }
            for key in known.iter() {
                queue.add(key.clone());
            }
        };
        source.add_handler(Arc::new(handler) as Arc<dyn Handler<VolumeClass>>)
    }

    // =========================================================================
    // Workers
    // =========================================================================

    /// Run the workers until `cancel` fires, then drain them
    pub async fn run(&self, cancel: CancellationToken) {
        info!(workers = self.workers, "Starting VolumePool controller");

        let mut handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let queue = self.queue.clone();
            let reconciler = self.reconciler.clone();
            let metrics = self.metrics.clone();
            handles.push(tokio::spawn(async move {
                while let Some(key) = queue.get().await {
                    process(&queue, &reconciler, metrics.as_deref(), &key).await;
                    queue.done(&key);
                }
                debug!(worker, "Worker stopped");
            }));
        }

        cancel.cancelled().await;
        info!("Shutting down VolumePool controller");
        self.queue.shutdown();

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker panicked");
            }
        }
    }
}

/// Reconcile one key and schedule its follow-up according to the outcome
async fn process(
    queue: &Arc<WorkQueue<ObjectKey>>,
    reconciler: &VolumePoolReconciler,
    metrics: Option<&Metrics>,
    key: &ObjectKey,
) {
    let started = Instant::now();
    let result = reconciler.reconcile(key).await;
    let elapsed = started.elapsed();

    let outcome = match result {
        Ok(()) => {
            queue.forget(key);
            ReconcileResult::Success
        }
        Err(e) => {
            let action = e.action();
            if e.is_not_ready() {
                info!(pool = %key, reason = %e, "Waiting for dependency");
            } else if e.is_retryable() {
                warn!(pool = %key, error = %e, requeues = queue.num_requeues(key), "Reconcile failed");
            } else {
                error!(pool = %key, error = %e, "Reconcile failed permanently");
            }

            match action {
                ErrorAction::RequeueWithBackoff => queue.add_rate_limited(key.clone()),
                ErrorAction::RequeueAfter(delay) => {
                    queue.forget(key);
                    queue.add_after(key.clone(), delay);
                }
                ErrorAction::NoRequeue => queue.forget(key),
            }

            if e.is_not_ready() {
                ReconcileResult::NotReady
            } else {
                ReconcileResult::Error
            }
        }
    };

    if let Some(metrics) = metrics {
        metrics.record_reconcile(outcome, elapsed);
    }
}
