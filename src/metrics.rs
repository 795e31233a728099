//! Operator Metrics
//!
//! Prometheus collectors for event delivery, the work queue and reconciliation.
//! Collectors are registered into a caller supplied registry so tests can use a
//! private one.

use crate::error::Result;
use crate::event::EventType;
use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};
use std::time::Duration;

/// Outcome label for a reconcile pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileResult {
    Success,
    NotReady,
    Error,
}

impl ReconcileResult {
    fn as_str(&self) -> &'static str {
        match self {
            ReconcileResult::Success => "success",
            ReconcileResult::NotReady => "not_ready",
            ReconcileResult::Error => "error",
        }
    }
}

/// Collectors shared by the sources, the queue and the controller
pub struct Metrics {
    events: IntCounterVec,
    reconciles: IntCounterVec,
    reconcile_duration: Histogram,
    queue_depth: IntGauge,
}

impl Metrics {
    /// Create the collectors and register them in `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        let events = IntCounterVec::new(
            Opts::new("event_source_events_total", "Events dispatched to handlers"),
            &["kind", "type"],
        )
        .map_err(internal)?;
        let reconciles = IntCounterVec::new(
            Opts::new("volume_pool_reconcile_total", "VolumePool reconcile passes by result"),
            &["result"],
        )
        .map_err(internal)?;
        let reconcile_duration = Histogram::with_opts(HistogramOpts::new(
            "volume_pool_reconcile_duration_seconds",
            "Duration of VolumePool reconcile passes",
        ))
        .map_err(internal)?;
        let queue_depth = IntGauge::new("work_queue_depth", "Keys waiting in the work queue")
            .map_err(internal)?;

        registry.register(Box::new(events.clone())).map_err(internal)?;
        registry.register(Box::new(reconciles.clone())).map_err(internal)?;
        registry
            .register(Box::new(reconcile_duration.clone()))
            .map_err(internal)?;
        registry.register(Box::new(queue_depth.clone())).map_err(internal)?;

        Ok(Self {
            events,
            reconciles,
            reconcile_duration,
            queue_depth,
        })
    }

    #[inline]
    pub fn record_event(&self, kind: &str, event_type: EventType) {
        self.events
            .with_label_values(&[kind, event_type.as_str()])
            .inc();
    }

    pub fn record_reconcile(&self, result: ReconcileResult, elapsed: Duration) {
        self.reconciles.with_label_values(&[result.as_str()]).inc();
        self.reconcile_duration.observe(elapsed.as_secs_f64());
    }

    #[inline]
    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }
}

fn internal(e: prometheus::Error) -> crate::error::Error {
    crate::error::Error::Internal(format!("metrics registration failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_exported() {
        let registry = Registry::new();
        let metrics = Metrics::new(&registry).unwrap();

        metrics.record_event("VolumePool", EventType::Generic);
        metrics.record_event("VolumePool", EventType::Generic);
        metrics.record_reconcile(ReconcileResult::NotReady, Duration::from_millis(5));
        metrics.set_queue_depth(3);

        let families = registry.gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.contains(&"event_source_events_total".to_string()));
        assert!(names.contains(&"volume_pool_reconcile_total".to_string()));
        assert!(names.contains(&"work_queue_depth".to_string()));

        let events = families
            .iter()
            .find(|f| f.get_name() == "event_source_events_total")
            .unwrap();
        assert_eq!(events.get_metric()[0].get_counter().get_value(), 2.0);
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        let _first = Metrics::new(&registry).unwrap();
        assert!(Metrics::new(&registry).is_err());
    }
}
