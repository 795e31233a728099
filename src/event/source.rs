//! List/Watch Event Source
//!
//! Turns a [`ListWatch`] port into a stream of [`Event`]s delivered to every
//! registered [`Handler`]. Two relays run while the source is started:
//!
//! - the watch relay forwards live change notifications as they arrive
//! - the resync relay lists everything on a fixed period and emits a
//!   `Generic` event per object, so handlers converge even if a watch
//!   notification was lost
//!
//! The relays are independent dispatchers: a `Generic` event for an object may
//! be delivered before, after or interleaved with a watch event for the same
//! object. Handlers must tolerate duplicate and out-of-order delivery.

use crate::domain::ports::{ListWatchRef, WatchEventType};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default period between full resyncs
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(60 * 60);

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Events
// =============================================================================

/// Kind of an event delivered to handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Created,
    Updated,
    Deleted,
    /// Emitted by the periodic resync for every listed object
    Generic,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "Created",
            EventType::Updated => "Updated",
            EventType::Deleted => "Deleted",
            EventType::Generic => "Generic",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&WatchEventType> for EventType {
    type Error = Error;

    fn try_from(value: &WatchEventType) -> Result<Self> {
        match value {
            WatchEventType::Created => Ok(EventType::Created),
            WatchEventType::Updated => Ok(EventType::Updated),
            WatchEventType::Deleted => Ok(EventType::Deleted),
            WatchEventType::Other(other) => Err(Error::UnknownWatchEventType(other.clone())),
        }
    }
}

/// An event for one object
#[derive(Debug, Clone)]
pub struct Event<E> {
    pub event_type: EventType,
    pub object: E,
}

impl<E> Event<E> {
    pub fn new(event_type: EventType, object: E) -> Self {
        Self { event_type, object }
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Receiver of events. Called synchronously from the dispatching relay, so
/// implementations should hand the event off quickly.
pub trait Handler<E>: Send + Sync {
    fn handle(&self, event: Event<E>);
}

impl<E, F> Handler<E> for F
where
    F: Fn(Event<E>) + Send + Sync,
{
    fn handle(&self, event: Event<E>) {
        self(event)
    }
}

/// Opaque token returned by [`Source::add_handler`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerRegistration {
    source_id: u64,
    handle_id: u64,
}

/// Something handlers can be attached to
pub trait Source<E> {
    /// Register a handler; it receives events dispatched after this call
    fn add_handler(&self, handler: Arc<dyn Handler<E>>) -> HandlerRegistration;

    /// Remove a handler. Removing twice is fine; a token this source never
    /// issued is rejected with `Error::InvalidHandlerRegistration`.
    fn remove_handler(&self, registration: &HandlerRegistration) -> Result<()>;
}

// =============================================================================
// List/Watch Source
// =============================================================================

/// Options for a [`ListWatchSource`]
#[derive(Debug, Clone)]
pub struct ListWatchSourceOptions {
    /// Period between full resyncs; zero selects the default
    pub resync_interval: Duration,
    /// Kind name used in logs and metrics
    pub kind: String,
}

impl Default for ListWatchSourceOptions {
    fn default() -> Self {
        Self {
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            kind: "object".to_string(),
        }
    }
}

impl ListWatchSourceOptions {
    pub fn for_kind(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }
}

/// Event source over a list operation and a watch operation
pub struct ListWatchSource<E> {
    kind: String,
    list_watch: ListWatchRef<E>,
    resync_interval: Duration,
    source_id: u64,
    next_handle_id: AtomicU64,
    handlers: RwLock<BTreeMap<u64, Arc<dyn Handler<E>>>>,
    metrics: Option<Arc<Metrics>>,
}

impl<E> ListWatchSource<E>
where
    E: Clone + Send + Sync + 'static,
{
    /// Create a new source
    pub fn new(list_watch: ListWatchRef<E>, options: ListWatchSourceOptions) -> Self {
        let resync_interval = if options.resync_interval.is_zero() {
            DEFAULT_RESYNC_INTERVAL
        } else {
            options.resync_interval
        };

        Self {
            kind: options.kind,
            list_watch,
            resync_interval,
            source_id: NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed),
            next_handle_id: AtomicU64::new(0),
            handlers: RwLock::new(BTreeMap::new()),
            metrics: None,
        }
    }

    /// Count dispatched events
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn resync_interval(&self) -> Duration {
        self.resync_interval
    }

    /// Number of registered handlers
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Snapshot of the registered handlers
    fn handlers(&self) -> Vec<Arc<dyn Handler<E>>> {
        self.handlers.read().values().cloned().collect()
    }

    /// Deliver an event to every handler registered at this point
    fn dispatch(&self, event: Event<E>) {
        if let Some(metrics) = &self.metrics {
            metrics.record_event(&self.kind, event.event_type);
        }
        for handler in self.handlers() {
            handler.handle(event.clone());
        }
    }

    /// Run both relays until `cancel` fires.
    ///
    /// Fails immediately if the watch cannot be established; the resync relay
    /// is not started in that case.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let mut watch = self.list_watch.watch().await.map_err(|e| Error::WatchSetup {
            kind: self.kind.clone(),
            reason: e.to_string(),
        })?;

        info!(
            kind = %self.kind,
            resync_interval = ?self.resync_interval,
            "Starting list/watch source"
        );

        let watch_relay = async {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    evt = watch.next() => {
                        let Some(evt) = evt else {
                            warn!(kind = %self.kind, "Watch channel closed");
                            break;
                        };
                        let event_type = match EventType::try_from(&evt.event_type) {
                            Ok(t) => t,
                            Err(e) => {
                                error!(kind = %self.kind, error = %e, "Error converting watch event type");
                                continue;
                            }
                        };
                        self.dispatch(Event::new(event_type, evt.object));
                    }
                }
            }
            watch.stop();
        };

        let resync_relay = async {
            let mut ticker = tokio::time::interval(self.resync_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.resync() => {}
                }
            }
        };

        tokio::join!(watch_relay, resync_relay);

        info!(kind = %self.kind, "List/watch source stopped");
        Ok(())
    }

    /// List everything and emit a `Generic` event per object
    async fn resync(&self) {
        let objects = match self.list_watch.list().await {
            Ok(objects) => objects,
            Err(e) => {
                error!(kind = %self.kind, error = %e, "Failed to list objects");
                return;
            }
        };

        debug!(kind = %self.kind, count = objects.len(), "Resyncing");
        for object in objects {
            self.dispatch(Event::new(EventType::Generic, object));
        }
    }
}

impl<E> Source<E> for ListWatchSource<E>
where
    E: Clone + Send + Sync + 'static,
{
    fn add_handler(&self, handler: Arc<dyn Handler<E>>) -> HandlerRegistration {
        let mut handlers = self.handlers.write();
        let handle_id = self.next_handle_id.fetch_add(1, Ordering::Relaxed);
        handlers.insert(handle_id, handler);

        HandlerRegistration {
            source_id: self.source_id,
            handle_id,
        }
    }

    fn remove_handler(&self, registration: &HandlerRegistration) -> Result<()> {
        let mut handlers = self.handlers.write();
        if registration.source_id != self.source_id
            || registration.handle_id >= self.next_handle_id.load(Ordering::Relaxed)
        {
            return Err(Error::InvalidHandlerRegistration);
        }

        handlers.remove(&registration.handle_id);
        Ok(())
    }
}
