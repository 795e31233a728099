//! Domain Ports - Core trait definitions for the pool operator
//!
//! These traits define the boundaries between the synchronization engine and
//! the orchestration platform. Adapters in [`crate::store`] implement them on
//! top of the Kubernetes API or an in-memory map.

use crate::error::{Error, Result};
use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

// =============================================================================
// Object Capability
// =============================================================================

/// The capability set the engine needs from any resource kind
pub trait Object: Clone + Send + Sync + 'static {
    /// Object name
    fn object_name(&self) -> String;

    /// Namespace, `None` for cluster-scoped objects
    fn object_namespace(&self) -> Option<String>;

    /// Object labels
    fn object_labels(&self) -> &BTreeMap<String, String>;

    /// Identity of this object
    fn key(&self) -> ObjectKey {
        ObjectKey {
            namespace: self.object_namespace(),
            name: self.object_name(),
        }
    }
}

impl<K> Object for K
where
    K: Resource + Clone + Send + Sync + 'static,
{
    fn object_name(&self) -> String {
        self.name_any()
    }

    fn object_namespace(&self) -> Option<String> {
        self.namespace()
    }

    fn object_labels(&self) -> &BTreeMap<String, String> {
        self.labels()
    }
}

/// Identity of an object: optional namespace plus name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    /// Key of a cluster-scoped object
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

// =============================================================================
// Label Selector
// =============================================================================

/// Equality-based label selector (`matchLabels`)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn new(match_labels: BTreeMap<String, String>) -> Self {
        Self { match_labels }
    }

    /// Add a required label
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    /// Parse `k1=v1,k2=v2`; an empty string selects everything
    pub fn parse(s: &str) -> Result<Self> {
        let mut match_labels = BTreeMap::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| Error::SelectorParse(format!("expected key=value, got {:?}", part)))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::SelectorParse(format!("empty key in {:?}", part)));
            }
            match_labels.insert(key.to_string(), value.trim().to_string());
        }
        Ok(Self { match_labels })
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty()
    }

    pub fn match_labels(&self) -> &BTreeMap<String, String> {
        &self.match_labels
    }

    /// Whether every required label is present with the required value
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k).map(|actual| actual == v).unwrap_or(false))
    }

    /// Render as a Kubernetes label selector query
    pub fn to_query(&self) -> String {
        self.match_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl std::fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_query())
    }
}

// =============================================================================
// Ownership Marker
// =============================================================================

/// Label asserting that an object is managed by a given manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipMarker {
    pub key: &'static str,
    pub value: &'static str,
}

impl OwnershipMarker {
    pub const fn new(key: &'static str, value: &'static str) -> Self {
        Self { key, value }
    }

    /// Whether the labels carry this marker
    pub fn is_marked(&self, labels: &BTreeMap<String, String>) -> bool {
        labels.get(self.key).map(|v| v == self.value).unwrap_or(false)
    }

    /// Put the marker on a label map
    pub fn mark(&self, labels: &mut BTreeMap<String, String>) {
        labels.insert(self.key.to_string(), self.value.to_string());
    }

    /// Fail with `OwnershipConflict` unless the object carries the marker
    pub fn check<K: Object>(&self, kind: &str, obj: &K) -> Result<()> {
        if self.is_marked(obj.object_labels()) {
            Ok(())
        } else {
            Err(Error::OwnershipConflict {
                kind: kind.to_string(),
                name: obj.object_name(),
            })
        }
    }
}

// =============================================================================
// Watch
// =============================================================================

/// Raw change kind as reported by a watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEventType {
    Created,
    Updated,
    Deleted,
    /// Anything the platform sends that the engine does not understand
    Other(String),
}

impl std::fmt::Display for WatchEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchEventType::Created => write!(f, "Created"),
            WatchEventType::Updated => write!(f, "Updated"),
            WatchEventType::Deleted => write!(f, "Deleted"),
            WatchEventType::Other(t) => write!(f, "{}", t),
        }
    }
}

/// A single change notification
#[derive(Debug, Clone)]
pub struct WatchEvent<E> {
    pub event_type: WatchEventType,
    pub object: E,
}

impl<E> WatchEvent<E> {
    pub fn new(event_type: WatchEventType, object: E) -> Self {
        Self { event_type, object }
    }
}

type StopFn = Box<dyn FnOnce() + Send>;

/// Handle to a running watch.
///
/// Events arrive on an internal channel; the stop function releases whatever
/// the producer holds (a spawned task, a subscription). It runs exactly once,
/// on [`Watch::stop`] or on drop.
pub struct Watch<E> {
    events: mpsc::Receiver<WatchEvent<E>>,
    stop: Option<StopFn>,
}

impl<E> Watch<E> {
    pub fn new(events: mpsc::Receiver<WatchEvent<E>>, stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            events,
            stop: Some(Box::new(stop)),
        }
    }

    /// Next event, `None` once the producer is gone
    pub async fn next(&mut self) -> Option<WatchEvent<E>> {
        self.events.recv().await
    }

    /// Stop the watch; further calls are no-ops
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
        self.events.close();
    }
}

impl<E> Drop for Watch<E> {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// List/Watch Port
// =============================================================================

/// A listable and watchable resource source
#[async_trait]
pub trait ListWatch<E>: Send + Sync {
    /// List every object of the kind
    async fn list(&self) -> Result<Vec<E>>;

    /// Establish a watch on the kind
    async fn watch(&self) -> Result<Watch<E>>;
}

// =============================================================================
// Object Store Port
// =============================================================================

/// Read/write access to one resource kind within one scope
#[async_trait]
pub trait ObjectStore<K: Object>: ListWatch<K> {
    /// Kind name used in errors and logs
    fn kind(&self) -> &str;

    /// Get an object by name, `None` if it does not exist
    async fn get(&self, name: &str) -> Result<Option<K>>;

    /// List the objects whose labels match the selector
    async fn list_matching(&self, selector: &LabelSelector) -> Result<Vec<K>>;

    /// Create an object; `Error::ResourceExists` if the name is taken
    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace an object; `Error::Conflict` if its resource version is stale
    async fn update(&self, obj: &K) -> Result<K>;

    /// Replace the status of an object; `Error::Conflict` if its resource version is stale
    async fn update_status(&self, obj: &K) -> Result<K>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ObjectStoreRef<K> = Arc<dyn ObjectStore<K>>;
pub type ListWatchRef<E> = Arc<dyn ListWatch<E>>;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::ConfigMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_selector_parse_and_match() {
        let selector = LabelSelector::parse("suitable-for=testing, tier=fast").unwrap();
        assert!(selector.matches(&labels(&[("suitable-for", "testing"), ("tier", "fast"), ("x", "y")])));
        assert!(!selector.matches(&labels(&[("suitable-for", "production"), ("tier", "fast")])));
        assert!(!selector.matches(&labels(&[("tier", "fast")])));
        assert_eq!(selector.to_query(), "suitable-for=testing,tier=fast");

        assert!(LabelSelector::parse("").unwrap().is_empty());
        assert!(LabelSelector::parse("").unwrap().matches(&BTreeMap::new()));
        assert_matches!(LabelSelector::parse("novalue"), Err(Error::SelectorParse(_)));
        assert_matches!(LabelSelector::parse("=v"), Err(Error::SelectorParse(_)));
    }

    #[test]
    fn test_ownership_marker() {
        const MARKER: OwnershipMarker = OwnershipMarker::new("example.io/managed-by", "me");

        let mut owned = ConfigMap::default();
        owned.metadata.name = Some("owned".into());
        MARKER.mark(owned.labels_mut());
        assert!(MARKER.check("ConfigMap", &owned).is_ok());

        let mut foreign = ConfigMap::default();
        foreign.metadata.name = Some("foreign".into());
        foreign.labels_mut().insert("example.io/managed-by".into(), "someone-else".into());
        assert_matches!(
            MARKER.check("ConfigMap", &foreign),
            Err(Error::OwnershipConflict { kind, name }) if kind == "ConfigMap" && name == "foreign"
        );
    }

    #[test]
    fn test_object_key() {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some("cm".into());
        assert_eq!(cm.key(), ObjectKey::cluster("cm"));
        cm.metadata.namespace = Some("ns".into());
        assert_eq!(cm.key(), ObjectKey::namespaced("ns", "cm"));
        assert_eq!(cm.key().to_string(), "ns/cm");
    }

    #[tokio::test]
    async fn test_watch_stops_once() {
        let stops = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel(4);
        let counter = stops.clone();
        let mut watch = Watch::new(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tx.send(WatchEvent::new(WatchEventType::Created, 1u32)).await.unwrap();
        assert_eq!(watch.next().await.map(|e| e.object), Some(1));

        watch.stop();
        watch.stop();
        drop(watch);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(tx.is_closed());
    }
}
