//! In-Memory Object Store
//!
//! A [`ObjectStore`] kept in process memory. It mimics the API server closely
//! enough for the engine: resource versions with optimistic concurrency, a
//! separate status subresource, and a broadcast-backed watch. Used by the
//! standalone mode and by tests.

use crate::domain::ports::{LabelSelector, ListWatch, ObjectStore, Watch, WatchEvent, WatchEventType};
use crate::error::{Error, Result};
use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

/// Capacity of the change broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Buffer of each watch handle
const WATCH_BUFFER: usize = 256;

/// In-memory store for one resource kind within one scope
pub struct MemoryStore<K> {
    kind: String,
    namespace: Option<String>,
    objects: RwLock<BTreeMap<String, K>>,
    resource_version: AtomicU64,
    writes: AtomicU64,
    events: broadcast::Sender<WatchEvent<K>>,
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Store for a cluster-scoped kind
    pub fn new(kind: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            kind: kind.into(),
            namespace: None,
            objects: RwLock::new(BTreeMap::new()),
            resource_version: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            events,
        }
    }

    /// Store for a namespaced kind; created objects get `namespace` filled in
    pub fn namespaced(kind: impl Into<String>, namespace: impl Into<String>) -> Self {
        let mut store = Self::new(kind);
        store.namespace = Some(namespace.into());
        store
    }

    /// Number of successful mutations so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Remove an object, emitting a `Deleted` event if it existed. The final
    /// state carries a fresh resource version, as the API server reports it.
    pub fn delete(&self, name: &str) -> Option<K> {
        let mut removed = self.objects.write().remove(name)?;
        removed.meta_mut().resource_version = Some(self.next_resource_version());
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.publish(WatchEventType::Deleted, removed.clone());
        Some(removed)
    }

    fn next_resource_version(&self) -> String {
        (self.resource_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn publish(&self, event_type: WatchEventType, obj: K) {
        // No receivers simply means nobody is watching
        let _ = self.events.send(WatchEvent::new(event_type, obj));
    }

    fn not_found(&self, name: &str) -> Error {
        Error::ResourceNotFound {
            kind: self.kind.clone(),
            name: name.to_string(),
        }
    }

    fn conflict(&self, name: &str) -> Error {
        Error::Conflict {
            kind: self.kind.clone(),
            name: name.to_string(),
        }
    }

    /// Write `obj` over the stored object with the same name. A status-only
    /// write keeps the stored body; a body write keeps the stored status.
    fn replace(&self, obj: &K, status_only: bool) -> Result<K> {
        let name = obj.meta().name.clone().ok_or(Error::MissingObjectKey("metadata.name"))?;

        let mut objects = self.objects.write();
        let stored = objects.get(&name).ok_or_else(|| self.not_found(&name))?;

        if let Some(expected) = obj.resource_version() {
            if stored.resource_version().as_deref() != Some(expected.as_str()) {
                return Err(self.conflict(&name));
            }
        }

        let (mut base, overlay) = if status_only {
            (serde_json::to_value(stored)?, serde_json::to_value(obj)?)
        } else {
            (serde_json::to_value(obj)?, serde_json::to_value(stored)?)
        };
        match overlay.get("status") {
            Some(status) => base["status"] = status.clone(),
            None => {
                if let Some(map) = base.as_object_mut() {
                    map.remove("status");
                }
            }
        }

        let mut updated: K = serde_json::from_value(base)?;
        updated.meta_mut().resource_version = Some(self.next_resource_version());
        objects.insert(name, updated.clone());
        drop(objects);

        self.writes.fetch_add(1, Ordering::SeqCst);
        self.publish(WatchEventType::Updated, updated.clone());
        Ok(updated)
    }
}

#[async_trait]
impl<K> ListWatch<K> for MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn list(&self) -> Result<Vec<K>> {
        Ok(self.objects.read().values().cloned().collect())
    }

    async fn watch(&self) -> Result<Watch<K>> {
        let mut changes = self.events.subscribe();
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let kind = self.kind.clone();

        let relay = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(evt) => {
                        if tx.send(evt).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(kind = %kind, missed, "Watch lagged behind, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(Watch::new(rx, move || relay.abort()))
    }
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn get(&self, name: &str) -> Result<Option<K>> {
        Ok(self.objects.read().get(name).cloned())
    }

    async fn list_matching(&self, selector: &LabelSelector) -> Result<Vec<K>> {
        Ok(self
            .objects
            .read()
            .values()
            .filter(|obj| selector.matches(obj.labels()))
            .cloned()
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let mut created = obj.clone();
        let name = match (&created.meta().name, &created.meta().generate_name) {
            (Some(name), _) => name.clone(),
            (None, Some(prefix)) => format!(
                "{}{:05}",
                prefix,
                self.resource_version.load(Ordering::SeqCst) + 1
            ),
            (None, None) => return Err(Error::MissingObjectKey("metadata.name")),
        };

        let mut objects = self.objects.write();
        if objects.contains_key(&name) {
            return Err(Error::ResourceExists {
                kind: self.kind.clone(),
                name,
            });
        }

        let meta = created.meta_mut();
        meta.name = Some(name.clone());
        if meta.namespace.is_none() {
            meta.namespace = self.namespace.clone();
        }
        meta.resource_version = Some(self.next_resource_version());
        objects.insert(name, created.clone());
        drop(objects);

        self.writes.fetch_add(1, Ordering::SeqCst);
        self.publish(WatchEventType::Created, created.clone());
        Ok(created)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        self.replace(obj, false)
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        self.replace(obj, true)
    }
}
