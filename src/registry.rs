//! VolumeClass Registry
//!
//! Event handler keeping the VolumeClasses that match the advertised selector,
//! so they can be served without a round trip to the API server.

use crate::crd::VolumeClass;
use crate::domain::ports::{LabelSelector, Object};
use crate::event::{Event, EventType, Handler};
use dashmap::DashMap;
use kube::ResourceExt;
use tracing::debug;

/// Last state seen for a class name. Deleted names stay behind as tombstones
/// so that a resync listed before the delete cannot bring them back.
#[derive(Default)]
struct Entry {
    version: Option<u64>,
    /// `None` once deleted or no longer matching the selector
    class: Option<VolumeClass>,
}

/// Snapshot of the VolumeClasses matching a selector
pub struct VolumeClassRegistry {
    selector: LabelSelector,
    entries: DashMap<String, Entry>,
}

impl VolumeClassRegistry {
    pub fn new(selector: LabelSelector) -> Self {
        Self {
            selector,
            entries: DashMap::new(),
        }
    }

    pub fn selector(&self) -> &LabelSelector {
        &self.selector
    }

    pub fn get(&self, name: &str) -> Option<VolumeClass> {
        self.entries.get(name).and_then(|e| e.class.clone())
    }

    /// All tracked classes sorted by name
    pub fn list(&self) -> Vec<VolumeClass> {
        let mut classes: Vec<_> = self.entries.iter().filter_map(|e| e.class.clone()).collect();
        classes.sort_by_key(|c| c.object_name());
        classes
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.class.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn resource_version(class: &VolumeClass) -> Option<u64> {
    class.resource_version().and_then(|v| v.parse().ok())
}

/// Whether an event carries a state older than the one already applied.
/// A delete may repeat the last seen version; anything else must be newer.
fn is_stale(seen: Option<u64>, incoming: Option<u64>, event_type: EventType) -> bool {
    match (seen, incoming) {
        (Some(seen), Some(incoming)) if event_type == EventType::Deleted => incoming < seen,
        (Some(seen), Some(incoming)) => incoming <= seen,
        _ => false,
    }
}

impl Handler<VolumeClass> for VolumeClassRegistry {
    fn handle(&self, event: Event<VolumeClass>) {
        let name = event.object.object_name();
        let version = resource_version(&event.object);

        let mut entry = self.entries.entry(name.clone()).or_insert_with(Entry::default);
        if is_stale(entry.version, version, event.event_type) {
            debug!(class = %name, event = %event.event_type, ?version, seen = ?entry.version, "Dropping stale VolumeClass event");
            return;
        }
        entry.version = version;

        let keep = event.event_type != EventType::Deleted
            && self.selector.matches(event.object.object_labels());
        if keep {
            entry.class = Some(event.object);
        } else if entry.class.take().is_some() {
            debug!(class = %name, event = %event.event_type, "VolumeClass no longer advertised");
        }
    }
}
