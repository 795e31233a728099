//! VolumeSnapshotClass
//!
//! `snapshot.storage.k8s.io/v1` keeps its fields at the top level instead of
//! under `spec`, so the type implements `kube::Resource` by hand.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ClusterResourceScope;
use kube::Resource;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;

const GROUP: &str = "snapshot.storage.k8s.io";
const VERSION: &str = "v1";
const KIND: &str = "VolumeSnapshotClass";

/// Class of volume snapshots served by a CSI driver
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotClass {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub driver: String,
    pub deletion_policy: DeletionPolicy,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

/// What happens to the backing snapshot when the VolumeSnapshotContent goes away
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionPolicy {
    #[default]
    Delete,
    Retain,
}

impl VolumeSnapshotClass {
    pub fn new(name: &str, driver: impl Into<String>) -> Self {
        Self {
            api_version: format!("{}/{}", GROUP, VERSION),
            kind: KIND.to_string(),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            driver: driver.into(),
            deletion_policy: DeletionPolicy::Delete,
            parameters: BTreeMap::new(),
        }
    }
}

impl Resource for VolumeSnapshotClass {
    type DynamicType = ();
    type Scope = ClusterResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        KIND.into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        GROUP.into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        VERSION.into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        "volumesnapshotclasses".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_shape() {
        let class = VolumeSnapshotClass::new("c1--pool", "rook-ceph.rbd.csi.ceph.com");
        let json = serde_json::to_value(&class).unwrap();
        assert_eq!(json["apiVersion"], "snapshot.storage.k8s.io/v1");
        assert_eq!(json["kind"], "VolumeSnapshotClass");
        assert_eq!(json["driver"], "rook-ceph.rbd.csi.ceph.com");
        assert_eq!(json["deletionPolicy"], "Delete");
        assert_eq!(json["metadata"]["name"], "c1--pool");
    }

    #[test]
    fn test_resource_identity() {
        assert_eq!(VolumeSnapshotClass::api_version(&()), "snapshot.storage.k8s.io/v1");
        assert_eq!(VolumeSnapshotClass::plural(&()), "volumesnapshotclasses");
    }
}
