//! Names and labels shared by everything the operator creates

use crate::domain::ports::{Object, ObjectKey, OwnershipMarker};
use std::collections::BTreeMap;

/// Label naming the manager of an object
pub const MANAGED_BY_LABEL: &str = "volumepool.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`] on objects this operator owns
pub const MANAGER_NAME: &str = "volume-pool-operator";

/// Label pointing a child resource back at its VolumePool
pub const POOL_LABEL: &str = "volumepool.io/pool";

/// Ownership marker carried by every child resource
pub const MANAGER: OwnershipMarker = OwnershipMarker::new(MANAGED_BY_LABEL, MANAGER_NAME);

/// Name of the backend pool (and of its children) for a VolumePool.
///
/// The cluster id prefix keeps pools of several clusters apart when they share
/// one Rook namespace.
pub fn cluster_pool_name(cluster_id: &str, pool_name: &str) -> String {
    format!("{}--{}", cluster_id, pool_name)
}

/// Labels every child of `pool_name` carries
pub fn child_labels(pool_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    MANAGER.mark(&mut labels);
    labels.insert(POOL_LABEL.to_string(), pool_name.to_string());
    labels
}

/// Key of the VolumePool a child resource belongs to, if it carries the
/// back-reference label
pub fn owning_pool<K: Object>(child: &K) -> Option<ObjectKey> {
    child
        .object_labels()
        .get(POOL_LABEL)
        .filter(|name| !name.is_empty())
        .map(ObjectKey::cluster)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Secret;
    use kube::ResourceExt;

    #[test]
    fn test_cluster_pool_name() {
        assert_eq!(cluster_pool_name("c1", "pool-a"), "c1--pool-a");
    }

    #[test]
    fn test_owning_pool() {
        let mut secret = Secret::default();
        secret.metadata.name = Some("c1--pool-a".into());
        assert_eq!(owning_pool(&secret), None);

        *secret.labels_mut() = child_labels("pool-a");
        assert_eq!(owning_pool(&secret), Some(ObjectKey::cluster("pool-a")));
        assert!(MANAGER.is_marked(secret.labels()));
    }
}
