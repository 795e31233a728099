//! VolumeClass CRD
//!
//! Independently declared performance/capacity tier. The operator discovers the
//! classes matching its selector and advertises them on each available pool.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// IOPS limit capability
pub const CAPABILITY_IOPS: &str = "iops";

/// Throughput limit capability
pub const CAPABILITY_TPS: &str = "tps";

/// VolumeClass advertises the limits a volume of this class gets
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.volumepool.io",
    version = "v1alpha1",
    kind = "VolumeClass",
    plural = "volumeclasses",
    shortname = "vc",
    printcolumn = r#"{"name": "IOPS", "type": "integer", "jsonPath": ".spec.capabilities.iops"}"#,
    printcolumn = r#"{"name": "TPS", "type": "integer", "jsonPath": ".spec.capabilities.tps"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClassSpec {
    /// Numeric limits keyed by resource name
    #[serde(default)]
    pub capabilities: BTreeMap<String, u64>,
}

impl VolumeClassSpec {
    /// Spec with IOPS and TPS limits
    pub fn with_limits(iops: u64, tps: u64) -> Self {
        let mut capabilities = BTreeMap::new();
        capabilities.insert(CAPABILITY_IOPS.to_string(), iops);
        capabilities.insert(CAPABILITY_TPS.to_string(), tps);
        Self { capabilities }
    }
}

impl VolumeClass {
    pub fn iops(&self) -> Option<u64> {
        self.spec.capabilities.get(CAPABILITY_IOPS).copied()
    }

    pub fn tps(&self) -> Option<u64> {
        self.spec.capabilities.get(CAPABILITY_TPS).copied()
    }
}
