//! Rook/Ceph CRDs
//!
//! The subset of the `ceph.rook.io/v1` API this operator reads and creates:
//! block pools (whose status drives VolumePool availability) and clients
//! (the access credentials handed to consumers of a pool).

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key in `CephClient.status.info` holding the name of the generated secret
pub const CLIENT_SECRET_INFO_KEY: &str = "secretName";

/// Default for `CephBlockPool.spec.enableRBDStats`
pub const ENABLE_RBD_STATS_DEFAULT: bool = true;

// =============================================================================
// Phase
// =============================================================================

/// Phase reported by Rook on its resources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum CephPhase {
    Progressing,
    Ready,
    Failure,
    Connecting,
    Deleting,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for CephPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CephPhase::Progressing => write!(f, "Progressing"),
            CephPhase::Ready => write!(f, "Ready"),
            CephPhase::Failure => write!(f, "Failure"),
            CephPhase::Connecting => write!(f, "Connecting"),
            CephPhase::Deleting => write!(f, "Deleting"),
            CephPhase::Unknown => write!(f, "Unknown"),
        }
    }
}

// =============================================================================
// CephBlockPool
// =============================================================================

/// Block pool provisioned by Rook inside the Ceph cluster
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "ceph.rook.io",
    version = "v1",
    kind = "CephBlockPool",
    plural = "cephblockpools",
    status = "CephBlockPoolStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CephBlockPoolSpec {
    /// Replication settings
    #[serde(default)]
    pub replicated: ReplicatedSpec,

    /// Collect per-image IO statistics
    #[serde(default, rename = "enableRBDStats")]
    pub enable_rbd_stats: bool,
}

/// Replication settings of a pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatedSpec {
    /// Number of copies per object
    pub size: u32,
}

/// Status written by Rook
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CephBlockPoolStatus {
    #[serde(default)]
    pub phase: Option<CephPhase>,
}

impl CephBlockPool {
    /// Phase reported by Rook, `None` while the status is unset
    pub fn phase(&self) -> Option<&CephPhase> {
        self.status.as_ref().and_then(|s| s.phase.as_ref())
    }
}

// =============================================================================
// CephClient
// =============================================================================

/// Ceph client (cephx user) managed by Rook
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "ceph.rook.io",
    version = "v1",
    kind = "CephClient",
    plural = "cephclients",
    status = "CephClientStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CephClientSpec {
    /// Capabilities per daemon type (`mon`, `osd`, ...)
    #[serde(default)]
    pub caps: BTreeMap<String, String>,
}

/// Status written by Rook
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CephClientStatus {
    #[serde(default)]
    pub phase: Option<CephPhase>,

    #[serde(default)]
    pub info: BTreeMap<String, String>,
}

impl CephClientSpec {
    /// RBD capabilities restricted to a single pool
    pub fn for_pool(pool_name: &str) -> Self {
        let mut caps = BTreeMap::new();
        caps.insert("mon".to_string(), "profile rbd".to_string());
        caps.insert("osd".to_string(), format!("profile rbd pool={}", pool_name));
        Self { caps }
    }
}

impl CephClient {
    /// Whether Rook reports the client ready
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.phase == Some(CephPhase::Ready))
            .unwrap_or(false)
    }

    /// Name of the secret Rook generated for this client
    pub fn secret_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.info.get(CLIENT_SECRET_INFO_KEY))
            .map(String::as_str)
    }
}
