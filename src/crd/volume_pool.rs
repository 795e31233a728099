//! VolumePool CRD
//!
//! Represents a logical storage pool announced to the platform and backed by a
//! Rook/Ceph block pool. The operator only writes its status and annotations.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::rook::CephPhase;

/// Annotation carrying the name of the materialized access secret
pub const ACCESS_SECRET_ANNOTATION: &str = "volumepool.io/access-secret";

// =============================================================================
// VolumePool CRD
// =============================================================================

/// VolumePool is the top-level resource this operator reconciles.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storage.volumepool.io",
    version = "v1alpha1",
    kind = "VolumePool",
    plural = "volumepools",
    shortname = "vp",
    status = "VolumePoolStatus",
    printcolumn = r#"{"name": "Provider", "type": "string", "jsonPath": ".spec.providerId"}"#,
    printcolumn = r#"{"name": "Replication", "type": "integer", "jsonPath": ".spec.replication"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct VolumePoolSpec {
    /// Provider identifier in the form `<provider>://<pool>`; empty means no backend
    #[serde(default)]
    pub provider_id: String,

    /// Number of replicas the backing block pool keeps
    #[serde(default = "default_replication")]
    pub replication: u32,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the VolumePool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumePoolStatus {
    /// Published availability
    #[serde(default)]
    pub state: VolumePoolState,

    /// Volume classes this pool can serve
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub available_volume_classes: Vec<ClassReference>,
}

/// Published availability of a VolumePool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum VolumePoolState {
    #[default]
    Pending,
    Available,
    NotAvailable,
}

impl VolumePoolState {
    /// Map the phase reported by the backing block pool onto the published state
    pub fn from_backend_phase(phase: Option<&CephPhase>) -> Self {
        match phase {
            Some(CephPhase::Ready) => VolumePoolState::Available,
            Some(CephPhase::Failure) => VolumePoolState::NotAvailable,
            Some(CephPhase::Progressing) => VolumePoolState::Pending,
            _ => VolumePoolState::Pending,
        }
    }
}

impl std::fmt::Display for VolumePoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumePoolState::Pending => write!(f, "Pending"),
            VolumePoolState::Available => write!(f, "Available"),
            VolumePoolState::NotAvailable => write!(f, "NotAvailable"),
        }
    }
}

/// Reference to a cluster-scoped class by name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
pub struct ClassReference {
    pub name: String,
}

impl ClassReference {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

// =============================================================================
// Default Value Functions
// =============================================================================

fn default_replication() -> u32 {
    3
}

// =============================================================================
// Implementations
// =============================================================================

impl VolumePool {
    /// Get the pool name
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    /// Split the provider identifier into `(provider, pool)`.
    ///
    /// Returns `None` for the empty "no backend" sentinel or a malformed id.
    pub fn provider(&self) -> Option<(&str, &str)> {
        let id = self.spec.provider_id.as_str();
        if id.is_empty() {
            return None;
        }
        id.split_once("://")
    }

    /// Current published state, `Pending` when no status was written yet
    pub fn state(&self) -> VolumePoolState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    /// Name of the access secret recorded on the pool, if any
    pub fn access_secret(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ACCESS_SECRET_ANNOTATION))
            .map(String::as_str)
    }
}
