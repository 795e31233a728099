//! VolumePool Reconciler
//!
//! Converges the resources backing one VolumePool and publishes its state.
//! Every step re-reads what it needs, so a pass can start from any point the
//! previous one stopped at. Errors bubble up to the dispatcher; nothing here
//! retries on its own.

use crate::controller::naming::{child_labels, cluster_pool_name, MANAGER};
use crate::crd::{
    CephBlockPool, CephBlockPoolSpec, CephClient, CephClientSpec, ClassReference,
    ReplicatedSpec, VolumeClass, VolumePool, VolumePoolState, VolumePoolStatus,
    VolumeSnapshotClass, ACCESS_SECRET_ANNOTATION, ENABLE_RBD_STATS_DEFAULT,
};
use crate::domain::ports::{LabelSelector, Object, ObjectKey, ObjectStore, ObjectStoreRef};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

/// Secret key holding the cephx user name
pub const SECRET_USER_ID_KEY: &str = "userID";

/// Secret key holding the cephx key
pub const SECRET_USER_KEY_KEY: &str = "userKey";

/// Secrets handed out for a ready pool
#[derive(Debug, Clone, PartialEq, Eq)]
struct Credentials {
    /// Secret Rook generated for the CephClient, recorded on the VolumePool
    client_secret: String,
    /// Operator-owned copy in the `userID`/`userKey` layout the CSI driver reads
    csi_secret: String,
}

// =============================================================================
// Configuration
// =============================================================================

/// Settings the reconciler needs about the backend it manages
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Provider scheme handled by this operator (`ceph` in `ceph://pool`)
    pub provider: String,
    /// Cluster id prefixed to every backend pool name
    pub cluster_id: String,
    /// Namespace holding the Rook resources
    pub rook_namespace: String,
    /// CSI driver named by the published storage and snapshot classes
    pub csi_driver_name: String,
    /// Selects the VolumeClasses advertised on available pools
    pub volume_class_selector: LabelSelector,
    /// Value of `enableRBDStats` on created block pools
    pub enable_rbd_stats: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            provider: "ceph".to_string(),
            cluster_id: "ceph".to_string(),
            rook_namespace: "rook-ceph".to_string(),
            csi_driver_name: "rook-ceph.rbd.csi.ceph.com".to_string(),
            volume_class_selector: LabelSelector::default(),
            enable_rbd_stats: ENABLE_RBD_STATS_DEFAULT,
        }
    }
}

/// Stores for every kind the reconciler reads or writes
#[derive(Clone)]
pub struct PoolStores {
    pub volume_pools: ObjectStoreRef<VolumePool>,
    pub block_pools: ObjectStoreRef<CephBlockPool>,
    pub clients: ObjectStoreRef<CephClient>,
    pub secrets: ObjectStoreRef<Secret>,
    pub storage_classes: ObjectStoreRef<StorageClass>,
    pub snapshot_classes: ObjectStoreRef<VolumeSnapshotClass>,
    pub volume_classes: ObjectStoreRef<VolumeClass>,
}

// =============================================================================
// Reconciler
// =============================================================================

/// Drives a VolumePool and its children toward the desired state
pub struct VolumePoolReconciler {
    config: ReconcilerConfig,
    stores: PoolStores,
}

impl VolumePoolReconciler {
    pub fn new(config: ReconcilerConfig, stores: PoolStores) -> Self {
        Self { config, stores }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Whether this operator is responsible for the pool
    pub fn handles(&self, pool: &VolumePool) -> bool {
        pool.provider()
            .map(|(provider, _)| provider == self.config.provider)
            .unwrap_or(false)
    }

    /// Run one reconcile pass for the VolumePool identified by `key`
    #[instrument(skip(self, key), fields(pool = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        let Some(pool) = self.stores.volume_pools.get(&key.name).await? else {
            debug!("VolumePool no longer exists");
            return Ok(());
        };

        if !self.handles(&pool) {
            debug!(provider_id = %pool.spec.provider_id, "Skipping pool of another provider");
            return Ok(());
        }

        let backend_name = cluster_pool_name(&self.config.cluster_id, pool.name());

        let block_pool = self.ensure_block_pool(&pool, &backend_name).await?;
        let state = VolumePoolState::from_backend_phase(block_pool.phase());

        if state != VolumePoolState::Available {
            let classes = pool
                .status
                .as_ref()
                .map(|s| s.available_volume_classes.clone())
                .unwrap_or_default();
            self.write_status(&pool, state, classes).await?;
            return Ok(());
        }

        let credentials = self.ensure_credentials(&pool, &backend_name).await?;
        let pool = self
            .record_access_secret(pool, &credentials.client_secret)
            .await?;

        self.ensure_storage_class(&pool, &backend_name, &credentials.csi_secret)
            .await?;
        self.ensure_snapshot_class(&pool, &backend_name, &credentials.csi_secret)
            .await?;

        let classes = self.matching_volume_classes().await?;
        self.write_status(&pool, VolumePoolState::Available, classes)
            .await?;

        Ok(())
    }

    // =========================================================================
    // Backend Pool
    // =========================================================================

    async fn ensure_block_pool(&self, pool: &VolumePool, name: &str) -> Result<CephBlockPool> {
        let store = &self.stores.block_pools;
        if let Some(existing) = store.get(name).await? {
            return Ok(existing);
        }

        let mut desired = CephBlockPool::new(
            name,
            CephBlockPoolSpec {
                replicated: ReplicatedSpec {
                    size: pool.spec.replication,
                },
                enable_rbd_stats: self.config.enable_rbd_stats,
            },
        );
        desired.metadata.namespace = Some(self.config.rook_namespace.clone());
        *desired.labels_mut() = child_labels(pool.name());

        match store.create(&desired).await {
            Ok(created) => {
                info!(block_pool = %name, replication = pool.spec.replication, "Created CephBlockPool");
                Ok(created)
            }
            Err(Error::ResourceExists { .. }) => store
                .get(name)
                .await?
                .ok_or_else(|| Error::ResourceNotFound {
                    kind: store.kind().to_string(),
                    name: name.to_string(),
                }),
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Credentials
    // =========================================================================

    /// Ensure the CephClient and the CSI Secret built from its key
    async fn ensure_credentials(&self, pool: &VolumePool, name: &str) -> Result<Credentials> {
        let mut desired = CephClient::new(name, CephClientSpec::for_pool(name));
        desired.metadata.namespace = Some(self.config.rook_namespace.clone());
        *desired.labels_mut() = child_labels(pool.name());
        let client = ensure_owned(&*self.stores.clients, desired).await?;

        if !client.is_ready() {
            return Err(Error::DependencyNotReady {
                kind: "CephClient".to_string(),
                name: name.to_string(),
                reason: "client is not ready".to_string(),
            });
        }
        let Some(rook_secret_name) = client.secret_name() else {
            return Err(Error::DependencyNotReady {
                kind: "CephClient".to_string(),
                name: name.to_string(),
                reason: "no secret reported in status".to_string(),
            });
        };

        let rook_secret = self
            .stores
            .secrets
            .get(rook_secret_name)
            .await?
            .ok_or_else(|| Error::DependencyNotReady {
                kind: "Secret".to_string(),
                name: rook_secret_name.to_string(),
                reason: "secret does not exist yet".to_string(),
            })?;
        let user_key = rook_secret
            .data
            .as_ref()
            .and_then(|data| data.get(name))
            .cloned()
            .ok_or_else(|| Error::DependencyNotReady {
                kind: "Secret".to_string(),
                name: rook_secret_name.to_string(),
                reason: format!("no key for client {}", name),
            })?;

        let mut data = BTreeMap::new();
        data.insert(SECRET_USER_ID_KEY.to_string(), ByteString(name.as_bytes().to_vec()));
        data.insert(SECRET_USER_KEY_KEY.to_string(), user_key);

        let desired = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.config.rook_namespace.clone()),
                labels: Some(child_labels(pool.name())),
                ..Default::default()
            },
            data: Some(data.clone()),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };
        let secrets = &*self.stores.secrets;
        let mut access = ensure_owned(secrets, desired).await?;

        // The cephx key may be rotated by Rook
        if access.data.as_ref() != Some(&data) {
            access.data = Some(data);
            secrets.update(&access).await?;
            info!(secret = %name, "Refreshed access secret");
        }

        Ok(Credentials {
            client_secret: rook_secret_name.to_string(),
            csi_secret: access.name_any(),
        })
    }

    async fn record_access_secret(&self, pool: VolumePool, secret_name: &str) -> Result<VolumePool> {
        if pool.access_secret() == Some(secret_name) {
            return Ok(pool);
        }

        let mut annotated = pool;
        annotated
            .annotations_mut()
            .insert(ACCESS_SECRET_ANNOTATION.to_string(), secret_name.to_string());
        let updated = self.stores.volume_pools.update(&annotated).await?;
        debug!(secret = %secret_name, "Recorded access secret on pool");
        Ok(updated)
    }

    // =========================================================================
    // Published Classes
    // =========================================================================

    async fn ensure_storage_class(&self, pool: &VolumePool, name: &str, secret: &str) -> Result<()> {
        let ns = &self.config.rook_namespace;
        let mut parameters = BTreeMap::new();
        parameters.insert("clusterID".to_string(), ns.clone());
        parameters.insert("pool".to_string(), name.to_string());
        parameters.insert("imageFormat".to_string(), "2".to_string());
        parameters.insert("imageFeatures".to_string(), "layering".to_string());
        for prefix in ["provisioner", "controller-expand", "node-stage"] {
            parameters.insert(format!("csi.storage.k8s.io/{}-secret-name", prefix), secret.to_string());
            parameters.insert(format!("csi.storage.k8s.io/{}-secret-namespace", prefix), ns.clone());
        }

        let desired = StorageClass {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(child_labels(pool.name())),
                ..Default::default()
            },
            provisioner: self.config.csi_driver_name.clone(),
            parameters: Some(parameters),
            reclaim_policy: Some("Delete".to_string()),
            allow_volume_expansion: Some(true),
            ..Default::default()
        };
        ensure_owned(&*self.stores.storage_classes, desired).await?;
        Ok(())
    }

    async fn ensure_snapshot_class(&self, pool: &VolumePool, name: &str, secret: &str) -> Result<()> {
        let mut desired = VolumeSnapshotClass::new(name, self.config.csi_driver_name.clone());
        desired.metadata.labels = Some(child_labels(pool.name()));
        desired
            .parameters
            .insert("clusterID".to_string(), self.config.rook_namespace.clone());
        desired.parameters.insert(
            "csi.storage.k8s.io/snapshotter-secret-name".to_string(),
            secret.to_string(),
        );
        desired.parameters.insert(
            "csi.storage.k8s.io/snapshotter-secret-namespace".to_string(),
            self.config.rook_namespace.clone(),
        );
        ensure_owned(&*self.stores.snapshot_classes, desired).await?;
        Ok(())
    }

    /// References to every VolumeClass matching the selector, sorted by name
    async fn matching_volume_classes(&self) -> Result<Vec<ClassReference>> {
        let mut classes: Vec<_> = self
            .stores
            .volume_classes
            .list_matching(&self.config.volume_class_selector)
            .await?
            .iter()
            .map(|class| ClassReference::new(class.name_any()))
            .collect();
        classes.sort();
        classes.dedup();
        Ok(classes)
    }

    // =========================================================================
    // Status
    // =========================================================================

    async fn write_status(
        &self,
        pool: &VolumePool,
        state: VolumePoolState,
        available_volume_classes: Vec<ClassReference>,
    ) -> Result<()> {
        let desired = VolumePoolStatus {
            state,
            available_volume_classes,
        };
        if pool.status.as_ref() == Some(&desired) {
            return Ok(());
        }

        let previous = pool.state();
        let mut updated = pool.clone();
        updated.status = Some(desired);
        self.stores.volume_pools.update_status(&updated).await?;

        if previous != state || pool.status.is_none() {
            info!(from = %previous, to = %state, "VolumePool state changed");
        }
        Ok(())
    }
}

/// Return the existing object named like `desired`, creating it when absent.
///
/// An existing object without the ownership marker is never adopted.
async fn ensure_owned<K: Object>(store: &dyn ObjectStore<K>, desired: K) -> Result<K> {
    let name = desired.object_name();
    if let Some(existing) = store.get(&name).await? {
        MANAGER.check(store.kind(), &existing)?;
        return Ok(existing);
    }

    match store.create(&desired).await {
        Ok(created) => {
            info!(kind = %store.kind(), name = %name, "Created child resource");
            Ok(created)
        }
        Err(Error::ResourceExists { .. }) => {
            let existing = store.get(&name).await?.ok_or_else(|| Error::ResourceNotFound {
                kind: store.kind().to_string(),
                name: name.clone(),
            })?;
            MANAGER.check(store.kind(), &existing)?;
            Ok(existing)
        }
        Err(e) => Err(e),
    }
}
