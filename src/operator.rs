//! Operator Assembly
//!
//! Builds the event sources, the controller and the VolumeClass registry on
//! top of a set of backends and runs them until cancelled.

use crate::controller::{ControllerOptions, PoolStores, ReconcilerConfig, VolumePoolController, VolumePoolReconciler};
use crate::crd::{CephBlockPool, CephClient, VolumeClass, VolumePool, VolumeSnapshotClass};
use crate::domain::ports::{ListWatchRef, ObjectStore, ObjectStoreRef};
use crate::error::Result;
use crate::event::{Handler, ListWatchSource, ListWatchSourceOptions, Source};
use crate::metrics::Metrics;
use crate::registry::VolumeClassRegistry;
use crate::store::{KubeStore, MemoryStore};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Runtime settings derived from the configuration
#[derive(Debug, Clone)]
pub struct OperatorSettings {
    pub reconciler: ReconcilerConfig,
    pub controller: ControllerOptions,
    pub resync_interval: Duration,
}

// =============================================================================
// Backends
// =============================================================================

/// Stores for the reconciler plus list/watch access to the watched kinds
#[derive(Clone)]
pub struct Backends {
    pub stores: PoolStores,
    pub volume_pools: ListWatchRef<VolumePool>,
    pub block_pools: ListWatchRef<CephBlockPool>,
    pub clients: ListWatchRef<CephClient>,
    pub volume_classes: ListWatchRef<VolumeClass>,
}

fn split<K, S>(store: Arc<S>) -> (ObjectStoreRef<K>, ListWatchRef<K>)
where
    K: crate::domain::ports::Object,
    S: ObjectStore<K> + 'static,
{
    (store.clone(), store)
}

impl Backends {
    /// Backends talking to the Kubernetes API server
    pub fn kubernetes(client: Client, rook_namespace: &str) -> Self {
        let (volume_pools, pools_lw) = split(Arc::new(KubeStore::<VolumePool>::cluster(client.clone())));
        let (block_pools, block_pools_lw) = split(Arc::new(KubeStore::<CephBlockPool>::namespaced(
            client.clone(),
            rook_namespace,
        )));
        let (clients, clients_lw) = split(Arc::new(KubeStore::<CephClient>::namespaced(
            client.clone(),
            rook_namespace,
        )));
        let (volume_classes, classes_lw) = split(Arc::new(KubeStore::<VolumeClass>::cluster(client.clone())));

        Self {
            stores: PoolStores {
                volume_pools,
                block_pools,
                clients,
                secrets: Arc::new(KubeStore::<Secret>::namespaced(client.clone(), rook_namespace)),
                storage_classes: Arc::new(KubeStore::<StorageClass>::cluster(client.clone())),
                snapshot_classes: Arc::new(KubeStore::<VolumeSnapshotClass>::cluster(client)),
                volume_classes,
            },
            volume_pools: pools_lw,
            block_pools: block_pools_lw,
            clients: clients_lw,
            volume_classes: classes_lw,
        }
    }
}

/// Every store of an in-memory deployment, kept concrete so callers can play
/// the part of Rook and of the users
#[derive(Clone)]
pub struct MemoryBackend {
    pub volume_pools: Arc<MemoryStore<VolumePool>>,
    pub block_pools: Arc<MemoryStore<CephBlockPool>>,
    pub clients: Arc<MemoryStore<CephClient>>,
    pub secrets: Arc<MemoryStore<Secret>>,
    pub storage_classes: Arc<MemoryStore<StorageClass>>,
    pub snapshot_classes: Arc<MemoryStore<VolumeSnapshotClass>>,
    pub volume_classes: Arc<MemoryStore<VolumeClass>>,
}

impl MemoryBackend {
    pub fn new(rook_namespace: &str) -> Self {
        Self {
            volume_pools: Arc::new(MemoryStore::new("VolumePool")),
            block_pools: Arc::new(MemoryStore::namespaced("CephBlockPool", rook_namespace)),
            clients: Arc::new(MemoryStore::namespaced("CephClient", rook_namespace)),
            secrets: Arc::new(MemoryStore::namespaced("Secret", rook_namespace)),
            storage_classes: Arc::new(MemoryStore::new("StorageClass")),
            snapshot_classes: Arc::new(MemoryStore::new("VolumeSnapshotClass")),
            volume_classes: Arc::new(MemoryStore::new("VolumeClass")),
        }
    }

    pub fn backends(&self) -> Backends {
        Backends {
            stores: PoolStores {
                volume_pools: self.volume_pools.clone(),
                block_pools: self.block_pools.clone(),
                clients: self.clients.clone(),
                secrets: self.secrets.clone(),
                storage_classes: self.storage_classes.clone(),
                snapshot_classes: self.snapshot_classes.clone(),
                volume_classes: self.volume_classes.clone(),
            },
            volume_pools: self.volume_pools.clone(),
            block_pools: self.block_pools.clone(),
            clients: self.clients.clone(),
            volume_classes: self.volume_classes.clone(),
        }
    }

    /// Mutations across every store
    pub fn write_count(&self) -> u64 {
        self.volume_pools.write_count()
            + self.block_pools.write_count()
            + self.clients.write_count()
            + self.secrets.write_count()
            + self.storage_classes.write_count()
            + self.snapshot_classes.write_count()
            + self.volume_classes.write_count()
    }
}

// =============================================================================
// Operator
// =============================================================================

/// The assembled operator
pub struct Operator {
    settings: OperatorSettings,
    backends: Backends,
    registry: Arc<VolumeClassRegistry>,
    metrics: Option<Arc<Metrics>>,
}

impl Operator {
    pub fn new(settings: OperatorSettings, backends: Backends, metrics: Option<Arc<Metrics>>) -> Self {
        let registry = Arc::new(VolumeClassRegistry::new(
            settings.reconciler.volume_class_selector.clone(),
        ));
        Self {
            settings,
            backends,
            registry,
            metrics,
        }
    }

    /// Registry of advertised VolumeClasses, filled once `run` starts
    pub fn registry(&self) -> Arc<VolumeClassRegistry> {
        self.registry.clone()
    }

    fn source<E>(&self, list_watch: ListWatchRef<E>, kind: &str) -> ListWatchSource<E>
    where
        E: Clone + Send + Sync + 'static,
    {
        let options = ListWatchSourceOptions::for_kind(kind).with_resync_interval(self.settings.resync_interval);
        let source = ListWatchSource::new(list_watch, options);
        match &self.metrics {
            Some(metrics) => source.with_metrics(metrics.clone()),
            None => source,
        }
    }

    /// Run until `cancel` fires or an event source cannot be started
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let reconciler = Arc::new(VolumePoolReconciler::new(
            self.settings.reconciler.clone(),
            self.backends.stores.clone(),
        ));
        let controller = VolumePoolController::new(
            reconciler,
            self.settings.controller.clone(),
            self.metrics.clone(),
        );

        let pools = self.source(self.backends.volume_pools.clone(), "VolumePool");
        let block_pools = self.source(self.backends.block_pools.clone(), "CephBlockPool");
        let clients = self.source(self.backends.clients.clone(), "CephClient");
        let classes = self.source(self.backends.volume_classes.clone(), "VolumeClass");

        controller.watch_pools(&pools);
        controller.watch_owned(&block_pools);
        controller.watch_owned(&clients);
        controller.watch_volume_classes(&classes);
        classes.add_handler(self.registry.clone() as Arc<dyn Handler<VolumeClass>>);

        info!(
            provider = %self.settings.reconciler.provider,
            cluster_id = %self.settings.reconciler.cluster_id,
            rook_namespace = %self.settings.reconciler.rook_namespace,
            "Starting operator"
        );

        let sources = async {
            let result = tokio::try_join!(
                pools.start(cancel.clone()),
                block_pools.start(cancel.clone()),
                clients.start(cancel.clone()),
                classes.start(cancel.clone()),
            );
            if let Err(e) = &result {
                error!(error = %e, "Event source failed, stopping operator");
                cancel.cancel();
            }
            result.map(|_| ())
        };

        let (result, ()) = tokio::join!(sources, controller.run(cancel.clone()));
        info!("Operator stopped");
        result
    }
}
