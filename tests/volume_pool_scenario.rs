//! End-to-end VolumePool scenarios against in-memory stores

use assert_matches::assert_matches;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use volume_pool_operator::controller::naming::{MANAGER, POOL_LABEL};
use volume_pool_operator::crd::{
    CephBlockPoolStatus, CephClientStatus, CLIENT_SECRET_INFO_KEY, ENABLE_RBD_STATS_DEFAULT,
};
use volume_pool_operator::{
    CephPhase, ClassReference, ControllerOptions, Error, LabelSelector, MemoryBackend, ObjectKey,
    ObjectStore, Operator, OperatorSettings, ReconcilerConfig, VolumeClass, VolumeClassSpec,
    VolumePool, VolumePoolReconciler, VolumePoolSpec, VolumePoolState,
};

const ROOK_NS: &str = "rook-ceph";
const CLUSTER_ID: &str = "c1";
const POOL: &str = "pool-a";
const BACKEND_POOL: &str = "c1--pool-a";
const CSI_DRIVER: &str = "rook-ceph.rbd.csi.ceph.com";
const ROOK_SECRET: &str = "rook-ceph-client-c1--pool-a";

fn reconciler_config() -> ReconcilerConfig {
    ReconcilerConfig {
        provider: "ceph".to_string(),
        cluster_id: CLUSTER_ID.to_string(),
        rook_namespace: ROOK_NS.to_string(),
        csi_driver_name: CSI_DRIVER.to_string(),
        volume_class_selector: LabelSelector::default().with("suitable-for", "testing"),
        enable_rbd_stats: ENABLE_RBD_STATS_DEFAULT,
    }
}

fn setup() -> (MemoryBackend, VolumePoolReconciler) {
    let backend = MemoryBackend::new(ROOK_NS);
    let reconciler = VolumePoolReconciler::new(reconciler_config(), backend.backends().stores);
    (backend, reconciler)
}

async fn create_pool(backend: &MemoryBackend, name: &str, provider_id: &str) -> ObjectKey {
    let pool = VolumePool::new(
        name,
        VolumePoolSpec {
            provider_id: provider_id.to_string(),
            replication: 3,
        },
    );
    backend.volume_pools.create(&pool).await.unwrap();
    ObjectKey::cluster(name)
}

async fn set_backend_phase(backend: &MemoryBackend, phase: CephPhase) {
    let mut block_pool = backend.block_pools.get(BACKEND_POOL).await.unwrap().unwrap();
    block_pool.status = Some(CephBlockPoolStatus { phase: Some(phase) });
    backend.block_pools.update_status(&block_pool).await.unwrap();
}

/// Play Rook: mark the client ready and publish its generated secret
async fn make_client_ready(backend: &MemoryBackend) {
    let mut data = BTreeMap::new();
    data.insert(BACKEND_POOL.to_string(), ByteString(b"AQD0c2VjcmV0".to_vec()));
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(ROOK_SECRET.to_string()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    };
    backend.secrets.create(&secret).await.unwrap();

    let mut client = backend.clients.get(BACKEND_POOL).await.unwrap().unwrap();
    let mut info = BTreeMap::new();
    info.insert(CLIENT_SECRET_INFO_KEY.to_string(), ROOK_SECRET.to_string());
    client.status = Some(CephClientStatus {
        phase: Some(CephPhase::Ready),
        info,
    });
    backend.clients.update_status(&client).await.unwrap();
}

async fn add_volume_class(backend: &MemoryBackend, suitable_for: &str) -> String {
    let mut class = VolumeClass::new("", VolumeClassSpec::with_limits(100, 1));
    class.metadata.name = None;
    class.metadata.generate_name = Some("sc-".to_string());
    class
        .labels_mut()
        .insert("suitable-for".to_string(), suitable_for.to_string());
    backend.volume_classes.create(&class).await.unwrap().name_any()
}

async fn pool_status(backend: &MemoryBackend) -> (Option<VolumePoolState>, Vec<ClassReference>) {
    let pool = backend.volume_pools.get(POOL).await.unwrap().unwrap();
    match pool.status {
        Some(status) => (Some(status.state), status.available_volume_classes),
        None => (None, vec![]),
    }
}

/// Reconcile a pool whose backend is ready and whose client is ready
async fn available_pool(backend: &MemoryBackend, reconciler: &VolumePoolReconciler) -> ObjectKey {
    let key = create_pool(backend, POOL, "ceph://pool-a").await;
    reconciler.reconcile(&key).await.unwrap();
    set_backend_phase(backend, CephPhase::Ready).await;
    assert!(reconciler.reconcile(&key).await.unwrap_err().is_not_ready());
    make_client_ready(backend).await;
    reconciler.reconcile(&key).await.unwrap();
    key
}

// =============================================================================
// Phase Mapping
// =============================================================================

#[tokio::test]
async fn phase_table_drives_published_state() {
    let (backend, reconciler) = setup();
    let key = create_pool(&backend, POOL, "ceph://pool-a").await;

    reconciler.reconcile(&key).await.unwrap();
    assert_eq!(pool_status(&backend).await.0, Some(VolumePoolState::Pending));

    set_backend_phase(&backend, CephPhase::Progressing).await;
    reconciler.reconcile(&key).await.unwrap();
    assert_eq!(pool_status(&backend).await.0, Some(VolumePoolState::Pending));

    set_backend_phase(&backend, CephPhase::Failure).await;
    reconciler.reconcile(&key).await.unwrap();
    assert_eq!(pool_status(&backend).await.0, Some(VolumePoolState::NotAvailable));
    assert!(backend.clients.is_empty());

    set_backend_phase(&backend, CephPhase::Ready).await;
    let err = reconciler.reconcile(&key).await.unwrap_err();
    assert_matches!(err, Error::DependencyNotReady { .. });
    // Downstream resources are attempted once the backend is ready
    assert_eq!(backend.clients.len(), 1);

    make_client_ready(&backend).await;
    reconciler.reconcile(&key).await.unwrap();
    assert_eq!(pool_status(&backend).await.0, Some(VolumePoolState::Available));
}

// =============================================================================
// Provider Filtering
// =============================================================================

#[tokio::test]
async fn pool_of_other_provider_is_left_alone() {
    let (backend, reconciler) = setup();
    let key = create_pool(&backend, "custom-pool", "custom://custom-pool").await;
    let writes = backend.write_count();

    reconciler.reconcile(&key).await.unwrap();

    assert_eq!(backend.write_count(), writes);
    assert!(backend.block_pools.is_empty());
    let pool = backend.volume_pools.get("custom-pool").await.unwrap().unwrap();
    assert!(pool.status.is_none());
}

// =============================================================================
// Idempotence
// =============================================================================

#[tokio::test]
async fn second_pass_has_no_side_effects() {
    let (backend, reconciler) = setup();
    add_volume_class(&backend, "testing").await;
    let key = available_pool(&backend, &reconciler).await;

    let writes = backend.write_count();
    let before = backend.volume_pools.get(POOL).await.unwrap().unwrap();

    reconciler.reconcile(&key).await.unwrap();

    assert_eq!(backend.write_count(), writes);
    let after = backend.volume_pools.get(POOL).await.unwrap().unwrap();
    assert_eq!(before.status, after.status);
    assert_eq!(before.resource_version(), after.resource_version());
}

#[tokio::test]
async fn pending_pass_is_idempotent() {
    let (backend, reconciler) = setup();
    let key = create_pool(&backend, POOL, "ceph://pool-a").await;

    reconciler.reconcile(&key).await.unwrap();
    let writes = backend.write_count();
    reconciler.reconcile(&key).await.unwrap();

    assert_eq!(backend.write_count(), writes);
    assert_eq!(backend.block_pools.len(), 1);
}

// =============================================================================
// Capability List
// =============================================================================

#[tokio::test]
async fn class_list_is_replaced_not_merged() {
    let (backend, reconciler) = setup();
    let first = add_volume_class(&backend, "testing").await;
    add_volume_class(&backend, "production").await;
    let key = available_pool(&backend, &reconciler).await;

    assert_eq!(pool_status(&backend).await.1, vec![ClassReference::new(first.clone())]);

    let second = add_volume_class(&backend, "testing").await;
    reconciler.reconcile(&key).await.unwrap();

    let mut expected = vec![ClassReference::new(first.clone()), ClassReference::new(second)];
    expected.sort();
    assert_eq!(pool_status(&backend).await.1, expected);

    // A class that stops matching disappears from the list
    backend.volume_classes.delete(&first);
    reconciler.reconcile(&key).await.unwrap();
    assert_eq!(pool_status(&backend).await.1.len(), 1);
}

#[tokio::test]
async fn class_list_survives_backend_failure() {
    let (backend, reconciler) = setup();
    add_volume_class(&backend, "testing").await;
    let key = available_pool(&backend, &reconciler).await;
    let classes = pool_status(&backend).await.1;
    assert_eq!(classes.len(), 1);

    set_backend_phase(&backend, CephPhase::Failure).await;
    reconciler.reconcile(&key).await.unwrap();

    let (state, after) = pool_status(&backend).await;
    assert_eq!(state, Some(VolumePoolState::NotAvailable));
    assert_eq!(after, classes);
}

// =============================================================================
// Ownership
// =============================================================================

#[tokio::test]
async fn unmarked_client_is_not_adopted() {
    let (backend, reconciler) = setup();
    let key = create_pool(&backend, POOL, "ceph://pool-a").await;
    reconciler.reconcile(&key).await.unwrap();
    set_backend_phase(&backend, CephPhase::Ready).await;

    let foreign = volume_pool_operator::CephClient::new(
        BACKEND_POOL,
        volume_pool_operator::crd::CephClientSpec::for_pool("other"),
    );
    backend.clients.create(&foreign).await.unwrap();
    let writes = backend.write_count();

    let err = reconciler.reconcile(&key).await.unwrap_err();
    assert_matches!(err, Error::OwnershipConflict { ref kind, ref name } if kind == "CephClient" && name == BACKEND_POOL);
    assert_eq!(backend.write_count(), writes);
}

// =============================================================================
// Full Scenario
// =============================================================================

#[tokio::test]
async fn pool_lifecycle() {
    let (backend, reconciler) = setup();
    let key = create_pool(&backend, POOL, "ceph://pool-a").await;

    // Block pool created with the requested replication
    reconciler.reconcile(&key).await.unwrap();
    let block_pool = backend.block_pools.get(BACKEND_POOL).await.unwrap().unwrap();
    assert_eq!(block_pool.spec.replicated.size, 3);
    assert_eq!(block_pool.spec.enable_rbd_stats, ENABLE_RBD_STATS_DEFAULT);
    assert_eq!(block_pool.namespace().as_deref(), Some(ROOK_NS));

    set_backend_phase(&backend, CephPhase::Progressing).await;
    reconciler.reconcile(&key).await.unwrap();
    assert_eq!(pool_status(&backend).await.0, Some(VolumePoolState::Pending));

    // Ready: credentials and classes appear
    set_backend_phase(&backend, CephPhase::Ready).await;
    assert!(reconciler.reconcile(&key).await.unwrap_err().is_not_ready());
    let client = backend.clients.get(BACKEND_POOL).await.unwrap().unwrap();
    assert!(MANAGER.is_marked(client.labels()));
    assert_eq!(client.labels().get(POOL_LABEL).map(String::as_str), Some(POOL));
    assert_eq!(client.spec.caps["osd"], format!("profile rbd pool={}", BACKEND_POOL));

    make_client_ready(&backend).await;
    let class = add_volume_class(&backend, "testing").await;
    add_volume_class(&backend, "production").await;
    reconciler.reconcile(&key).await.unwrap();

    let pool = backend.volume_pools.get(POOL).await.unwrap().unwrap();
    assert_eq!(pool.access_secret(), Some(ROOK_SECRET));
    let status = pool.status.clone().unwrap();
    assert_eq!(status.state, VolumePoolState::Available);
    assert_eq!(status.available_volume_classes, vec![ClassReference::new(class)]);

    let secret = backend.secrets.get(BACKEND_POOL).await.unwrap().unwrap();
    let data = secret.data.unwrap();
    assert_eq!(data["userID"], ByteString(BACKEND_POOL.as_bytes().to_vec()));
    assert_eq!(data["userKey"], ByteString(b"AQD0c2VjcmV0".to_vec()));

    let storage_class = backend.storage_classes.get(BACKEND_POOL).await.unwrap().unwrap();
    assert_eq!(storage_class.provisioner, CSI_DRIVER);
    let parameters = storage_class.parameters.unwrap();
    assert_eq!(parameters["pool"], BACKEND_POOL);
    assert_eq!(parameters["clusterID"], ROOK_NS);

    let snapshot_class = backend.snapshot_classes.get(BACKEND_POOL).await.unwrap().unwrap();
    assert_eq!(snapshot_class.driver, CSI_DRIVER);

    // Failure: state drops, children stay
    set_backend_phase(&backend, CephPhase::Failure).await;
    reconciler.reconcile(&key).await.unwrap();
    assert_eq!(pool_status(&backend).await.0, Some(VolumePoolState::NotAvailable));
    assert_eq!(backend.clients.len(), 1);
    assert_eq!(backend.storage_classes.len(), 1);
    assert_eq!(backend.snapshot_classes.len(), 1);

    // And recovers
    set_backend_phase(&backend, CephPhase::Ready).await;
    reconciler.reconcile(&key).await.unwrap();
    assert_eq!(pool_status(&backend).await.0, Some(VolumePoolState::Available));
    assert_eq!(backend.storage_classes.len(), 1);
}

// =============================================================================
// Running Operator
// =============================================================================

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn operator_converges_from_events() {
    let backend = MemoryBackend::new(ROOK_NS);
    let settings = OperatorSettings {
        reconciler: reconciler_config(),
        controller: ControllerOptions {
            workers: 2,
            base_retry_delay: Duration::from_millis(5),
            max_retry_delay: Duration::from_millis(100),
        },
        resync_interval: Duration::from_secs(3600),
    };
    let operator = Operator::new(settings, backend.backends(), None);
    let registry = operator.registry();
    let cancel = CancellationToken::new();
    let running = tokio::spawn(operator.run(cancel.clone()));

    create_pool(&backend, POOL, "ceph://pool-a").await;
    eventually(|| async { backend.block_pools.get(BACKEND_POOL).await.unwrap().is_some() }).await;
    eventually(|| async { pool_status(&backend).await.0 == Some(VolumePoolState::Pending) }).await;

    // Backend status changes reach the pool through the block pool watch
    set_backend_phase(&backend, CephPhase::Ready).await;
    eventually(|| async { !backend.clients.is_empty() }).await;

    make_client_ready(&backend).await;
    eventually(|| async { pool_status(&backend).await.0 == Some(VolumePoolState::Available) }).await;

    // New classes reach the pool through the VolumeClass watch
    let class = add_volume_class(&backend, "testing").await;
    let expected = vec![ClassReference::new(class.clone())];
    eventually(|| async { pool_status(&backend).await.1 == expected }).await;
    eventually(|| async { registry.get(&class).is_some() }).await;

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn operator_stops_when_cancelled_before_events() {
    let backend = MemoryBackend::new(ROOK_NS);
    let settings = OperatorSettings {
        reconciler: reconciler_config(),
        controller: ControllerOptions::default(),
        resync_interval: Duration::from_secs(3600),
    };
    let cancel = CancellationToken::new();
    let operator = Operator::new(settings, backend.backends(), None);
    let running = tokio::spawn(operator.run(cancel.clone()));

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
    assert!(result.is_ok());
}
