//! REST API Handlers
//!
//! Read-only endpoints over the advertised VolumeClasses and the operator
//! configuration.

use crate::crd::VolumeClass;
use crate::registry::VolumeClassRegistry;
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::debug;

// =============================================================================
// Response Types
// =============================================================================

/// VolumeClass as served over the API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClassResponse {
    pub name: String,
    pub capabilities: BTreeMap<String, u64>,
    pub labels: BTreeMap<String, String>,
}

impl From<&VolumeClass> for VolumeClassResponse {
    fn from(class: &VolumeClass) -> Self {
        Self {
            name: class.name_any(),
            capabilities: class.spec.capabilities.clone(),
            labels: class.labels().clone(),
        }
    }
}

/// Operator identity and configuration summary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorInfoResponse {
    pub name: String,
    pub version: String,
    pub provider: String,
    pub cluster_id: String,
    pub rook_namespace: String,
    pub csi_driver_name: String,
    pub volume_class_selector: String,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    registry: Arc<VolumeClassRegistry>,
    info: OperatorInfoResponse,
}

impl RestRouter {
    pub fn new(registry: Arc<VolumeClassRegistry>, info: OperatorInfoResponse) -> Self {
        Self { registry, info }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            registry: self.registry,
            info: Arc::new(self.info),
        };

        Router::new()
            .route("/api/v1/volume-classes", get(list_volume_classes))
            .route("/api/v1/volume-classes/:name", get(get_volume_class))
            .route("/api/v1/info", get(get_info))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

#[derive(Clone)]
struct AppState {
    registry: Arc<VolumeClassRegistry>,
    info: Arc<OperatorInfoResponse>,
}

// =============================================================================
// Handlers
// =============================================================================

async fn list_volume_classes(State(state): State<AppState>) -> impl IntoResponse {
    let classes: Vec<VolumeClassResponse> = state
        .registry
        .list()
        .iter()
        .map(VolumeClassResponse::from)
        .collect();
    debug!(count = classes.len(), "Listing volume classes");
    Json(classes)
}

async fn get_volume_class(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.registry.get(&name) {
        Some(class) => (StatusCode::OK, Json(VolumeClassResponse::from(&class))).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiErrorResponse {
                error: "not_found".into(),
                message: format!("VolumeClass {} is not advertised", name),
            }),
        )
            .into_response(),
    }
}

async fn get_info(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.info.as_ref().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::VolumeClassSpec;
    use crate::domain::ports::LabelSelector;
    use crate::event::{Event, EventType, Handler};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn router() -> Router {
        let registry = Arc::new(VolumeClassRegistry::new(
            LabelSelector::default().with("suitable-for", "testing"),
        ));
        let mut class = VolumeClass::new("sc-fast", VolumeClassSpec::with_limits(100, 1));
        class
            .labels_mut()
            .insert("suitable-for".to_string(), "testing".to_string());
        registry.handle(Event::new(EventType::Created, class));

        let info = OperatorInfoResponse {
            name: "volume-pool-operator".into(),
            version: "test".into(),
            provider: "ceph".into(),
            cluster_id: "c1".into(),
            rook_namespace: "rook-ceph".into(),
            csi_driver_name: "rook-ceph.rbd.csi.ceph.com".into(),
            volume_class_selector: registry.selector().to_string(),
        };
        RestRouter::new(registry, info).build()
    }

    async fn get_json(uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_list_volume_classes() {
        let (status, body) = get_json("/api/v1/volume-classes").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["name"], "sc-fast");
        assert_eq!(body[0]["capabilities"]["iops"], 100);
    }

    #[tokio::test]
    async fn test_get_volume_class() {
        let (status, body) = get_json("/api/v1/volume-classes/sc-fast").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["capabilities"]["tps"], 1);

        let (status, body) = get_json("/api/v1/volume-classes/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn test_info() {
        let (status, body) = get_json("/api/v1/info").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["clusterId"], "c1");
        assert_eq!(body["volumeClassSelector"], "suitable-for=testing");
    }
}
