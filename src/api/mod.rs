//! HTTP API: router, shared state, response envelope and middleware.

mod collection;
mod config;
mod documents;
pub mod error;
mod graph;
mod query;
mod system;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{DefaultBodyLimit, MatchedPath, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::constants::MAX_UPLOAD_BYTES;
use crate::health::HealthChecker;
use crate::lightrag::LightRag;
use crate::manager::LightRagManager;
use crate::metrics;
use crate::service::ServiceManager;

pub use error::{ApiError, ApiResult};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<LightRagManager>,
    pub service: Arc<ServiceManager>,
    pub health: Arc<HealthChecker>,
}

impl AppState {
    pub fn new(manager: Arc<LightRagManager>, service: Arc<ServiceManager>) -> Self {
        let health = Arc::new(HealthChecker::new(Arc::clone(&service), Arc::clone(&manager)));
        Self {
            manager,
            service,
            health,
        }
    }

    /// Existing collection instance, or 404.
    pub async fn collection(&self, id: &str) -> ApiResult<Arc<LightRag>> {
        self.manager
            .get_rag_instance(id)
            .await?
            .ok_or_else(ApiError::collection_not_found)
    }
}

/// `{status: "success", message?, data?}`
#[derive(Debug, Serialize)]
pub struct GenericResponse<T: Serialize> {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

pub fn success<T: Serialize>(message: impl Into<String>, data: T) -> Json<GenericResponse<T>> {
    Json(GenericResponse {
        status: "success",
        message: Some(message.into()),
        data: Some(data),
    })
}

pub fn success_data<T: Serialize>(data: T) -> Json<GenericResponse<T>> {
    Json(GenericResponse {
        status: "success",
        message: None,
        data: Some(data),
    })
}

#[derive(Debug, Deserialize)]
pub struct CollectionQuery {
    pub collection_id: String,
}

pub fn timestamp() -> String {
    chrono::Local::now().to_rfc3339()
}

pub type JsonMap = Map<String, Value>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/collection",
            get(collection::list_collections)
                .post(collection::create_collection)
                .delete(collection::delete_collection),
        )
        .route("/collection/batch", post(collection::batch_collections))
        .route("/documents", get(documents::list_documents))
        .route("/documents/chunk", get(documents::document_chunks))
        .route("/documents/upload", post(documents::upload))
        .route("/documents/scan", post(documents::scan))
        .route("/documents/pipeline_status", get(documents::pipeline_status))
        .route("/documents/track_status", get(documents::track_status))
        .route("/documents/delete_document", delete(documents::delete_documents))
        .route("/query", post(query::query))
        .route("/graph", get(graph::knowledge_graph))
        .route("/graph/label", get(graph::labels))
        .route("/graph/entity", get(graph::entity_exists).post(graph::edit_entity))
        .route("/graph/relation", post(graph::edit_relation))
        .route("/config", get(config::get_config))
        .route("/config/llm", post(config::update_llm))
        .route("/config/embedding", post(config::update_embedding))
        .route("/config/rerank", post(config::update_rerank))
        .route("/config/test", post(config::test_config))
        .route("/config/info", get(config::info))
        .route("/config/backups", get(config::backups))
        .route("/config/restore", post(config::restore))
        .route("/config/reset", post(config::reset))
        .route("/overview", get(system::overview))
        .route("/service-info", get(system::service_info))
        .route("/metrics", get(system::metrics))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .with_state(state)
}

/// Connection counters and request metrics keyed by the matched route.
async fn track_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    state.service.increment_connections();
    metrics::record_request_start(&route);
    let started = Instant::now();
    let response = next.run(request).await;
    metrics::record_request_result(&method, &route, started.elapsed(), response.status().as_u16());
    state.service.decrement_connections();
    response
}

/// Permissive CORS for browser front-ends; whatever the caller asks for is mirrored back.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_credentials(true)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .max_age(Duration::from_secs(600))
}
