use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use super::{success, ApiResult, AppState, GenericResponse};
use crate::constants::VERSION;
use crate::health::HealthStatus;
use crate::metrics;

/// Full health report; 503 when unhealthy.
pub async fn overview(State(state): State<AppState>) -> ApiResult<Response> {
    let report = state.health.check_all_components().await;
    let mut data = serde_json::to_value(&report).map_err(crate::Error::from)?;
    data["service_info"] = json!(state.service.service_info());
    data["version"] = json!(VERSION);

    let (status, envelope, message) = match report.overall_status {
        HealthStatus::Healthy | HealthStatus::Degraded => {
            (StatusCode::OK, "success", "Service overview retrieved")
        }
        HealthStatus::Unhealthy => (
            StatusCode::SERVICE_UNAVAILABLE,
            "error",
            "Service is unhealthy",
        ),
        HealthStatus::Unknown => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "error",
            "Service health is unknown",
        ),
    };
    let body = GenericResponse {
        status: envelope,
        message: Some(message.to_string()),
        data: Some(data),
    };
    Ok((status, Json(body)).into_response())
}

pub async fn service_info(State(state): State<AppState>) -> ApiResult<Json<GenericResponse<Value>>> {
    let mut data = serde_json::to_value(state.service.service_info()).map_err(crate::Error::from)?;
    data["health_summary"] = state.health.health_summary();
    Ok(success("Service info retrieved", data))
}

pub async fn metrics() -> Response {
    let (body, content_type) = metrics::render();
    ([(header::CONTENT_TYPE, content_type)], body).into_response()
}
