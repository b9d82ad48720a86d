//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::Serialize;

use crate::correlator::SubmitError;
use crate::health::{SetupResult, Status};
use crate::protocol::PredictionRequest;
use crate::runner::{HealthSnapshot, Runner};

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup: Option<SetupResult>,
}

impl From<HealthSnapshot> for HealthCheckResponse {
    fn from(snapshot: HealthSnapshot) -> Self {
        Self {
            status: snapshot.status,
            setup: snapshot.setup_result,
        }
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

async fn root() -> StatusCode {
    StatusCode::OK
}

async fn health_check(State(runner): State<Arc<Runner>>) -> Json<HealthCheckResponse> {
    Json(runner.health().into())
}

async fn openapi_schema(State(runner): State<Arc<Runner>>) -> Response {
    match runner.schema() {
        Some(schema) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            schema,
        )
            .into_response(),
        None => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "OpenAPI schema not available",
        ),
    }
}

fn should_respond_async(headers: &HeaderMap) -> bool {
    headers
        .get("prefer")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "respond-async")
        .unwrap_or(false)
}

fn submit_error_status(error: &SubmitError) -> StatusCode {
    match error {
        SubmitError::SetupFailed | SubmitError::Defunct => StatusCode::SERVICE_UNAVAILABLE,
        SubmitError::DuplicateId(_) => StatusCode::CONFLICT,
        SubmitError::InvalidId(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SubmitError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn create_prediction(
    State(runner): State<Arc<Runner>>,
    headers: HeaderMap,
    body: Option<Json<PredictionRequest>>,
) -> Response {
    if should_respond_async(&headers) {
        return error_response(
            StatusCode::NOT_IMPLEMENTED,
            "asynchronous predictions are not supported",
        );
    }

    let request = body.map(|Json(r)| r).unwrap_or_default();
    let handle = match runner.predict(request) {
        Ok(handle) => handle,
        Err(e) => return error_response(submit_error_status(&e), e.to_string()),
    };

    let prediction_id = handle.id().to_string();
    match handle.wait().await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => {
            tracing::error!(%prediction_id, error = %e, "Prediction lost");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn shutdown(State(runner): State<Arc<Runner>>) -> Response {
    tracing::info!("Shutdown requested via HTTP");
    match runner.shutdown() {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({}))).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Shutdown failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

pub fn routes(runner: Arc<Runner>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health-check", get(health_check))
        .route("/openapi.json", get(openapi_schema))
        .route("/predictions", post(create_prediction))
        .route("/shutdown", post(shutdown))
        .with_state(runner)
}
