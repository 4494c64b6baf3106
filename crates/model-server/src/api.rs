//! HTTP API for predictions, metadata, health checks and Prometheus metrics

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use serving_lib::{
    matrix_from_rows, matrix_to_rows, LoadState, ModelAdapter, RequestMeta, ServingError,
};
use std::sync::Arc;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub adapter: Arc<ModelAdapter>,
}

impl AppState {
    pub fn new(adapter: Arc<ModelAdapter>) -> Self {
        Self { adapter }
    }
}

/// Prediction request body
#[derive(Debug, Deserialize)]
pub struct PredictionRequest {
    pub data: RequestData,
    #[serde(default)]
    pub meta: Option<RequestMeta>,
}

#[derive(Debug, Deserialize)]
pub struct RequestData {
    /// Column labels used in named input mode
    #[serde(default)]
    pub names: Vec<String>,
    pub ndarray: Vec<Vec<f64>>,
}

/// Prediction response body
#[derive(Debug, Serialize)]
pub struct PredictionResponse {
    pub data: ResponseData,
    pub meta: RequestMeta,
}

#[derive(Debug, Serialize)]
pub struct ResponseData {
    pub names: Vec<String>,
    pub ndarray: Vec<Vec<f64>>,
}

#[derive(Debug, Serialize)]
pub struct ClassNamesResponse {
    pub names: Vec<String>,
}

/// Error mapped onto an HTTP status
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    reason: &'static str,
    info: String,
}

impl ApiError {
    fn bad_request(info: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            reason: "INVALID_INPUT",
            info: info.into(),
        }
    }

    fn internal(info: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            reason: "INTERNAL_ERROR",
            info: info.into(),
        }
    }
}

impl From<ServingError> for ApiError {
    fn from(err: ServingError) -> Self {
        let (status, reason) = match &err {
            ServingError::NotReady => (StatusCode::SERVICE_UNAVAILABLE, "NOT_READY"),
            ServingError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT"),
            ServingError::Invocation(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INVOCATION_ERROR"),
            ServingError::SchemaUnavailable => (StatusCode::NOT_IMPLEMENTED, "SCHEMA_UNAVAILABLE"),
        };
        Self {
            status,
            reason,
            info: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() && self.status != StatusCode::SERVICE_UNAVAILABLE {
            error!(reason = self.reason, info = %self.info, "Request failed");
        }
        let body = serde_json::json!({
            "status": {
                "code": self.status.as_u16(),
                "reason": self.reason,
                "info": self.info,
            }
        });
        (self.status, Json(body)).into_response()
    }
}

/// Run one prediction on a blocking thread
async fn predictions(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<PredictionRequest>, JsonRejection>,
) -> Result<Json<PredictionResponse>, ApiError> {
    let Json(request) = payload?;
    let x = matrix_from_rows(&request.data.ndarray)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let names = request.data.names;
    let meta = request.meta;

    let adapter = state.adapter.clone();
    let output =
        tokio::task::spawn_blocking(move || adapter.predict(x.view(), &names, meta.as_ref()))
            .await
            .map_err(|e| ApiError::internal(e.to_string()))??;

    // the recorded schema only labels outputs of the same width
    let names = state
        .adapter
        .class_names()
        .ok()
        .filter(|names| names.len() == output.ncols())
        .unwrap_or_default();

    Ok(Json(PredictionResponse {
        data: ResponseData {
            names,
            ndarray: matrix_to_rows(&output),
        },
        meta: RequestMeta::new(),
    }))
}

/// Sidecar metadata, empty when absent
async fn metadata(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::Value::Object(state.adapter.init_metadata()))
}

async fn class_names(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ClassNamesResponse>, ApiError> {
    let names = state.adapter.class_names()?;
    Ok(Json(ClassNamesResponse { names }))
}

/// Liveness - 503 only once loading has failed for good
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let load_state = state.adapter.state();
    let status_code = match load_state {
        LoadState::Failed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    let status = if status_code == StatusCode::OK {
        "healthy"
    } else {
        "unhealthy"
    };

    (
        status_code,
        Json(serde_json::json!({ "status": status, "state": load_state })),
    )
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.adapter.readiness();

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return ApiError::internal(e.to_string()).into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1.0/predictions", post(predictions))
        .route("/api/v1.0/metadata", get(metadata))
        .route("/api/v1.0/class-names", get(class_names))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
