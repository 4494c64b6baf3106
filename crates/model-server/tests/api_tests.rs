//! Integration tests for the model server HTTP endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use model_server::api::{create_router, AppState};
use serving_lib::artifact::{Artifact, ArtifactLoader};
use serving_lib::{
    matrix_from_rows, AdapterConfig, InvocationError, LoadError, ModelAdapter, ModelInput,
    PredictionOutput, Table,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const VOCAB: &str = "\
store_id,product_id,avg_sales,region
1,10,5,1
2,20,3,2
";

/// Sums each feature row and reports the row width as a second column
struct SumArtifact;

impl Artifact for SumArtifact {
    fn invoke(&self, input: ModelInput) -> Result<PredictionOutput, InvocationError> {
        let rows: Vec<Vec<f64>> = input
            .matrix()
            .rows()
            .into_iter()
            .map(|row| vec![row.sum(), row.len() as f64])
            .collect();
        let data = matrix_from_rows(&rows).map_err(InvocationError::msg)?;
        let table = Table::new(vec!["demand".to_string(), "width".to_string()], data)
            .map_err(InvocationError::msg)?;
        Ok(PredictionOutput::Table(table))
    }

    fn describe(&self) -> String {
        "sum-artifact".to_string()
    }
}

/// Labelled two-column output for batches, a bare single column otherwise
struct ShapeShiftingArtifact;

impl Artifact for ShapeShiftingArtifact {
    fn invoke(&self, input: ModelInput) -> Result<PredictionOutput, InvocationError> {
        let features = input.matrix();
        if features.nrows() > 1 {
            let table = Table::new(
                vec!["demand".to_string(), "stock".to_string()],
                features.to_owned(),
            )
            .map_err(InvocationError::msg)?;
            return Ok(PredictionOutput::Table(table));
        }
        let sums: Vec<Vec<f64>> = features.rows().into_iter().map(|r| vec![r.sum()]).collect();
        let data = matrix_from_rows(&sums).map_err(InvocationError::msg)?;
        Ok(PredictionOutput::Matrix(data))
    }

    fn describe(&self) -> String {
        "shape-shifting-artifact".to_string()
    }
}

struct SumLoader;

impl ArtifactLoader for SumLoader {
    fn load(&self, _path: &Path, _feature_count: usize) -> Result<Box<dyn Artifact>, LoadError> {
        Ok(Box::new(SumArtifact))
    }
}

struct ShapeShiftingLoader;

impl ArtifactLoader for ShapeShiftingLoader {
    fn load(&self, _path: &Path, _feature_count: usize) -> Result<Box<dyn Artifact>, LoadError> {
        Ok(Box::new(ShapeShiftingArtifact))
    }
}

fn setup_test_app(dir: &TempDir) -> (Router, Arc<ModelAdapter>) {
    setup_with_loader(dir, Arc::new(SumLoader))
}

fn setup_with_loader(
    dir: &TempDir,
    loader: Arc<dyn ArtifactLoader>,
) -> (Router, Arc<ModelAdapter>) {
    let model_dir = dir.path().join("model");
    std::fs::create_dir_all(&model_dir).unwrap();
    std::fs::write(model_dir.join("model.onnx"), b"opaque").unwrap();
    std::fs::write(dir.path().join("vocab.csv"), VOCAB).unwrap();

    let config = AdapterConfig::new(
        model_dir.to_string_lossy(),
        dir.path().join("vocab.csv").to_string_lossy(),
    );
    let adapter = ModelAdapter::builder(config)
        .artifact_loader(loader)
        .cache_dir(dir.path().join("cache"))
        .replica_name("api-test")
        .build()
        .unwrap();
    let adapter = Arc::new(adapter);

    let state = Arc::new(AppState::new(adapter.clone()));
    (create_router(state), adapter)
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_prediction(body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/v1.0/predictions")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_readyz_before_and_after_load() {
    let dir = TempDir::new().unwrap();
    let (app, adapter) = setup_test_app(&dir);

    let (status, body) = send(app.clone(), get("/readyz")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["ready"], false);
    assert_eq!(body["state"], "unloaded");

    adapter.load().await.unwrap();

    let (status, body) = send(app, get("/readyz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
}

#[tokio::test]
async fn test_healthz_reports_failed_load() {
    let dir = TempDir::new().unwrap();
    let (app, adapter) = setup_test_app(&dir);

    let (status, body) = send(app.clone(), get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    std::fs::remove_file(dir.path().join("vocab.csv")).unwrap();
    assert!(adapter.load().await.is_err());

    let (status, body) = send(app, get("/healthz")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["state"], "failed");
}

#[tokio::test]
async fn test_prediction_before_load_is_not_ready() {
    let dir = TempDir::new().unwrap();
    let (app, _adapter) = setup_test_app(&dir);

    let request = post_prediction(serde_json::json!({
        "data": { "ndarray": [[1.0, 10.0]] }
    }));
    let (status, body) = send(app, request).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"]["code"], 503);
    assert_eq!(body["status"]["reason"], "NOT_READY");
}

#[tokio::test]
async fn test_prediction_enriches_and_reports_schema() {
    let dir = TempDir::new().unwrap();
    let (app, adapter) = setup_test_app(&dir);
    adapter.load().await.unwrap();

    let request = post_prediction(serde_json::json!({
        "data": { "names": ["store_id", "product_id"], "ndarray": [[1, 10], [2, 20], [9, 99]] },
        "meta": { "puid": "abc" }
    }));
    let (status, body) = send(app.clone(), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["names"], serde_json::json!(["demand", "width"]));
    // the unknown key enriches to zeros
    assert_eq!(
        body["data"]["ndarray"],
        serde_json::json!([[6.0, 2.0], [5.0, 2.0], [0.0, 2.0]])
    );

    let (status, body) = send(app, get("/api/v1.0/class-names")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["names"], serde_json::json!(["demand", "width"]));
}

#[tokio::test]
async fn test_ragged_input_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (app, adapter) = setup_test_app(&dir);
    adapter.load().await.unwrap();

    let request = post_prediction(serde_json::json!({
        "data": { "ndarray": [[1, 10], [2]] }
    }));
    let (status, body) = send(app, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"]["reason"], "INVALID_INPUT");
}

#[tokio::test]
async fn test_single_column_input_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (app, adapter) = setup_test_app(&dir);
    adapter.load().await.unwrap();

    let request = post_prediction(serde_json::json!({
        "data": { "ndarray": [[1], [2]] }
    }));
    let (status, body) = send(app, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"]["reason"], "INVALID_INPUT");
}

#[tokio::test]
async fn test_class_names_unavailable_before_first_table() {
    let dir = TempDir::new().unwrap();
    let (app, adapter) = setup_test_app(&dir);
    adapter.load().await.unwrap();

    let (status, body) = send(app, get("/api/v1.0/class-names")).await;

    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert_eq!(body["status"]["reason"], "SCHEMA_UNAVAILABLE");
}

#[tokio::test]
async fn test_metadata_endpoint() {
    let dir = TempDir::new().unwrap();
    let (app, _adapter) = setup_test_app(&dir);

    let (status, body) = send(app.clone(), get("/api/v1.0/metadata")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!({}));

    std::fs::write(
        dir.path().join("model").join("metadata.yaml"),
        "name: demand\nversions:\n  - v2\n",
    )
    .unwrap();

    let (status, body) = send(app, get("/api/v1.0/metadata")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "demand");
    assert_eq!(body["versions"], serde_json::json!(["v2"]));
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let dir = TempDir::new().unwrap();
    let (app, _adapter) = setup_test_app(&dir);

    let response = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn test_malformed_body_is_invalid_input() {
    let dir = TempDir::new().unwrap();
    let (app, adapter) = setup_test_app(&dir);
    adapter.load().await.unwrap();

    let request = post_prediction(serde_json::json!({ "data": { "ndarray": "oops" } }));
    let (status, body) = send(app.clone(), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"]["code"], 400);
    assert_eq!(body["status"]["reason"], "INVALID_INPUT");

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1.0/predictions")
        .header("content-type", "application/json")
        .body(Body::from("{\"data\": [1, 2"))
        .unwrap();
    let (status, body) = send(app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"]["reason"], "INVALID_INPUT");
    assert!(body["status"]["info"].is_string());
}

#[tokio::test]
async fn test_response_names_only_when_widths_match() {
    let dir = TempDir::new().unwrap();
    let (app, adapter) = setup_with_loader(&dir, Arc::new(ShapeShiftingLoader));
    adapter.load().await.unwrap();

    let batch = post_prediction(serde_json::json!({ "data": { "ndarray": [[1, 10], [2, 20]] } }));
    let (status, body) = send(app.clone(), batch).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["names"], serde_json::json!(["demand", "stock"]));

    let single = post_prediction(serde_json::json!({ "data": { "ndarray": [[1, 10]] } }));
    let (status, body) = send(app.clone(), single).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["names"], serde_json::json!([]));
    assert_eq!(body["data"]["ndarray"], serde_json::json!([[6.0]]));

    let (status, body) = send(app, get("/api/v1.0/class-names")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["names"], serde_json::json!(["demand", "stock"]));
}
