//! Serving adapter
//!
//! Owns the reference table, the artifact and the readiness gate, and
//! exposes the operations the transport calls: `load` once at startup,
//! then `predict`, `class_names` and `init_metadata` per request.


use crate::artifact::{Artifact, ArtifactLoader, OnnxArtifactLoader};
use crate::error::{LoadError, ServingError, StorageError};
use crate::health::{LoadState, ReadinessGate, ReadinessResponse};
use crate::metadata::MetadataResolver;
use crate::models::{InputMode, Matrix, Metadata, RequestMeta};
use crate::observability::{ServingMetrics, StructuredLogger};
use crate::predictor::{FeatureEnricher, PredictionDispatcher};
use crate::reference::{KeyColumns, ReferenceTable};
use crate::storage::{ArtifactStore, Location, ReferenceSource, Storage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tract_onnx::prelude::tract_ndarray::ArrayView2;
use tracing::{debug, info};

/// Default directory for downloaded artifacts
pub const DEFAULT_CACHE_DIR: &str = "/tmp/model-server/artifacts";

/// Construction-time settings; never change after the adapter is built
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Artifact location, resolved by the artifact store
    pub model_uri: String,
    /// Reference table location
    pub reference_uri: String,
    pub input_mode: InputMode,
    pub key_columns: KeyColumns,
}

impl AdapterConfig {
    pub fn new(model_uri: impl Into<String>, reference_uri: impl Into<String>) -> Self {
        Self {
            model_uri: model_uri.into(),
            reference_uri: reference_uri.into(),
            input_mode: InputMode::default(),
            key_columns: KeyColumns::default(),
        }
    }

    pub fn with_input_mode(mut self, input_mode: InputMode) -> Self {
        self.input_mode = input_mode;
        self
    }

    pub fn with_key_columns(mut self, key_columns: KeyColumns) -> Self {
        self.key_columns = key_columns;
        self
    }
}

/// State published by a successful load
struct LoadedModel {
    artifact: Box<dyn Artifact>,
    reference: ReferenceTable,
}

/// Builder for [`ModelAdapter`]
pub struct ModelAdapterBuilder {
    config: AdapterConfig,
    artifact_store: Option<Arc<dyn ArtifactStore>>,
    reference_source: Option<Arc<dyn ReferenceSource>>,
    artifact_loader: Option<Arc<dyn ArtifactLoader>>,
    cache_dir: PathBuf,
    replica_name: String,
}

impl ModelAdapterBuilder {
    pub fn new(config: AdapterConfig) -> Self {
        Self {
            config,
            artifact_store: None,
            reference_source: None,
            artifact_loader: None,
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            replica_name: "unknown".to_string(),
        }
    }

    pub fn artifact_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifact_store = Some(store);
        self
    }

    pub fn reference_source(mut self, source: Arc<dyn ReferenceSource>) -> Self {
        self.reference_source = Some(source);
        self
    }

    pub fn artifact_loader(mut self, loader: Arc<dyn ArtifactLoader>) -> Self {
        self.artifact_loader = Some(loader);
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn replica_name(mut self, name: impl Into<String>) -> Self {
        self.replica_name = name.into();
        self
    }

    /// Fill missing collaborators with [`Storage`] and the ONNX loader
    pub fn build(self) -> Result<ModelAdapter, StorageError> {
        let mut storage = None;
        let artifact_store: Arc<dyn ArtifactStore> = match self.artifact_store {
            Some(store) => store,
            None => shared_storage(&mut storage, &self.cache_dir)?,
        };
        let reference_source: Arc<dyn ReferenceSource> = match self.reference_source {
            Some(source) => source,
            None => shared_storage(&mut storage, &self.cache_dir)?,
        };
        let artifact_loader = self
            .artifact_loader
            .unwrap_or_else(|| Arc::new(OnnxArtifactLoader) as Arc<dyn ArtifactLoader>);

        let metrics = ServingMetrics::new();
        metrics.set_load_state(LoadState::Unloaded.code());
        metrics.set_model_info(&self.config.model_uri, self.config.input_mode.as_str());

        Ok(ModelAdapter {
            dispatcher: PredictionDispatcher::new(self.config.input_mode),
            config: self.config,
            artifact_store,
            reference_source,
            artifact_loader,
            gate: ReadinessGate::new(),
            metrics,
            logger: StructuredLogger::new(self.replica_name),
        })
    }
}

/// One [`Storage`] backs both collaborators when neither is supplied
fn shared_storage(
    slot: &mut Option<Arc<Storage>>,
    cache_dir: &Path,
) -> Result<Arc<Storage>, StorageError> {
    if let Some(storage) = slot {
        return Ok(storage.clone());
    }
    let storage = Arc::new(Storage::new(cache_dir)?);
    *slot = Some(storage.clone());
    Ok(storage)
}

/// Prediction-serving adapter for one model replica
pub struct ModelAdapter {
    config: AdapterConfig,
    artifact_store: Arc<dyn ArtifactStore>,
    reference_source: Arc<dyn ReferenceSource>,
    artifact_loader: Arc<dyn ArtifactLoader>,
    gate: ReadinessGate<LoadedModel>,
    dispatcher: PredictionDispatcher,
    metrics: ServingMetrics,
    logger: StructuredLogger,
}

impl ModelAdapter {
    pub fn builder(config: AdapterConfig) -> ModelAdapterBuilder {
        ModelAdapterBuilder::new(config)
    }

    pub fn is_ready(&self) -> bool {
        self.gate.is_ready()
    }

    pub fn state(&self) -> LoadState {
        self.gate.state()
    }

    pub fn readiness(&self) -> ReadinessResponse {
        self.gate.readiness()
    }

    /// Download the artifact, cache the reference table and open the gate.
    ///
    /// Runs at most once. Any failure leaves the adapter in `Failed`.
    pub async fn load(&self) -> Result<(), LoadError> {
        self.gate.begin_loading()?;
        self.metrics.set_load_state(LoadState::Loading.code());
        let start = Instant::now();

        let loaded = match self.load_inner().await {
            Ok(loaded) => loaded,
            Err(e) => {
                self.gate.fail();
                self.metrics.set_load_state(LoadState::Failed.code());
                self.logger
                    .log_model_load_failed(&self.config.model_uri, &e.to_string());
                return Err(e);
            }
        };

        let artifact = loaded.artifact.describe();
        let reference_rows = loaded.reference.len();
        let feature_count = loaded.reference.width();
        self.gate.open(loaded)?;

        self.metrics.set_reference_rows(reference_rows as i64);
        self.metrics.set_load_state(LoadState::Ready.code());
        self.logger.log_model_loaded(
            &artifact,
            reference_rows,
            feature_count,
            start.elapsed().as_millis(),
        );
        Ok(())
    }

    async fn load_inner(&self) -> Result<LoadedModel, LoadError> {
        let model_uri = &self.config.model_uri;
        info!(model_uri = %model_uri, "Downloading model");
        let path = self
            .artifact_store
            .download(model_uri)
            .await
            .map_err(|source| LoadError::Storage {
                location: model_uri.clone(),
                source,
            })?;

        let reference = ReferenceTable::load(
            self.reference_source.as_ref(),
            &self.config.reference_uri,
            &self.config.key_columns,
        )
        .await?;

        let loader = self.artifact_loader.clone();
        let feature_count = reference.width();
        let load_path = path.clone();
        let artifact = tokio::task::spawn_blocking(move || loader.load(&load_path, feature_count))
            .await
            .map_err(|e| LoadError::artifact(&path, e))??;

        Ok(LoadedModel {
            artifact,
            reference,
        })
    }

    /// Enrich `x` and run it through the artifact.
    ///
    /// `feature_names` labels the enriched columns in named mode. `meta` is
    /// accepted for transport compatibility and only logged.
    pub fn predict(
        &self,
        x: ArrayView2<'_, f64>,
        feature_names: &[String],
        meta: Option<&RequestMeta>,
    ) -> Result<Matrix, ServingError> {
        let start = Instant::now();
        let result = self.predict_inner(x, feature_names, meta);
        let elapsed = start.elapsed();

        match &result {
            Ok(output) => {
                self.metrics.inc_predictions();
                self.metrics.observe_prediction_latency(elapsed.as_secs_f64());
                debug!(rows = output.nrows(), columns = output.ncols(), "Prediction result");
            }
            Err(e) => {
                self.metrics.inc_prediction_errors(e.kind());
                debug!(error = %e, "Prediction failed");
            }
        }
        result
    }

    fn predict_inner(
        &self,
        x: ArrayView2<'_, f64>,
        feature_names: &[String],
        meta: Option<&RequestMeta>,
    ) -> Result<Matrix, ServingError> {
        let loaded = self.gate.get()?;
        debug!(rows = x.nrows(), columns = x.ncols(), meta = ?meta, "Requesting prediction");

        let start = Instant::now();
        let batch = FeatureEnricher::new(&loaded.reference).enrich(x)?;
        self.metrics
            .observe_enrichment_latency(start.elapsed().as_secs_f64());
        self.metrics.add_unmatched_keys(batch.stats.unmatched_rows as u64);
        self.metrics
            .add_duplicate_rows(batch.stats.duplicates_dropped as u64);
        debug!(stats = ?batch.stats, "Request enriched");

        let stats = batch.stats;
        let output = self
            .dispatcher
            .dispatch(batch.features, feature_names, loaded.artifact.as_ref())?;

        self.logger.log_prediction(
            stats.input_rows,
            output.nrows(),
            stats.unmatched_rows,
            start.elapsed().as_micros(),
        );
        Ok(output)
    }

    /// Output column names recorded from the first table-shaped prediction
    pub fn class_names(&self) -> Result<Vec<String>, ServingError> {
        self.dispatcher.class_names().map(<[String]>::to_vec)
    }

    /// Best-effort read of the metadata sidecar beside the model location.
    ///
    /// Independent of `load`; remote model locations yield an empty mapping.
    pub fn init_metadata(&self) -> Metadata {
        let base = match Location::parse(&self.config.model_uri) {
            Ok(Location::Local(path)) if path.is_file() => path
                .parent()
                .map(PathBuf::from)
                .unwrap_or_default(),
            Ok(Location::Local(path)) => path,
            Ok(Location::Http(url)) => {
                debug!(url = %url, "Metadata sidecar is only read from local model locations");
                return Metadata::new();
            }
            Err(e) => {
                debug!(error = %e, "Cannot resolve metadata location");
                return Metadata::new();
            }
        };
        MetadataResolver::new(base).resolve()
    }
}
