//! Error types for loading and serving

use crate::health::LoadState;
use std::path::PathBuf;
use thiserror::Error;

/// Per-request failures surfaced to the transport
#[derive(Debug, Error)]
pub enum ServingError {
    /// Prediction requested before a successful load
    #[error("model not loaded yet")]
    NotReady,

    #[error(transparent)]
    Invocation(#[from] InvocationError),

    /// No structured-table prediction has been observed
    #[error("prediction result is not a table, no output schema recorded")]
    SchemaUnavailable,

    #[error("invalid request: {0}")]
    InvalidInput(String),
}

impl ServingError {
    /// Stable label used for metrics and transport status reasons
    pub fn kind(&self) -> &'static str {
        match self {
            ServingError::NotReady => "not_ready",
            ServingError::Invocation(_) => "invocation_error",
            ServingError::SchemaUnavailable => "schema_unavailable",
            ServingError::InvalidInput(_) => "invalid_input",
        }
    }
}

/// Fatal failures while loading the artifact or the reference table
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("load already attempted, adapter is {0}")]
    InvalidState(LoadState),

    #[error("failed to fetch {location}: {source}")]
    Storage {
        location: String,
        #[source]
        source: StorageError,
    },

    #[error("malformed reference table: {0}")]
    Reference(String),

    #[error("invalid artifact at {}: {message}", path.display())]
    Artifact { path: PathBuf, message: String },
}

impl LoadError {
    pub fn artifact(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        LoadError::Artifact {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// Failure raised by the artifact while predicting, passed through verbatim
#[derive(Debug, Error)]
#[error("artifact invocation failed: {0:#}")]
pub struct InvocationError(pub anyhow::Error);

impl InvocationError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(err.into())
    }

    pub fn msg(message: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        Self(anyhow::Error::msg(message))
    }
}

/// Matrix or table construction from untyped input
#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("row {row} has {len} values, expected {expected}")]
    Ragged {
        row: usize,
        len: usize,
        expected: usize,
    },

    #[error("{labels} column labels for a matrix with {columns} columns")]
    LabelCount { labels: usize, columns: usize },

    #[error(transparent)]
    Shape(#[from] tract_onnx::prelude::tract_ndarray::ShapeError),
}

/// Failures of the artifact store and reference source collaborators
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("unsupported location scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("{} does not exist", .0.display())]
    NotFound(PathBuf),

    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid location: {0}")]
    InvalidLocation(String),
}

/// Sidecar metadata problems; absorbed by the resolver and only logged
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata file {} does not exist", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read metadata file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("metadata file {} present but does not contain valid yaml: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("metadata file {} is not a key/value mapping", .0.display())]
    NotAMapping(PathBuf),
}
