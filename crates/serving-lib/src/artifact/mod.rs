//! Prediction artifacts
//!
//! An artifact is an opaque callable: it takes a feature matrix (bare or
//! labelled) and returns either a bare matrix or a labelled table.

mod onnx;

pub use onnx::{OnnxArtifact, OnnxArtifactLoader, CHECKSUM_SUFFIX, MODEL_FILE_NAME};

use crate::error::{InvocationError, LoadError};
use crate::models::{ModelInput, PredictionOutput};
use std::path::Path;

/// A loaded, invocable prediction artifact
pub trait Artifact: Send + Sync {
    /// Run the artifact on one batch
    fn invoke(&self, input: ModelInput) -> Result<PredictionOutput, InvocationError>;

    /// Short description for logs and metrics
    fn describe(&self) -> String;
}

/// Turns a resolved local path into an [`Artifact`]
pub trait ArtifactLoader: Send + Sync {
    /// `feature_count` is the width of the enriched matrices the artifact
    /// will receive.
    fn load(&self, path: &Path, feature_count: usize) -> Result<Box<dyn Artifact>, LoadError>;
}
