//! Prediction dispatch
//!
//! Hands enriched features to the artifact in the configured representation
//! and normalizes whatever comes back to a bare matrix.

use crate::artifact::Artifact;
use crate::error::ServingError;
use crate::models::{InputMode, Matrix, ModelInput, PredictionOutput, Table};
use std::sync::OnceLock;
use tracing::debug;

/// Invokes the artifact and remembers the first output schema it sees
#[derive(Debug)]
pub struct PredictionDispatcher {
    mode: InputMode,
    output_schema: OnceLock<Vec<String>>,
}

impl PredictionDispatcher {
    pub fn new(mode: InputMode) -> Self {
        Self {
            mode,
            output_schema: OnceLock::new(),
        }
    }

    /// Run one batch through `artifact`.
    ///
    /// Invocation errors are returned as-is and leave the recorded schema
    /// untouched.
    pub fn dispatch(
        &self,
        features: Matrix,
        feature_names: &[String],
        artifact: &dyn Artifact,
    ) -> Result<Matrix, ServingError> {
        let input = match self.mode {
            InputMode::Array => ModelInput::Array(features),
            InputMode::Named if feature_names.is_empty() => {
                ModelInput::Frame(Table::positional(features))
            }
            InputMode::Named => Table::new(feature_names.to_vec(), features)
                .map(ModelInput::Frame)
                .map_err(|e| ServingError::InvalidInput(format!("feature_names: {}", e)))?,
        };

        match artifact.invoke(input)? {
            PredictionOutput::Matrix(m) => Ok(m),
            PredictionOutput::Table(table) => {
                let (columns, data) = table.into_parts();
                if self.output_schema.set(columns).is_ok() {
                    debug!(columns = ?self.output_schema.get(), "Output schema recorded");
                }
                Ok(data)
            }
        }
    }

    /// Column names of the first table-shaped prediction
    pub fn class_names(&self) -> Result<&[String], ServingError> {
        self.output_schema
            .get()
            .map(Vec::as_slice)
            .ok_or(ServingError::SchemaUnavailable)
    }
}
