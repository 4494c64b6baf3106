//! ONNX artifacts executed with tract
//!
//! The model input is pinned to `[1, feature_count]` and optimized once at
//! load. Batches are run row by row and the outputs stacked. Graphs with a
//! single output produce a bare matrix, graphs with several outputs produce
//! a table labelled with the output names.

use super::{Artifact, ArtifactLoader};
use crate::error::{InvocationError, LoadError};
use crate::models::{Matrix, ModelInput, PredictionOutput, Table};
use anyhow::Context;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tract_onnx::prelude::*;
use tracing::{debug, info, warn};

/// File looked up when the artifact path is a directory
pub const MODEL_FILE_NAME: &str = "model.onnx";

/// Optional checksum sidecar, `<model file><suffix>`
pub const CHECKSUM_SUFFIX: &str = ".sha256";

/// Per-row latency above which a warning is logged
const MAX_ROW_INFERENCE_MS: u128 = 5;

type TractModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Loads `.onnx` files (or directories containing `model.onnx`)
#[derive(Debug, Default, Clone, Copy)]
pub struct OnnxArtifactLoader;

impl ArtifactLoader for OnnxArtifactLoader {
    fn load(&self, path: &Path, feature_count: usize) -> Result<Box<dyn Artifact>, LoadError> {
        Ok(Box::new(OnnxArtifact::load(path, feature_count)?))
    }
}

/// ONNX model with fixed input width
pub struct OnnxArtifact {
    model: TractModel,
    path: PathBuf,
    feature_count: usize,
    output_names: Vec<String>,
    output_widths: Vec<Option<usize>>,
}

impl OnnxArtifact {
    pub fn load(path: &Path, feature_count: usize) -> Result<Self, LoadError> {
        let model_path = if path.is_dir() {
            path.join(MODEL_FILE_NAME)
        } else {
            path.to_path_buf()
        };

        let bytes = std::fs::read(&model_path)
            .map_err(|e| LoadError::artifact(&model_path, format!("cannot read model: {}", e)))?;
        verify_checksum(&model_path, &bytes)?;

        let model = Self::load_model(&bytes, feature_count)
            .map_err(|e| LoadError::artifact(&model_path, format!("{:#}", e)))?;

        let graph = model.model();
        let outlets = graph
            .output_outlets()
            .map_err(|e| LoadError::artifact(&model_path, e))?;
        if outlets.is_empty() {
            return Err(LoadError::artifact(&model_path, "model declares no outputs"));
        }
        let output_names: Vec<String> = outlets
            .iter()
            .map(|o| {
                graph
                    .outlet_label(*o)
                    .map(str::to_string)
                    .unwrap_or_else(|| graph.node(o.node).name.clone())
            })
            .collect();
        let output_widths: Vec<Option<usize>> = outlets
            .iter()
            .map(|o| {
                graph
                    .outlet_fact(*o)
                    .ok()
                    .and_then(|f| f.shape.as_concrete().map(|d| d.iter().skip(1).product()))
            })
            .collect();

        info!(
            path = %model_path.display(),
            feature_count = feature_count,
            outputs = ?output_names,
            "ONNX artifact loaded"
        );

        Ok(Self {
            model,
            path: model_path,
            feature_count,
            output_names,
            output_widths,
        })
    }

    /// Parse and optimize an ONNX model from bytes
    fn load_model(bytes: &[u8], feature_count: usize) -> anyhow::Result<TractModel> {
        let model = tract_onnx::onnx()
            .model_for_read(&mut std::io::Cursor::new(bytes))
            .context("Failed to parse ONNX model")?
            .with_input_fact(0, f32::fact([1, feature_count]).into())
            .context("Failed to set input shape")?
            .into_optimized()
            .context("Failed to optimize model")?
            .into_runnable()
            .context("Failed to create runnable model")?;
        Ok(model)
    }

    fn run_row(&self, row: Vec<f32>) -> anyhow::Result<Vec<Vec<f64>>> {
        let tensor: Tensor =
            tract_ndarray::Array2::from_shape_vec((1, self.feature_count), row)?.into();
        let result = self.model.run(tvec!(tensor.into()))?;

        result
            .iter()
            .map(|out| {
                let out = out.cast_to::<f64>()?;
                let view = out.to_array_view::<f64>()?;
                Ok(view.iter().copied().collect())
            })
            .collect()
    }

    fn column_names(&self, widths: &[usize]) -> Vec<String> {
        self.output_names
            .iter()
            .zip(widths)
            .flat_map(|(name, w)| {
                if *w == 1 {
                    vec![name.clone()]
                } else {
                    (0..*w).map(|j| format!("{}_{}", name, j)).collect()
                }
            })
            .collect()
    }
}

impl Artifact for OnnxArtifact {
    fn invoke(&self, input: ModelInput) -> Result<PredictionOutput, InvocationError> {
        let features = input.matrix();
        if features.ncols() != self.feature_count {
            return Err(InvocationError::msg(format!(
                "model expects {} features, got {}",
                self.feature_count,
                features.ncols()
            )));
        }

        let n_outputs = self.output_names.len();
        let mut widths = self.output_widths.clone();
        let mut per_output: Vec<Vec<f64>> = vec![Vec::new(); n_outputs];

        for (r, row) in features.outer_iter().enumerate() {
            let start = Instant::now();
            let values = self
                .run_row(row.iter().map(|v| *v as f32).collect())
                .map_err(InvocationError)?;

            for (i, out) in values.into_iter().enumerate().take(n_outputs) {
                match widths[i] {
                    Some(w) if w != out.len() => {
                        return Err(InvocationError::msg(format!(
                            "output '{}' produced {} values for row {}, expected {}",
                            self.output_names[i],
                            out.len(),
                            r,
                            w
                        )));
                    }
                    Some(_) => {}
                    None => widths[i] = Some(out.len()),
                }
                per_output[i].extend(out);
            }

            let elapsed = start.elapsed();
            if elapsed.as_millis() > MAX_ROW_INFERENCE_MS {
                warn!(
                    elapsed_ms = elapsed.as_millis(),
                    "Inference exceeded {}ms target", MAX_ROW_INFERENCE_MS
                );
            }
        }

        let nrows = features.nrows();
        let widths: Vec<usize> = widths.into_iter().map(|w| w.unwrap_or(0)).collect();
        let total: usize = widths.iter().sum();

        let mut data = Vec::with_capacity(nrows * total);
        for r in 0..nrows {
            for (i, w) in widths.iter().enumerate() {
                data.extend_from_slice(&per_output[i][r * w..(r + 1) * w]);
            }
        }
        let matrix = Matrix::from_shape_vec((nrows, total), data).map_err(InvocationError::new)?;
        debug!(rows = nrows, columns = total, "Inference completed");

        if n_outputs == 1 {
            return Ok(PredictionOutput::Matrix(matrix));
        }
        let table = Table::new(self.column_names(&widths), matrix).map_err(InvocationError::msg)?;
        Ok(PredictionOutput::Table(table))
    }

    fn describe(&self) -> String {
        format!("onnx:{}", self.path.display())
    }
}

/// Compare against `<model><CHECKSUM_SUFFIX>` when that file exists
fn verify_checksum(model_path: &Path, bytes: &[u8]) -> Result<(), LoadError> {
    let mut sidecar = model_path.as_os_str().to_owned();
    sidecar.push(CHECKSUM_SUFFIX);
    let sidecar = PathBuf::from(sidecar);

    let expected = match std::fs::read_to_string(&sidecar) {
        Ok(content) => content
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(LoadError::artifact(
                model_path,
                format!("cannot read checksum file: {}", e),
            ))
        }
    };

    let computed = compute_checksum(bytes);
    if computed != expected {
        return Err(LoadError::artifact(
            model_path,
            format!("checksum mismatch: expected {}, got {}", expected, computed),
        ));
    }
    debug!(checksum = %computed, "Model checksum validated");
    Ok(())
}

/// Hex-encoded SHA-256 of `data`
pub(crate) fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
