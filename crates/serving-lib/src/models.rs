//! Core data models for the serving adapter

use crate::error::MatrixError;
use serde::{Deserialize, Serialize};
use tract_onnx::prelude::tract_ndarray::{Array2, ArrayView2};

/// Dense row-major numeric matrix used for requests, features and predictions
pub type Matrix = Array2<f64>;

/// Free-form request metadata forwarded by the transport
pub type RequestMeta = serde_json::Map<String, serde_json::Value>;

/// Contents of the metadata sidecar
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// How enriched features are handed to the artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    /// Pass the bare matrix
    #[default]
    #[serde(alias = "ndarray")]
    Array,
    /// Wrap the matrix in a labelled table
    #[serde(alias = "dataframe")]
    Named,
}

impl InputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputMode::Array => "array",
            InputMode::Named => "named",
        }
    }
}

/// A matrix with one label per column
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    data: Matrix,
}

impl Table {
    /// Build a table, failing when the label count does not match the width
    pub fn new(columns: Vec<String>, data: Matrix) -> Result<Self, MatrixError> {
        if columns.len() != data.ncols() {
            return Err(MatrixError::LabelCount {
                labels: columns.len(),
                columns: data.ncols(),
            });
        }
        Ok(Self { columns, data })
    }

    /// Build a table labelled "0".."n-1"
    pub fn positional(data: Matrix) -> Self {
        let columns = (0..data.ncols()).map(|i| i.to_string()).collect();
        Self { columns, data }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn into_parts(self) -> (Vec<String>, Matrix) {
        (self.columns, self.data)
    }
}

/// Input handed to an artifact
#[derive(Debug, Clone, PartialEq)]
pub enum ModelInput {
    Array(Matrix),
    Frame(Table),
}

impl ModelInput {
    pub fn nrows(&self) -> usize {
        match self {
            ModelInput::Array(m) => m.nrows(),
            ModelInput::Frame(t) => t.data.nrows(),
        }
    }

    /// Borrow the numeric payload regardless of representation
    pub fn matrix(&self) -> ArrayView2<'_, f64> {
        match self {
            ModelInput::Array(m) => m.view(),
            ModelInput::Frame(t) => t.data.view(),
        }
    }
}

/// Raw artifact response; the shape depends on the artifact
#[derive(Debug, Clone, PartialEq)]
pub enum PredictionOutput {
    Matrix(Matrix),
    Table(Table),
}

/// Build a matrix from nested rows, rejecting ragged input
pub fn matrix_from_rows(rows: &[Vec<f64>]) -> Result<Matrix, MatrixError> {
    let ncols = rows.first().map(Vec::len).unwrap_or(0);
    if let Some((row, values)) = rows.iter().enumerate().find(|(_, r)| r.len() != ncols) {
        return Err(MatrixError::Ragged {
            row,
            len: values.len(),
            expected: ncols,
        });
    }
    let data: Vec<f64> = rows.iter().flatten().copied().collect();
    Ok(Array2::from_shape_vec((rows.len(), ncols), data)?)
}

/// Convert a matrix back to nested rows for serialization
pub fn matrix_to_rows(matrix: &Matrix) -> Vec<Vec<f64>> {
    matrix.outer_iter().map(|row| row.to_vec()).collect()
}
