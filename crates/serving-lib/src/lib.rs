//! Serving library for the store/product demand model
//!
//! This crate provides the core functionality for:
//! - Loading the prediction artifact and the reference table once
//! - Gating predictions on a successful load
//! - Enriching `(store_id, product_id)` requests from the reference table
//! - Dispatching enriched features to the artifact and discovering its output schema
//! - Best-effort sidecar metadata, metrics and structured logging

pub mod adapter;
pub mod artifact;
pub mod error;
pub mod health;
pub mod metadata;
pub mod models;
pub mod observability;
pub mod predictor;
pub mod reference;
pub mod storage;

pub use adapter::{AdapterConfig, ModelAdapter, ModelAdapterBuilder};
pub use error::{InvocationError, LoadError, MatrixError, MetadataError, ServingError, StorageError};
pub use health::{LoadState, ReadinessGate, ReadinessResponse};
pub use models::*;
pub use observability::{ServingMetrics, StructuredLogger};
