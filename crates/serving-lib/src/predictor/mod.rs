//! Request-time prediction pipeline: enrichment then dispatch

mod dispatch;
mod features;

pub use dispatch::PredictionDispatcher;
pub use features::{
    EnrichedBatch, EnrichmentStats, FeatureEnricher, KEY_COLUMNS, MISSING_ATTRIBUTE_VALUE,
};
