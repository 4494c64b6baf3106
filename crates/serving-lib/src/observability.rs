//! Observability infrastructure for the model server
//!
//! Provides:
//! - Prometheus metrics (prediction/enrichment latency, join misses, load state)
//! - Structured JSON logging with tracing

use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, GaugeVec, Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{error, info};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ServingMetricsInner> = OnceLock::new();

struct ServingMetricsInner {
    prediction_latency_seconds: Histogram,
    enrichment_latency_seconds: Histogram,
    predictions: IntCounter,
    prediction_errors: IntCounterVec,
    unmatched_keys: IntCounter,
    duplicate_rows_dropped: IntCounter,
    reference_rows: IntGauge,
    load_state: IntGauge,
    model_info: GaugeVec,
}

impl ServingMetricsInner {
    fn new() -> Self {
        Self {
            prediction_latency_seconds: register_histogram!(
                "model_server_prediction_latency_seconds",
                "End-to-end time spent serving a prediction request",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register prediction_latency_seconds"),

            enrichment_latency_seconds: register_histogram!(
                "model_server_enrichment_latency_seconds",
                "Time spent joining requests against the reference table",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register enrichment_latency_seconds"),

            predictions: register_int_counter!(
                "model_server_predictions_total",
                "Total number of successful prediction requests"
            )
            .expect("Failed to register predictions_total"),

            prediction_errors: register_int_counter_vec!(
                "model_server_prediction_errors_total",
                "Total number of failed prediction requests by error kind",
                &["kind"]
            )
            .expect("Failed to register prediction_errors_total"),

            unmatched_keys: register_int_counter!(
                "model_server_unmatched_keys_total",
                "Request rows whose key was not found in the reference table"
            )
            .expect("Failed to register unmatched_keys_total"),

            duplicate_rows_dropped: register_int_counter!(
                "model_server_duplicate_rows_dropped_total",
                "Enriched rows removed as exact duplicates"
            )
            .expect("Failed to register duplicate_rows_dropped_total"),

            reference_rows: register_int_gauge!(
                "model_server_reference_rows",
                "Number of rows in the cached reference table"
            )
            .expect("Failed to register reference_rows"),

            load_state: register_int_gauge!(
                "model_server_load_state",
                "Adapter lifecycle: 0 unloaded, 1 loading, 2 ready, 3 failed"
            )
            .expect("Failed to register load_state"),

            model_info: register_gauge_vec!(
                "model_server_model_info",
                "Information about the currently loaded artifact",
                &["model_uri", "input_mode"]
            )
            .expect("Failed to register model_info"),
        }
    }
}

/// Metrics handle for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct ServingMetrics {
    _private: (),
}

impl Default for ServingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServingMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ServingMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ServingMetricsInner {
        GLOBAL_METRICS.get_or_init(ServingMetricsInner::new)
    }

    pub fn observe_prediction_latency(&self, duration_secs: f64) {
        self.inner().prediction_latency_seconds.observe(duration_secs);
    }

    pub fn observe_enrichment_latency(&self, duration_secs: f64) {
        self.inner().enrichment_latency_seconds.observe(duration_secs);
    }

    pub fn inc_predictions(&self) {
        self.inner().predictions.inc();
    }

    pub fn inc_prediction_errors(&self, kind: &str) {
        self.inner().prediction_errors.with_label_values(&[kind]).inc();
    }

    pub fn add_unmatched_keys(&self, count: u64) {
        self.inner().unmatched_keys.inc_by(count);
    }

    pub fn add_duplicate_rows(&self, count: u64) {
        self.inner().duplicate_rows_dropped.inc_by(count);
    }

    pub fn set_reference_rows(&self, rows: i64) {
        self.inner().reference_rows.set(rows);
    }

    pub fn set_load_state(&self, code: i64) {
        self.inner().load_state.set(code);
    }

    pub fn set_model_info(&self, model_uri: &str, input_mode: &str) {
        self.inner().model_info.reset();
        self.inner()
            .model_info
            .with_label_values(&[model_uri, input_mode])
            .set(1.0);
    }
}

/// Structured logger for lifecycle and request events
#[derive(Clone)]
pub struct StructuredLogger {
    replica: String,
}

impl StructuredLogger {
    pub fn new(replica: impl Into<String>) -> Self {
        Self {
            replica: replica.into(),
        }
    }

    pub fn log_startup(&self, version: &str, model_uri: &str, input_mode: &str) {
        info!(
            event = "server_started",
            replica = %self.replica,
            server_version = %version,
            model_uri = %model_uri,
            input_mode = %input_mode,
            "Model server started"
        );
    }

    pub fn log_model_loaded(
        &self,
        artifact: &str,
        reference_rows: usize,
        feature_count: usize,
        elapsed_ms: u128,
    ) {
        info!(
            event = "model_loaded",
            replica = %self.replica,
            artifact = %artifact,
            reference_rows = reference_rows,
            feature_count = feature_count,
            elapsed_ms = elapsed_ms,
            "Artifact and reference table loaded, accepting predictions"
        );
    }

    pub fn log_model_load_failed(&self, model_uri: &str, reason: &str) {
        error!(
            event = "model_load_failed",
            replica = %self.replica,
            model_uri = %model_uri,
            reason = %reason,
            "Model load failed, replica is unusable"
        );
    }

    pub fn log_prediction(
        &self,
        input_rows: usize,
        output_rows: usize,
        unmatched_rows: usize,
        elapsed_us: u128,
    ) {
        info!(
            event = "prediction_served",
            replica = %self.replica,
            input_rows = input_rows,
            output_rows = output_rows,
            unmatched_rows = unmatched_rows,
            elapsed_us = elapsed_us,
            "Prediction served"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "server_shutdown",
            replica = %self.replica,
            reason = %reason,
            "Model server shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serving_metrics_creation() {
        // Prometheus uses a process-wide registry; the handle registers once.
        let metrics = ServingMetrics::new();
        let again = ServingMetrics::new();

        metrics.observe_prediction_latency(0.002);
        metrics.observe_enrichment_latency(0.0001);
        metrics.inc_predictions();
        again.inc_prediction_errors("not_ready");
        metrics.add_unmatched_keys(3);
        metrics.add_duplicate_rows(1);
        metrics.set_reference_rows(42);
        metrics.set_load_state(2);
        metrics.set_model_info("/mnt/models", "array");
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("replica-0");
        assert_eq!(logger.replica, "replica-0");
    }
}
