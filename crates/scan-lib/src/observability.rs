//! Observability for scans
//!
//! Provides:
//! - Prometheus metrics (query latency, retries, errors, in-flight queries, severities)
//! - Structured logging of scan lifecycle events with tracing

use crate::models::{ItemError, Recommendation, ScanReport, Severity};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Histogram buckets for metrics query latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ScanMetricsInner> = OnceLock::new();

struct ScanMetricsInner {
    query_latency_seconds: Histogram,
    query_errors: IntCounter,
    query_retries: IntCounter,
    queries_in_flight: IntGauge,
    recommendations: IntCounterVec,
    failed_items: IntCounter,
    failed_clusters: IntCounter,
}

impl ScanMetricsInner {
    fn new() -> Self {
        Self {
            query_latency_seconds: register_histogram!(
                "rightsizer_query_latency_seconds",
                "Time spent on a single metrics backend request",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register query_latency_seconds"),

            query_errors: register_int_counter!(
                "rightsizer_query_errors_total",
                "Metrics backend requests that failed"
            )
            .expect("Failed to register query_errors"),

            query_retries: register_int_counter!(
                "rightsizer_query_retries_total",
                "Metrics backend requests retried after a transient failure"
            )
            .expect("Failed to register query_retries"),

            queries_in_flight: register_int_gauge!(
                "rightsizer_queries_in_flight",
                "Metrics queries currently holding a concurrency permit"
            )
            .expect("Failed to register queries_in_flight"),

            recommendations: register_int_counter_vec!(
                "rightsizer_recommendations_total",
                "Recommendations produced, by severity",
                &["severity"]
            )
            .expect("Failed to register recommendations"),

            failed_items: register_int_counter!(
                "rightsizer_failed_items_total",
                "Container/resource items that failed during a scan"
            )
            .expect("Failed to register failed_items"),

            failed_clusters: register_int_counter!(
                "rightsizer_failed_clusters_total",
                "Clusters whose discovery failed"
            )
            .expect("Failed to register failed_clusters"),
        }
    }
}

/// Lightweight handle to the global scan metrics
///
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct ScanMetrics {
    _private: (),
}

impl Default for ScanMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ScanMetricsInner::new);
        Self { _private: () }
    }

    /// Render every registered metric in the Prometheus text format
    pub fn export_text(&self) -> Result<String, prometheus::Error> {
        self.inner();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| prometheus::Error::Msg(format!("metrics are not UTF-8: {e}")))
    }

    fn inner(&self) -> &ScanMetricsInner {
        GLOBAL_METRICS.get_or_init(ScanMetricsInner::new)
    }

    pub fn observe_query_latency(&self, duration_secs: f64) {
        self.inner().query_latency_seconds.observe(duration_secs);
    }

    pub fn inc_query_errors(&self) {
        self.inner().query_errors.inc();
    }

    pub fn inc_query_retries(&self) {
        self.inner().query_retries.inc();
    }

    pub fn query_started(&self) {
        self.inner().queries_in_flight.inc();
    }

    pub fn query_finished(&self) {
        self.inner().queries_in_flight.dec();
    }

    pub fn record_recommendation(&self, severity: Severity) {
        self.inner()
            .recommendations
            .with_label_values(&[severity.as_str()])
            .inc();
    }

    pub fn inc_failed_items(&self) {
        self.inner().failed_items.inc();
    }

    pub fn inc_failed_clusters(&self) {
        self.inner().failed_clusters.inc();
    }
}

/// Structured logger for scan events
///
/// Keeps field names consistent so JSON logs can be filtered by `event`.
#[derive(Clone)]
pub struct StructuredLogger {
    scan_id: String,
}

impl StructuredLogger {
    pub fn new(scan_id: impl Into<String>) -> Self {
        Self {
            scan_id: scan_id.into(),
        }
    }

    pub fn scan_id(&self) -> &str {
        &self.scan_id
    }

    pub fn log_scan_started(&self, clusters: usize, strategy: &str, window_secs: u64) {
        info!(
            event = "scan_started",
            scan_id = %self.scan_id,
            clusters = clusters,
            strategy = %strategy,
            window_secs = window_secs,
            "Starting right-sizing scan"
        );
    }

    pub fn log_phase(&self, phase: &str) {
        debug!(event = "scan_phase", scan_id = %self.scan_id, phase = %phase, "Scan phase changed");
    }

    pub fn log_cluster_discovered(&self, cluster: &str, workloads: usize, containers: usize) {
        info!(
            event = "cluster_discovered",
            scan_id = %self.scan_id,
            cluster = %cluster,
            workloads = workloads,
            containers = containers,
            "Discovered workloads"
        );
    }

    pub fn log_cluster_failed(&self, cluster: &str, error: &str) {
        warn!(
            event = "cluster_failed",
            scan_id = %self.scan_id,
            cluster = %cluster,
            error = %error,
            "Discovery failed, cluster excluded from scan"
        );
    }

    pub fn log_recommendation(&self, rec: &Recommendation) {
        debug!(
            event = "recommendation",
            scan_id = %self.scan_id,
            container = %rec.container,
            resource = %rec.resource,
            request = ?rec.request,
            limit = ?rec.limit,
            severity = %rec.severity,
            samples = rec.sample_count,
            oom_kills = rec.oom_kills,
            "Computed recommendation"
        );
    }

    pub fn log_item_failed(&self, error: &ItemError) {
        warn!(
            event = "item_failed",
            scan_id = %self.scan_id,
            cluster = %error.scope.cluster(),
            kind = ?error.kind,
            error = %error.message,
            "Scan item failed"
        );
    }

    pub fn log_scan_finished(&self, report: &ScanReport) {
        let elapsed_ms = (report.metadata.finished_at - report.metadata.started_at)
            .num_milliseconds()
            .max(0);
        info!(
            event = "scan_finished",
            scan_id = %self.scan_id,
            status = ?report.status(),
            recommendations = report.recommendations.len(),
            errors = report.summary.total_errors,
            failed_clusters = report.summary.failed_clusters,
            elapsed_ms = elapsed_ms,
            "Scan finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_metrics_creation() {
        // Metrics live in the global registry, so they are created once per process
        let metrics = ScanMetrics::new();
        let again = ScanMetrics::new();

        metrics.observe_query_latency(0.05);
        metrics.inc_query_errors();
        again.inc_query_retries();
        metrics.query_started();
        metrics.query_finished();
        metrics.record_recommendation(Severity::Warning);
        metrics.inc_failed_items();
        metrics.inc_failed_clusters();
    }

    #[test]
    fn test_export_text() {
        let metrics = ScanMetrics::new();
        metrics.inc_failed_clusters();

        let text = metrics.export_text().unwrap();
        assert!(text.contains("# TYPE rightsizer_failed_clusters_total counter"));
        assert!(text.contains("rightsizer_query_latency_seconds_bucket"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("scan-1");
        assert_eq!(logger.scan_id(), "scan-1");
    }
}
