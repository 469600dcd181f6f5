//! Prometheus metrics registry for TaskSync
//!
//! Provides typed, labeled counters, gauges, and histograms for sync
//! transactions, conflict handling and batch transfer runs.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Central metrics registry holding all Prometheus metrics.
pub struct MetricsRegistry {
    registry: Registry,
    /// Counter: processed operations by (type, status)
    pub operations_total: IntCounterVec,
    /// Counter: conflicts by resolution policy
    pub conflicts_total: IntCounterVec,
    /// Counter: sync requests by outcome (ok, rejected, failed)
    pub sync_requests_total: IntCounterVec,
    /// Histogram: sync transaction duration in seconds
    pub sync_duration_seconds: Histogram,
    /// Counter: batch items by result (ok, failed)
    pub batch_items_total: IntCounterVec,
    /// Counter: finished batch runs by terminal state
    pub batch_runs_total: IntCounterVec,
    /// Gauge: in-flight sessions by kind (sync, batch)
    pub active_sessions: IntGaugeVec,
}

impl MetricsRegistry {
    /// Creates a new `MetricsRegistry` with all metrics registered.
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new_custom(Some("tasksync".to_string()), None)?;

        let operations_total = IntCounterVec::new(
            Opts::new("operations_total", "Total processed operations"),
            &["type", "status"],
        )?;
        registry.register(Box::new(operations_total.clone()))?;

        let conflicts_total = IntCounterVec::new(
            Opts::new("conflicts_total", "Total conflicts by resolution"),
            &["resolution"],
        )?;
        registry.register(Box::new(conflicts_total.clone()))?;

        let sync_requests_total = IntCounterVec::new(
            Opts::new("sync_requests_total", "Total sync requests by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(sync_requests_total.clone()))?;

        let sync_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "sync_duration_seconds",
                "Sync transaction duration in seconds",
            )
            .buckets(vec![0.005, 0.025, 0.1, 0.5, 2.0, 10.0]),
        )?;
        registry.register(Box::new(sync_duration_seconds.clone()))?;

        let batch_items_total = IntCounterVec::new(
            Opts::new("batch_items_total", "Total batch items processed"),
            &["result"],
        )?;
        registry.register(Box::new(batch_items_total.clone()))?;

        let batch_runs_total = IntCounterVec::new(
            Opts::new("batch_runs_total", "Total finished batch runs"),
            &["state"],
        )?;
        registry.register(Box::new(batch_runs_total.clone()))?;

        let active_sessions = IntGaugeVec::new(
            Opts::new("active_sessions", "In-flight sessions by kind"),
            &["kind"],
        )?;
        registry.register(Box::new(active_sessions.clone()))?;

        Ok(Self {
            registry,
            operations_total,
            conflicts_total,
            sync_requests_total,
            sync_duration_seconds,
            batch_items_total,
            batch_runs_total,
            active_sessions,
        })
    }

    // ========================================================================
    // Recording helpers
    // ========================================================================

    /// Record a processed operation.
    pub fn record_operation(&self, operation_type: &str, status: &str) {
        self.operations_total
            .with_label_values(&[operation_type, status])
            .inc();
    }

    /// Record a conflict with its resolution.
    pub fn record_conflict(&self, resolution: &str) {
        self.conflicts_total.with_label_values(&[resolution]).inc();
    }

    /// Record the outcome of a sync request.
    pub fn record_sync_request(&self, outcome: &str) {
        self.sync_requests_total.with_label_values(&[outcome]).inc();
    }

    /// Observe a sync transaction duration.
    pub fn observe_sync_duration(&self, duration_secs: f64) {
        self.sync_duration_seconds.observe(duration_secs);
    }

    /// Record batch item results.
    pub fn record_batch_items(&self, succeeded: u64, failed: u64) {
        self.batch_items_total
            .with_label_values(&["ok"])
            .inc_by(succeeded);
        self.batch_items_total
            .with_label_values(&["failed"])
            .inc_by(failed);
    }

    /// Record a finished batch run.
    pub fn record_batch_run(&self, state: &str) {
        self.batch_runs_total.with_label_values(&[state]).inc();
    }

    /// Track a session entering (`+1`) or leaving (`-1`) the registry.
    pub fn adjust_active_sessions(&self, kind: &str, delta: i64) {
        self.active_sessions.with_label_values(&[kind]).add(delta);
    }

    // ========================================================================
    // Encoding
    // ========================================================================

    /// Encode all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry_creation() {
        let registry = MetricsRegistry::new().expect("create registry");
        let output = registry.encode().expect("encode");
        // The unlabeled histogram is always exported
        assert!(output.contains("tasksync_sync_duration_seconds"));
    }

    #[test]
    fn test_record_operation() {
        let registry = MetricsRegistry::new().unwrap();
        registry.record_operation("UPDATE", "synced");
        registry.record_operation("UPDATE", "synced");
        registry.record_operation("DELETE", "conflicted");

        assert_eq!(
            registry
                .operations_total
                .with_label_values(&["UPDATE", "synced"])
                .get(),
            2
        );
        let output = registry.encode().unwrap();
        assert!(output.contains("tasksync_operations_total"));
        assert!(output.contains("conflicted"));
    }

    #[test]
    fn test_record_conflict_and_sync_request() {
        let registry = MetricsRegistry::new().unwrap();
        registry.record_conflict("auto_lww");
        registry.record_sync_request("rejected");
        registry.observe_sync_duration(0.02);

        let output = registry.encode().unwrap();
        assert!(output.contains("tasksync_conflicts_total"));
        assert!(output.contains("tasksync_sync_requests_total"));
        assert_eq!(registry.sync_duration_seconds.get_sample_count(), 1);
    }

    #[test]
    fn test_batch_metrics() {
        let registry = MetricsRegistry::new().unwrap();
        registry.record_batch_items(8, 2);
        registry.record_batch_run("completed");

        assert_eq!(
            registry.batch_items_total.with_label_values(&["failed"]).get(),
            2
        );
        assert!(registry.encode().unwrap().contains("tasksync_batch_runs_total"));
    }

    #[test]
    fn test_active_sessions_gauge() {
        let registry = MetricsRegistry::new().unwrap();
        registry.adjust_active_sessions("sync", 1);
        registry.adjust_active_sessions("sync", 1);
        registry.adjust_active_sessions("sync", -1);

        assert_eq!(
            registry.active_sessions.with_label_values(&["sync"]).get(),
            1
        );
    }

    #[test]
    fn test_encode_produces_valid_output() {
        let registry = MetricsRegistry::new().unwrap();
        registry.record_operation("CREATE", "synced");

        let output = registry.encode().unwrap();
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }
}
