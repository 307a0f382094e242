//! Prometheus metrics for the CSI driver
//!
//! Provides metrics for monitoring CSI operations, array sessions and the
//! deletion reclamation queue.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Total number of CSI operations by type and status
    pub const CSI_OPERATIONS_TOTAL: &str = "csi_operations_total";
    /// Histogram: Duration of CSI operations in seconds
    pub const CSI_OPERATION_DURATION_SECONDS: &str = "csi_operation_duration_seconds";
    /// Gauge: Number of arrays with an established session
    pub const CSI_ARRAYS_LOGGED_IN: &str = "csi_arrays_logged_in";
    /// Counter: Number of operations rejected by the concurrency limit
    pub const CSI_RATE_LIMITED_TOTAL: &str = "csi_rate_limited_total";
    /// Gauge: Current concurrent operations in progress
    pub const CSI_CONCURRENT_OPS: &str = "csi_concurrent_ops";
    /// Gauge: Deletion requests waiting or in progress
    pub const CSI_DELETION_QUEUE_DEPTH: &str = "csi_deletion_queue_depth";
    /// Counter: Finished deletion requests by outcome (completed/failed)
    pub const CSI_DELETION_OUTCOMES_TOTAL: &str = "csi_deletion_outcomes_total";
    /// Counter: Number of deletion retries
    pub const CSI_DELETION_RETRIES_TOTAL: &str = "csi_deletion_retries_total";
}

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP server on the specified address that serves metrics
/// at the `/metrics` endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Record a CSI operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::CSI_OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::CSI_OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Set the number of arrays with a session
pub fn set_arrays_logged_in(count: usize) {
    gauge!(names::CSI_ARRAYS_LOGGED_IN).set(count as f64);
}

/// Record a rate-limited operation
pub fn record_rate_limited(operation: &str) {
    counter!(names::CSI_RATE_LIMITED_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Set the current number of concurrent operations
pub fn set_concurrent_ops(count: usize) {
    gauge!(names::CSI_CONCURRENT_OPS).set(count as f64);
}

/// Set the number of tracked deletion requests
pub fn set_deletion_queue_depth(depth: usize) {
    gauge!(names::CSI_DELETION_QUEUE_DEPTH).set(depth as f64);
}

/// Record a deletion request reaching a terminal state
pub fn record_deletion_outcome(outcome: &str) {
    counter!(names::CSI_DELETION_OUTCOMES_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

/// Record a deletion retry
pub fn record_deletion_retry() {
    counter!(names::CSI_DELETION_RETRIES_TOTAL).increment(1);
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    /// Complete the operation with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.operation, "success", duration);
    }

    /// Complete the operation with failure
    pub fn failure(self, error_code: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.operation, error_code, duration);
    }
}
