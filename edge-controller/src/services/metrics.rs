//! Metrics collection and Prometheus export.
//!
//! Request counters come from the shared middleware; the controller adds
//! authentication, enrollment and revocation counters.

use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Global handle to the Prometheus recorder.
pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the Prometheus recorder. Later calls are no-ops.
pub fn init_metrics() -> Result<(), anyhow::Error> {
    if METRICS_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;
    let _ = METRICS_HANDLE.set(handle);
    Ok(())
}

/// Current metrics in Prometheus text format.
pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string())
}

pub fn record_authentication(method: &'static str, success: bool) {
    let result = if success { "success" } else { "failure" };
    counter!("authentications_total", "method" => method, "result" => result).increment(1);
}

pub fn record_enrollment(method: &'static str) {
    counter!("enrollments_total", "method" => method).increment(1);
}

pub fn record_revocation(kind: &'static str) {
    counter!("revocations_total", "kind" => kind).increment(1);
}
