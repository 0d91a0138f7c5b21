//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to retrieve metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

pub fn record_cache_hit() {
    metrics::counter!("unet_loader_cache_hits_total").increment(1);
}

pub fn record_cache_miss() {
    metrics::counter!("unet_loader_cache_misses_total").increment(1);
}

pub fn record_cache_eviction() {
    metrics::counter!("unet_loader_cache_evictions_total").increment(1);
}

/// Update cached model count gauge
pub fn update_cache_entries(count: usize) {
    metrics::gauge!("unet_loader_cache_entries").set(count as f64);
}

/// Record a merged artifact written to storage
pub fn record_merge(combined_name: &str) {
    metrics::counter!("unet_loader_merges_total",
        "artifact" => combined_name.to_string()
    )
    .increment(1);
}

/// Record a failed combine run by failure class
pub fn record_combine_failure(kind: &'static str) {
    metrics::counter!("unet_loader_combine_failures_total",
        "kind" => kind
    )
    .increment(1);
}

pub fn record_cleanup(removed: bool) {
    metrics::counter!("unet_loader_cleanups_total",
        "removed" => removed.to_string()
    )
    .increment(1);
}
