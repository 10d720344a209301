//! Prometheus metrics exposition
//!
//! The dispatch engine emits:
//!
//! - `gateway_requests_total` (counter): labels `operation`, `status`
//! - `gateway_request_duration_seconds` (histogram): label `operation`
//! - `gateway_upstream_errors_total` (counter): label `kind`

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Configures `gateway_request_duration_seconds` with explicit buckets so it
/// renders as a Prometheus histogram (with `_bucket` lines usable from
/// `histogram_quantile()`) rather than the default summary. The range covers
/// fast cache-adjacent searches up to long crawls near the upstream timeout.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(
                "gateway_request_duration_seconds".to_string(),
            ),
            &[
                0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
            ],
        )
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}
