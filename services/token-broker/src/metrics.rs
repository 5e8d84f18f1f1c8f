//! Prometheus metrics exposition
//!
//! - `broker_oauth_init_total` (counter)
//! - `broker_oauth_consume_total` (counter): label `outcome`
//! - `broker_token_requests_total` (counter): label `outcome`
//! - `broker_token_refresh_total` (counter): label `outcome`
//! - `broker_state_cleanup_rows_total` (counter)
//! - `broker_upstream_duration_seconds` (histogram): label `op`

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics
/// on the `/metrics` endpoint.
///
/// `broker_upstream_duration_seconds` gets explicit buckets so it renders as
/// a histogram rather than the default summary. The range covers the
/// marketplace client's 20-25s request timeouts.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(
                "broker_upstream_duration_seconds".to_string(),
            ),
            &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
        )
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record one marketplace call (exchange, refresh, identity).
pub fn record_upstream(op: &'static str, duration_secs: f64) {
    metrics::histogram!("broker_upstream_duration_seconds", "op" => op).record(duration_secs);
}

pub fn record_init() {
    metrics::counter!("broker_oauth_init_total").increment(1);
}

pub fn record_consume(outcome: &'static str) {
    metrics::counter!("broker_oauth_consume_total", "outcome" => outcome).increment(1);
}

pub fn record_token_request(outcome: &'static str) {
    metrics::counter!("broker_token_requests_total", "outcome" => outcome).increment(1);
}

pub fn record_refresh(outcome: &'static str) {
    metrics::counter!("broker_token_refresh_total", "outcome" => outcome).increment(1);
}

pub fn record_cleanup(rows: u64) {
    metrics::counter!("broker_state_cleanup_rows_total").increment(rows);
}

/// Handle over an isolated (non-global) recorder. The global recorder can
/// only be installed once per process, which breaks parallel tests.
#[cfg(test)]
pub fn test_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}
