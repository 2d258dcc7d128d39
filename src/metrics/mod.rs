//! Metrics Module
//!
//! Prometheus-compatible metrics for the exchange core:
//! - Matching engine (orders, trades, match latency)
//! - Settlement (runs, payout volume)
//! - Books (active markets)

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Metric names as constants for consistency
pub mod names {
    pub const ORDERS_SUBMITTED_TOTAL: &str = "orders_submitted_total";
    pub const ORDERS_CANCELLED_TOTAL: &str = "orders_cancelled_total";
    pub const ORDER_MATCH_DURATION_SECONDS: &str = "order_match_duration_seconds";
    pub const TRADES_EXECUTED_TOTAL: &str = "trades_executed_total";
    pub const SETTLEMENTS_TOTAL: &str = "settlements_total";
    pub const ACTIVE_MARKETS: &str = "active_markets";
}

/// Initialize Prometheus metrics exporter
///
/// Returns a handle that can be used to render metrics
pub fn init_metrics() -> PrometheusHandle {
    let builder = PrometheusBuilder::new()
        // Order matching duration buckets (in seconds) - should be fast
        .set_buckets_for_metric(
            Matcher::Full(names::ORDER_MATCH_DURATION_SECONDS.to_string()),
            &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5],
        )
        .expect("bucket configuration is non-empty");

    builder
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Refresh coarse gauges that are cheaper to sample than to stream.
pub fn record_active_markets(count: usize) {
    metrics::gauge!(names::ACTIVE_MARKETS).set(count as f64);
}
