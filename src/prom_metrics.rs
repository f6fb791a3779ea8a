//! # Prometheus Metrics — Exposition for Scraping
//!
//! Operational metrics in the Prometheus text exposition format.
//!
//! ## Metrics Exposed
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `mersenne_units_tested_total` | Counter | — | Units finished with a verdict |
//! | `mersenne_primes_found_total` | Counter | — | Units finished with a prime verdict |
//! | `mersenne_units_failed_total` | Counter | — | Units marked `error` |
//! | `mersenne_units_reset_total` | Counter | — | Units rolled back to `queued` by cancellation |
//! | `mersenne_runs_active` | Gauge | — | Block runs currently dispatching or draining |
//! | `mersenne_bus_subscribers` | Gauge | — | Open progress subscriptions |
//! | `mersenne_bus_messages_dropped` | Gauge | — | Deliveries dropped on full subscriber buffers |
//! | `mersenne_http_request_duration_seconds` | Histogram | `method`, `path` | HTTP latency |
//!
//! Counters are bumped by the scheduler as units complete; bus gauges are
//! sampled on each `/metrics` scrape.
//!
//! ## References
//!
//! - [OpenMetrics specification](https://openmetrics.io/)
//! - [Prometheus exposition format](https://prometheus.io/docs/instrumenting/exposition_formats/)

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Label set for per-route HTTP latency.
#[derive(Clone, Debug, Hash, PartialEq, Eq, prometheus_client::encoding::EncodeLabelSet)]
pub struct HttpLabel {
    pub method: String,
    pub path: String,
}

fn http_histogram() -> Histogram {
    // 1 ms .. ~16 s
    Histogram::new(exponential_buckets(0.001, 2.0, 15))
}

/// Thread-safe metrics registry. All fields are atomics, safe to update from
/// async tasks and compute threads alike.
pub struct Metrics {
    pub registry: Registry,
    pub units_tested: Counter,
    pub primes_found: Counter,
    pub units_failed: Counter,
    pub units_reset: Counter,
    pub runs_active: Gauge,
    pub bus_subscribers: Gauge,
    pub bus_messages_dropped: Gauge,
    pub http_request_duration: Family<HttpLabel, Histogram, fn() -> Histogram>,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let units_tested = Counter::default();
        registry.register(
            "mersenne_units_tested",
            "Units finished with a prime or composite verdict",
            units_tested.clone(),
        );

        let primes_found = Counter::default();
        registry.register(
            "mersenne_primes_found",
            "Mersenne primes found",
            primes_found.clone(),
        );

        let units_failed = Counter::default();
        registry.register(
            "mersenne_units_failed",
            "Units marked error by an engine failure",
            units_failed.clone(),
        );

        let units_reset = Counter::default();
        registry.register(
            "mersenne_units_reset",
            "Units returned to queued by cancellation",
            units_reset.clone(),
        );

        let runs_active = Gauge::default();
        registry.register(
            "mersenne_runs_active",
            "Block runs currently active",
            runs_active.clone(),
        );

        let bus_subscribers = Gauge::default();
        registry.register(
            "mersenne_bus_subscribers",
            "Open progress bus subscriptions",
            bus_subscribers.clone(),
        );

        let bus_messages_dropped = Gauge::default();
        registry.register(
            "mersenne_bus_messages_dropped",
            "Progress deliveries dropped on full subscriber buffers",
            bus_messages_dropped.clone(),
        );

        let http_request_duration =
            Family::<HttpLabel, Histogram, fn() -> Histogram>::new_with_constructor(http_histogram);
        registry.register(
            "mersenne_http_request_duration_seconds",
            "HTTP request latency",
            http_request_duration.clone(),
        );

        Self {
            registry,
            units_tested,
            primes_found,
            units_failed,
            units_reset,
            runs_active,
            bus_subscribers,
            bus_messages_dropped,
            http_request_duration,
        }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        if let Err(e) = encode(&mut buf, &self.registry) {
            tracing::warn!(error = %e, "metrics encoding failed");
        }
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
