//! Process-wide counters, in the style of `CacheMetrics`: a handful of
//! `AtomicU64`s behind a shared handle, with a render method rather than a
//! push-based reporter. [`Metrics::render`] emits Prometheus's plain-text
//! exposition format directly rather than pulling in a client library, since
//! the set of series here is small and fixed.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::breaker::BreakerState;

/// The cache tier a hit or miss was recorded against.
#[derive(Debug, Clone, Copy)]
pub enum CacheLayer {
    /// The in-process bounded cache.
    L1,
    /// The shared Redis cache.
    L2,
}

impl CacheLayer {
    fn label(self) -> &'static str {
        match self {
            CacheLayer::L1 => "L1",
            CacheLayer::L2 => "L2",
        }
    }
}

#[derive(Debug, Default)]
struct LabeledCounters {
    l1: AtomicU64,
    l2: AtomicU64,
}

impl LabeledCounters {
    fn record(&self, layer: CacheLayer) {
        match layer {
            CacheLayer::L1 => self.l1.fetch_add(1, Ordering::Relaxed),
            CacheLayer::L2 => self.l2.fetch_add(1, Ordering::Relaxed),
        };
    }
}

/// Process-wide counters for the proxy, exported through `/metrics`.
#[derive(Debug, Default)]
pub struct Metrics {
    cache_hits: LabeledCounters,
    cache_misses: LabeledCounters,
    requests_total: AtomicU64,
    circuit_breaker_state: AtomicI64,
    redis_errors: Mutex<std::collections::HashMap<String, u64>>,
    origin_errors: Mutex<std::collections::HashMap<String, u64>>,
    latency_buckets: [AtomicU64; LATENCY_BUCKETS.len()],
    latency_sum_millis: AtomicU64,
    latency_count: AtomicU64,
}

/// Histogram bucket boundaries, in seconds, matching the distilled system's
/// finer-grained latency buckets.
const LATENCY_BUCKETS: [f64; 11] = [
    0.001, 0.002, 0.005, 0.01, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0, 2.0,
];

impl Metrics {
    /// Creates a zeroed metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a cache hit on the given layer.
    pub fn record_cache_hit(&self, layer: CacheLayer) {
        self.cache_hits.record(layer);
    }

    /// Records a cache miss on the given layer.
    pub fn record_cache_miss(&self, layer: CacheLayer) {
        self.cache_misses.record(layer);
    }

    /// Records one processed request.
    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the latency, in seconds, of one processed request.
    pub fn observe_request_latency(&self, seconds: f64) {
        for (i, bound) in LATENCY_BUCKETS.iter().enumerate() {
            if seconds <= *bound {
                self.latency_buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.latency_sum_millis
            .fetch_add((seconds * 1000.0) as u64, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Sets the circuit breaker state gauge.
    pub fn set_circuit_breaker_state(&self, state: BreakerState) {
        self.circuit_breaker_state
            .store(state.as_gauge_value(), Ordering::Relaxed);
    }

    /// Records a Redis-layer error of the given kind.
    pub fn record_redis_error(&self, error_type: &str) {
        let mut map = self.redis_errors.lock().unwrap();
        *map.entry(error_type.to_string()).or_insert(0) += 1;
    }

    /// Records an origin-fetch error of the given kind.
    pub fn record_origin_error(&self, error_type: &str) {
        let mut map = self.origin_errors.lock().unwrap();
        *map.entry(error_type.to_string()).or_insert(0) += 1;
    }

    /// Renders all metrics in Prometheus's plain-text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP cachewarp_cache_hits_total Total number of cache hits\n");
        out.push_str("# TYPE cachewarp_cache_hits_total counter\n");
        out.push_str(&format!(
            "cachewarp_cache_hits_total{{cache_layer=\"L1\"}} {}\n",
            self.cache_hits.l1.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "cachewarp_cache_hits_total{{cache_layer=\"L2\"}} {}\n",
            self.cache_hits.l2.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP cachewarp_cache_misses_total Total number of cache misses\n");
        out.push_str("# TYPE cachewarp_cache_misses_total counter\n");
        out.push_str(&format!(
            "cachewarp_cache_misses_total{{cache_layer=\"L1\"}} {}\n",
            self.cache_misses.l1.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "cachewarp_cache_misses_total{{cache_layer=\"L2\"}} {}\n",
            self.cache_misses.l2.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP cachewarp_requests_total Total number of requests processed\n");
        out.push_str("# TYPE cachewarp_requests_total counter\n");
        out.push_str(&format!(
            "cachewarp_requests_total {}\n",
            self.requests_total.load(Ordering::Relaxed)
        ));

        out.push_str(
            "# HELP cachewarp_circuit_breaker_state Current state of the circuit breaker (0=CLOSED, 1=OPEN, 2=HALF_OPEN)\n",
        );
        out.push_str("# TYPE cachewarp_circuit_breaker_state gauge\n");
        out.push_str(&format!(
            "cachewarp_circuit_breaker_state {}\n",
            self.circuit_breaker_state.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP cachewarp_redis_errors_total Total number of Redis errors\n");
        out.push_str("# TYPE cachewarp_redis_errors_total counter\n");
        for (kind, count) in self.redis_errors.lock().unwrap().iter() {
            out.push_str(&format!(
                "cachewarp_redis_errors_total{{error_type=\"{kind}\"}} {count}\n"
            ));
        }

        out.push_str("# HELP cachewarp_origin_errors_total Total number of origin fetch errors\n");
        out.push_str("# TYPE cachewarp_origin_errors_total counter\n");
        for (kind, count) in self.origin_errors.lock().unwrap().iter() {
            out.push_str(&format!(
                "cachewarp_origin_errors_total{{error_type=\"{kind}\"}} {count}\n"
            ));
        }

        out.push_str("# HELP cachewarp_request_latency_seconds Request latency in seconds\n");
        out.push_str("# TYPE cachewarp_request_latency_seconds histogram\n");
        let mut cumulative = 0u64;
        for (bound, bucket) in LATENCY_BUCKETS.iter().zip(self.latency_buckets.iter()) {
            cumulative += bucket.load(Ordering::Relaxed);
            out.push_str(&format!(
                "cachewarp_request_latency_seconds_bucket{{le=\"{bound}\"}} {cumulative}\n"
            ));
        }
        let count = self.latency_count.load(Ordering::Relaxed);
        out.push_str(&format!(
            "cachewarp_request_latency_seconds_bucket{{le=\"+Inf\"}} {count}\n"
        ));
        out.push_str(&format!(
            "cachewarp_request_latency_seconds_sum {}\n",
            self.latency_sum_millis.load(Ordering::Relaxed) as f64 / 1000.0
        ));
        out.push_str(&format!("cachewarp_request_latency_seconds_count {count}\n"));

        out
    }
}
