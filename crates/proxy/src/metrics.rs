//! Metrics collection for the proxy's probe points
//!
//! Counters and a latency histogram observed from the request pipeline and
//! the upstream pool. Everything here is in-memory and lock-light: totals
//! are atomics, the per-method and per-upstream maps take a short write
//! lock per observation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

/// Upper bounds (milliseconds) of the upstream latency histogram buckets.
/// The last bucket is unbounded.
const LATENCY_BUCKETS_MS: [u64; 12] =
    [5, 10, 20, 40, 60, 100, 200, 400, 600, 1000, 2000, 4000];

/// Per-method cache and error counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MethodStats {
    /// Cache hits for this method.
    pub hits: u64,
    /// Cache misses for this method (including methods with no cache policy).
    pub misses: u64,
    /// Error responses returned for this method.
    pub errors: u64,
}

/// Per-upstream usage counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpstreamUsage {
    /// Requests dispatched to this upstream.
    pub request_count: u64,
    /// Requests that failed at the transport layer.
    pub error_count: u64,
    /// Accumulated response time in milliseconds.
    pub total_response_time_ms: u64,
}

impl UpstreamUsage {
    /// Average response time over all dispatches.
    pub fn avg_response_time_ms(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.total_response_time_ms as f64 / self.request_count as f64
        }
    }
}

/// Thread-safe metrics collector shared by the pipeline and the pool.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    /// Total RPC-bearing HTTP requests handled.
    pub total_requests: AtomicU64,
    /// Total cache hits across methods.
    pub cache_hits: AtomicU64,
    /// Total cache misses across methods.
    pub cache_misses: AtomicU64,
    /// Total error responses emitted.
    pub total_errors: AtomicU64,

    method_stats: RwLock<HashMap<String, MethodStats>>,
    upstream_usage: RwLock<HashMap<String, UpstreamUsage>>,
    latency_buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
}

impl MetricsCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an incoming RPC-bearing HTTP request.
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a cache hit for `method`.
    pub fn record_cache_hit(&self, method: &str) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.method_stats.write().entry(method.to_string()).or_default().hits += 1;
    }

    /// Records a cache miss for `method`.
    pub fn record_cache_miss(&self, method: &str) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.method_stats.write().entry(method.to_string()).or_default().misses += 1;
    }

    /// Records a protocol-level error response with no method attribution
    /// (parse errors, invalid envelopes).
    pub fn record_protocol_error(&self) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an error response emitted for `method`.
    pub fn record_rpc_error(&self, method: &str) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        self.method_stats.write().entry(method.to_string()).or_default().errors += 1;
    }

    /// Records one upstream dispatch with its latency and outcome.
    pub fn record_upstream_request(&self, url: &str, response_time_ms: u64, success: bool) {
        let mut usage = self.upstream_usage.write();
        let entry = usage.entry(url.to_string()).or_default();
        entry.request_count += 1;
        entry.total_response_time_ms += response_time_ms;
        if !success {
            entry.error_count += 1;
        }
        drop(usage);

        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| response_time_ms <= bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.latency_buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Cache hit rate in percent.
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        if hits + misses == 0 {
            0.0
        } else {
            (hits as f64 / (hits + misses) as f64) * 100.0
        }
    }

    /// Snapshot of the per-method counters.
    pub fn method_stats(&self) -> HashMap<String, MethodStats> {
        self.method_stats.read().clone()
    }

    /// Snapshot of the per-upstream counters.
    pub fn upstream_usage(&self) -> HashMap<String, UpstreamUsage> {
        self.upstream_usage.read().clone()
    }

    /// Cumulative histogram counts paired with their bucket bounds; the
    /// final entry is the overflow bucket.
    pub fn latency_histogram(&self) -> Vec<(Option<u64>, u64)> {
        LATENCY_BUCKETS_MS
            .iter()
            .map(|&b| Some(b))
            .chain(std::iter::once(None))
            .zip(self.latency_buckets.iter().map(|c| c.load(Ordering::Relaxed)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_counters() {
        let metrics = MetricsCollector::new();
        metrics.record_cache_hit("getBlock");
        metrics.record_cache_hit("getBlock");
        metrics.record_cache_miss("getBlock");
        metrics.record_cache_miss("getTx");

        assert_eq!(metrics.cache_hits.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.cache_misses.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.cache_hit_rate(), 50.0);

        let stats = metrics.method_stats();
        assert_eq!(stats["getBlock"].hits, 2);
        assert_eq!(stats["getBlock"].misses, 1);
        assert_eq!(stats["getTx"].misses, 1);
    }

    #[test]
    fn test_upstream_usage_and_histogram() {
        let metrics = MetricsCollector::new();
        metrics.record_upstream_request("http://u1", 15, true);
        metrics.record_upstream_request("http://u1", 25, false);
        metrics.record_upstream_request("http://u2", 9000, true);

        let usage = metrics.upstream_usage();
        assert_eq!(usage["http://u1"].request_count, 2);
        assert_eq!(usage["http://u1"].error_count, 1);
        assert_eq!(usage["http://u1"].avg_response_time_ms(), 20.0);

        let histogram = metrics.latency_histogram();
        // 15ms and 25ms land in the 20/40 buckets, 9000ms overflows
        assert_eq!(histogram.iter().map(|(_, c)| c).sum::<u64>(), 3);
        assert_eq!(histogram.last().unwrap().1, 1);
    }

    #[test]
    fn test_error_counter() {
        let metrics = MetricsCollector::new();
        metrics.record_rpc_error("m");
        assert_eq!(metrics.total_errors.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.method_stats()["m"].errors, 1);
    }

    #[test]
    fn test_empty_rates() {
        let metrics = MetricsCollector::new();
        assert_eq!(metrics.cache_hit_rate(), 0.0);
        assert_eq!(UpstreamUsage::default().avg_response_time_ms(), 0.0);
    }
}
