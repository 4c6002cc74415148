//! In-process metrics and request correlation.
//!
//! Counters are plain atomics so the hot path never takes a lock except for
//! the per-tool table. Exporting them is left to whoever embeds the gateway;
//! [`ServerMetrics::snapshot`] gives a serializable view.

use crate::constants::LATENCY_BUCKETS_MS;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Generate a short correlation ID (8 characters) for compact logging.
pub fn generate_short_correlation_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Correlation information carried through one inbound request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Unique identifier for this request.
    pub correlation_id: String,
    /// When the request was received.
    pub start_time: Instant,
    /// Transport the request came in on (`http`, `mcp`, `rpc`).
    pub transport: &'static str,
}

impl RequestContext {
    pub fn new(transport: &'static str) -> Self {
        Self {
            correlation_id: generate_short_correlation_id(),
            start_time: Instant::now(),
            transport,
        }
    }

    /// Get the elapsed time since the request started.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Create a log prefix for consistent logging format.
    pub fn log_prefix(&self) -> String {
        format!("[{}] [{}]", self.correlation_id, self.transport)
    }
}

/// Success/failure counters for one tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ToolCounts {
    pub success: u64,
    pub failure: u64,
}

/// Server metrics collection.
#[derive(Debug)]
pub struct ServerMetrics {
    /// Total number of executions.
    pub queries_total: AtomicU64,

    /// Total number of successful executions.
    pub queries_success: AtomicU64,

    /// Total number of failed executions.
    pub queries_failed: AtomicU64,

    /// Total execution time in milliseconds.
    pub query_time_ms_total: AtomicU64,

    /// Cache hits.
    pub cache_hits: AtomicU64,

    /// Cache misses.
    pub cache_misses: AtomicU64,

    /// One slot per latency bucket plus an overflow slot.
    latency_buckets: Vec<AtomicU64>,

    per_tool: Mutex<BTreeMap<String, ToolCounts>>,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self {
            queries_total: AtomicU64::new(0),
            queries_success: AtomicU64::new(0),
            queries_failed: AtomicU64::new(0),
            query_time_ms_total: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            latency_buckets: (0..=LATENCY_BUCKETS_MS.len())
                .map(|_| AtomicU64::new(0))
                .collect(),
            per_tool: Mutex::new(BTreeMap::new()),
        }
    }
}

impl ServerMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one execution of `tool`.
    pub fn record_query(&self, tool: &str, success: bool, duration: Duration) {
        self.queries_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.queries_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.queries_failed.fetch_add(1, Ordering::Relaxed);
        }

        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.query_time_ms_total.fetch_add(millis, Ordering::Relaxed);

        let bucket = LATENCY_BUCKETS_MS
            .iter()
            .position(|upper| millis <= *upper)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);

        let mut per_tool = self.per_tool.lock();
        let counts = per_tool.entry(tool.to_string()).or_default();
        if success {
            counts.success += 1;
        } else {
            counts.failure += 1;
        }
    }

    /// Record a cache hit.
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cache miss.
    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Counters for one tool.
    pub fn tool_counts(&self, tool: &str) -> ToolCounts {
        self.per_tool.lock().get(tool).copied().unwrap_or_default()
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queries_total: self.queries_total.load(Ordering::Relaxed),
            queries_success: self.queries_success.load(Ordering::Relaxed),
            queries_failed: self.queries_failed.load(Ordering::Relaxed),
            query_time_ms_total: self.query_time_ms_total.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            latency_histogram: self
                .latency_buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
            per_tool: self.per_tool.lock().clone(),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub queries_total: u64,
    pub queries_success: u64,
    pub queries_failed: u64,
    pub query_time_ms_total: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Counts per bucket of [`LATENCY_BUCKETS_MS`]; the last slot is overflow.
    pub latency_histogram: Vec<u64>,
    pub per_tool: BTreeMap<String, ToolCounts>,
}

impl MetricsSnapshot {
    /// Calculate average query time in milliseconds.
    pub fn avg_query_time_ms(&self) -> f64 {
        if self.queries_total == 0 {
            return 0.0;
        }
        self.query_time_ms_total as f64 / self.queries_total as f64
    }

    /// Calculate query success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.queries_total == 0 {
            return 100.0;
        }
        (self.queries_success as f64 / self.queries_total as f64) * 100.0
    }

    /// Calculate cache hit rate as a percentage.
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            return 0.0;
        }
        (self.cache_hits as f64 / total as f64) * 100.0
    }
}

/// Shared metrics type for thread-safe access.
pub type SharedMetrics = Arc<ServerMetrics>;

/// Create a new shared metrics collector.
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(ServerMetrics::new())
}

/// Query timer for measuring execution duration.
pub struct QueryTimer {
    start: Instant,
    tool: String,
    metrics: SharedMetrics,
}

impl QueryTimer {
    /// Start a new query timer.
    pub fn start(metrics: SharedMetrics, tool: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            tool: tool.into(),
            metrics,
        }
    }

    /// Stop the timer and record the result.
    pub fn stop(self, success: bool) -> Duration {
        let duration = self.start.elapsed();
        self.metrics.record_query(&self.tool, success, duration);
        duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_query() {
        let metrics = ServerMetrics::new();
        metrics.record_query("get-user", true, Duration::from_millis(3));
        metrics.record_query("get-user", false, Duration::from_millis(70));
        metrics.record_query("other", true, Duration::from_secs(60));

        let snap = metrics.snapshot();
        assert_eq!(snap.queries_total, 3);
        assert_eq!(snap.queries_success, 2);
        assert_eq!(snap.queries_failed, 1);
        assert_eq!(
            metrics.tool_counts("get-user"),
            ToolCounts {
                success: 1,
                failure: 1
            }
        );
        assert_eq!(metrics.tool_counts("missing"), ToolCounts::default());

        // 3ms lands in the 5ms bucket, 70ms in 100ms, 60s in overflow.
        assert_eq!(snap.latency_histogram[1], 1);
        assert_eq!(snap.latency_histogram[5], 1);
        assert_eq!(snap.latency_histogram[LATENCY_BUCKETS_MS.len()], 1);
        assert_eq!(snap.latency_histogram.iter().sum::<u64>(), 3);
    }

    #[test]
    fn test_rates_with_no_data() {
        let snap = ServerMetrics::new().snapshot();
        assert_eq!(snap.success_rate(), 100.0);
        assert_eq!(snap.cache_hit_rate(), 0.0);
        assert_eq!(snap.avg_query_time_ms(), 0.0);
    }

    #[test]
    fn test_cache_hit_rate() {
        let metrics = ServerMetrics::new();
        for _ in 0..3 {
            metrics.record_cache_hit();
        }
        metrics.record_cache_miss();
        assert!((metrics.snapshot().cache_hit_rate() - 75.0).abs() < 0.01);
    }

    #[test]
    fn test_query_timer() {
        let metrics = new_shared_metrics();
        let timer = QueryTimer::start(Arc::clone(&metrics), "t");
        timer.stop(true);
        assert_eq!(metrics.tool_counts("t").success, 1);
    }

    #[test]
    fn test_request_context() {
        let ctx = RequestContext::new("http");
        assert_eq!(ctx.correlation_id.len(), 8);
        assert!(ctx.log_prefix().ends_with("[http]"));
    }
}
