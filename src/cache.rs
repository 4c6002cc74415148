//! Query result caching with per-entry TTL.
//!
//! Entries are keyed by a SHA-256 fingerprint of `query-name:final-statement`
//! and weighed by an estimate of their size in bytes; the cache evicts once
//! the configured total cost is exceeded.

use crate::connector::{Row, Value};
use moka::future::Cache;
use moka::Expiry;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Fixed per-entry overhead added to the estimated cost.
const ENTRY_OVERHEAD_BYTES: u64 = 64;

/// A cached row set.
#[derive(Debug)]
pub struct CacheEntry {
    /// The cached rows.
    pub rows: Vec<Row>,

    /// Time-to-live for this entry.
    pub ttl: Duration,

    /// Estimated size in bytes.
    pub cost: u64,

    /// When the entry was admitted.
    pub created_at: Instant,
}

impl CacheEntry {
    fn new(rows: Vec<Row>, ttl: Duration) -> Self {
        let cost = estimate_rows_cost(&rows);
        Self {
            rows,
            ttl,
            cost,
            created_at: Instant::now(),
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Total number of cache hits.
    pub hits: u64,

    /// Total number of cache misses.
    pub misses: u64,

    /// Number of successful admissions.
    pub sets: u64,

    /// Entries currently held.
    pub entry_count: u64,

    /// Sum of entry costs in bytes.
    pub total_cost: u64,
}

impl CacheStats {
    /// Calculate hit rate as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

struct EntryTtl;

impl Expiry<String, Arc<CacheEntry>> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<CacheEntry>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Bounded-cost result cache.
pub struct ResultCache {
    entries: Cache<String, Arc<CacheEntry>>,
    max_cost: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
}

impl ResultCache {
    /// Create a cache holding at most `max_cost_mb` MiB of estimated row data.
    ///
    /// There is no separate counter budget: moka sizes its TinyLFU frequency
    /// sketch from the weighted capacity, so the byte budget bounds both the
    /// stored data and the admission bookkeeping.
    pub fn new(max_cost_mb: u64) -> Self {
        let max_cost = max_cost_mb.saturating_mul(1024 * 1024);
        let entries = Cache::builder()
            .max_capacity(max_cost)
            .weigher(|_key: &String, entry: &Arc<CacheEntry>| -> u32 {
                u32::try_from(entry.cost).unwrap_or(u32::MAX)
            })
            .expire_after(EntryTtl)
            .build();

        Self {
            entries,
            max_cost,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }

    /// Configured maximum total cost in bytes.
    pub fn max_cost(&self) -> u64 {
        self.max_cost
    }

    /// Look up a fingerprint, returning a private copy of the rows.
    pub async fn get(&self, key: &str) -> Option<Vec<Row>> {
        match self.entries.get(key).await {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.rows.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Admit a copy of `rows` under `key` for `ttl`.
    ///
    /// An existing live entry is left untouched. Returns whether this call
    /// admitted the value. Once it returns, subsequent lookups observe the
    /// entry.
    pub async fn set(&self, key: String, rows: &[Row], ttl: Duration) -> bool {
        if ttl.is_zero() {
            return false;
        }

        let entry = Arc::new(CacheEntry::new(rows.to_vec(), ttl));
        let cost = entry.cost;
        let admitted = self
            .entries
            .entry(key)
            .or_insert_with(async move { entry })
            .await
            .is_fresh();

        if admitted {
            self.sets.fetch_add(1, Ordering::Relaxed);
            self.entries.run_pending_tasks().await;
            debug!(cost, "Cache admit");
        }
        admitted
    }

    /// Drop every entry.
    pub async fn clear(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks().await;
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            entry_count: self.entries.entry_count(),
            total_cost: self.entries.weighted_size(),
        }
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("max_cost", &self.max_cost)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Shared cache wrapper.
pub type SharedCache = Arc<ResultCache>;

/// Cache key for one execution: hex SHA-256 of `name:statement`.
pub fn fingerprint(query_name: &str, statement: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query_name.as_bytes());
    hasher.update(b":");
    hasher.update(statement.as_bytes());
    hex::encode(hasher.finalize())
}

/// Estimate the size of a row set in bytes.
pub fn estimate_rows_cost(rows: &[Row]) -> u64 {
    let mut cost = ENTRY_OVERHEAD_BYTES;
    for row in rows {
        cost += estimate_row_cost(row);
    }
    cost
}

fn estimate_row_cost(row: &Row) -> u64 {
    row.iter()
        .map(|(key, value)| key.len() as u64 + estimate_value_cost(value))
        .sum()
}

/// Estimate the size of a value in bytes.
fn estimate_value_cost(value: &Value) -> u64 {
    match value {
        Value::Null => 1,
        Value::Bool(_) => 1,
        Value::Integer(_) => 8,
        Value::Float(_) => 8,
        Value::Timestamp(_) => 16,
        Value::Text(s) => s.len() as u64,
        Value::Map(row) => estimate_row_cost(row),
        Value::List(items) => items.iter().map(estimate_value_cost).sum(),
    }
}
