//! Per-format counters and aggregate engine snapshots.
//!
//! Counters are plain atomics bumped on the request path; snapshots are
//! taken on demand and serialize cleanly for debug export.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use adrail_cache::CacheStats;
use adrail_resilience::CircuitMetrics;
use adrail_traits::AdFormat;

use crate::pool::PoolStats;

/// Live counters for one ad format.
#[derive(Debug, Default)]
pub struct FormatCounters {
    requests: AtomicU64,
    served_fresh: AtomicU64,
    served_cache: AtomicU64,
    skips: AtomicU64,
    failures: AtomicU64,
    shows: AtomicU64,
}

impl FormatCounters {
    /// Counts one request entering the engine
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a request served by a fresh load
    pub fn record_fresh(&self) {
        self.served_fresh.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a request served from cache
    pub fn record_cache_hit(&self) {
        self.served_cache.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a request the frequency gate or cache policy skipped
    pub fn record_skip(&self) {
        self.skips.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a request that exhausted every way of getting an ad
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a successful show
    pub fn record_show(&self) {
        self.shows.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of the counters for `format`
    pub fn snapshot(&self, format: AdFormat) -> FormatStats {
        FormatStats {
            format,
            requests: self.requests.load(Ordering::Relaxed),
            served_fresh: self.served_fresh.load(Ordering::Relaxed),
            served_cache: self.served_cache.load(Ordering::Relaxed),
            skips: self.skips.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            shows: self.shows.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counters for one format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FormatStats {
    /// Format these counters belong to
    pub format: AdFormat,
    /// Requests entering the engine
    pub requests: u64,
    /// Requests served by a fresh load
    pub served_fresh: u64,
    /// Requests served from cache
    pub served_cache: u64,
    /// Requests skipped by gating or cache policy
    pub skips: u64,
    /// Requests that failed outright
    pub failures: u64,
    /// Successful shows
    pub shows: u64,
}

/// Pool snapshot tagged with its format.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoolSnapshot {
    /// Format the pool serves
    pub format: AdFormat,
    /// Pool counters and rates
    pub stats: PoolStats,
}

/// Aggregate snapshot across formats, cache, pools, and circuits.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    /// Per-format request counters, sorted by format name
    pub formats: Vec<FormatStats>,
    /// Shared ad cache counters
    pub cache: CacheStats,
    /// One entry per configured pool
    pub pools: Vec<PoolSnapshot>,
    /// Waterfall circuit states, sorted by key
    pub circuits: Vec<CircuitMetrics>,
}
