//! # AdRail Cache
//!
//! This crate provides the ad inventory cache for the AdRail SDK. Loaded ads
//! are expensive (a mediation round trip each) and perishable, so the cache
//! is TTL-bounded, capacity-bounded per key, and consumes entries on read.
//!
//! ## Features
//!
//! - Multi-tier key fallback: screen-specific, then shared base, then generic
//! - Lazy TTL eviction on read, with provider-side handle teardown
//! - Per-bucket FIFO capacity limits
//! - Demand-driven warm-up with a caller-supplied loader
//! - Hit/miss/eviction counters for diagnostics exports
//!
//! ## Example
//!
//! ```ignore
//! use adrail_cache::{AdCache, AdCacheConfig, CacheKey, CachedAd};
//! use adrail_traits::{AdUnitId, ScreenContext};
//!
//! let cache = AdCache::new(AdCacheConfig::default())?;
//!
//! let unit = AdUnitId::new("native-feed");
//! let screen = ScreenContext::new("home", 360);
//!
//! cache.put(CacheKey::screen_specific(&unit, &screen), CachedAd::new(handle, provider));
//!
//! // First hit wins and is removed from the bucket.
//! if let Some(entry) = cache.get(&unit, Some(&screen)) {
//!     let (handle, provider) = entry.into_parts();
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use adrail_error::{AdError, LoadError, Result};
use adrail_traits::{AdHandle, AdUnitId, ProviderId, ScreenContext};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Sliding window over which request frequency is measured
const REQUEST_WINDOW: Duration = Duration::from_secs(300);

/// Requests per window at which a key earns one extra cached ad
const BUSY_REQUESTS_PER_WINDOW: usize = 4;

/// Requests per window at which a key earns a second extra cached ad
const HOT_REQUESTS_PER_WINDOW: usize = 12;

/// Deepest bucket a configuration may ask for; inventory past this goes
/// stale faster than it is consumed
const MAX_PER_UNIT_LIMIT: usize = 3;

/// A fully resolved cache key.
///
/// Keys are flat strings; the tiering logic lives in the constructors and in
/// [`AdCache::get`], which walks the tiers in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for inventory bound to one ad unit on one screen context
    pub fn screen_specific(base: &AdUnitId, screen: &ScreenContext) -> Self {
        Self(format!("{}+{}", base.as_str(), screen.suffix()))
    }

    /// Key for inventory shared across screens of one ad unit
    pub fn shared(base: &AdUnitId) -> Self {
        Self(base.as_str().to_string())
    }

    /// Key for generic inventory reusable by any unit in a size bucket
    pub fn generic(screen: &ScreenContext) -> Self {
        Self(format!("generic+{}", screen.suffix()))
    }

    /// Returns the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration for the ad cache
#[derive(Debug, Clone)]
pub struct AdCacheConfig {
    /// Maximum entry age before a read treats it as gone
    pub ttl: Duration,
    /// Maximum entries held per key bucket
    pub max_per_unit: usize,
}

impl Default for AdCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_per_unit: 2,
        }
    }
}

impl AdCacheConfig {
    /// Creates the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the entry TTL
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the per-bucket capacity
    pub fn with_max_per_unit(mut self, max: usize) -> Self {
        self.max_per_unit = max;
        self
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.ttl.is_zero() {
            return Err(AdError::InvalidConfig(
                "cache ttl must be non-zero".to_string(),
            ));
        }
        if self.max_per_unit == 0 {
            return Err(AdError::InvalidConfig(
                "max_per_unit must be at least 1".to_string(),
            ));
        }
        if self.max_per_unit > MAX_PER_UNIT_LIMIT {
            return Err(AdError::InvalidConfig(format!(
                "max_per_unit must be at most {MAX_PER_UNIT_LIMIT}"
            )));
        }
        Ok(())
    }
}

/// One cached, ready-to-show ad.
///
/// The entry owns its handle. Whichever path removes it from the cache is
/// responsible for either showing or destroying the handle.
pub struct CachedAd {
    handle: Box<dyn AdHandle>,
    cached_at: Instant,
    /// Provider that filled this entry
    pub provider: ProviderId,
}

impl CachedAd {
    /// Wraps a freshly loaded handle for caching
    pub fn new(handle: Box<dyn AdHandle>, provider: ProviderId) -> Self {
        Self {
            handle,
            cached_at: Instant::now(),
            provider,
        }
    }

    /// True when the entry has outlived `ttl`
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.cached_at.elapsed() > ttl
    }

    /// Time since the entry was stored
    pub fn age(&self) -> Duration {
        self.cached_at.elapsed()
    }

    /// True while the underlying ad can still be shown
    pub fn is_ready(&self) -> bool {
        self.handle.is_ready()
    }

    /// Consumes the entry, handing ownership of the handle to the caller
    pub fn into_parts(self) -> (Box<dyn AdHandle>, ProviderId) {
        (self.handle, self.provider)
    }

    fn destroy(&mut self) {
        self.handle.destroy();
    }
}

impl fmt::Debug for CachedAd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedAd")
            .field("provider", &self.provider)
            .field("age_ms", &self.cached_at.elapsed().as_millis())
            .finish()
    }
}

/// Counter snapshot for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Reads that returned an entry
    pub hits: u64,
    /// Reads that found nothing in any tier
    pub misses: u64,
    /// Entries dropped on read because they outlived the TTL
    pub expired: u64,
    /// Entries dropped to make room in a full bucket
    pub evicted: u64,
    /// Entries accepted by `put`
    pub stored: u64,
    /// Live entries across all buckets right now
    pub entries: usize,
}

impl CacheStats {
    /// Hit rate over all reads, 0.0 when no reads happened
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Outcome of a [`AdCache::warm`] pass
#[derive(Debug, Clone, Serialize)]
pub struct WarmReport {
    /// Loads triggered across all target keys
    pub requested: usize,
    /// Loads that completed and were stored
    pub warmed: usize,
    /// Loads that failed or produced an unusable handle
    pub failed: usize,
}

impl WarmReport {
    /// True when every triggered load was stored
    pub fn is_complete(&self) -> bool {
        self.warmed == self.requested
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    evicted: AtomicU64,
    stored: AtomicU64,
}

/// TTL- and capacity-bounded ad store with multi-tier key fallback.
///
/// Reads consume: a hit removes the entry from its bucket, because showing
/// an ad uses it up and the same inventory must never be served twice.
#[derive(Debug)]
pub struct AdCache {
    config: AdCacheConfig,
    buckets: DashMap<CacheKey, VecDeque<CachedAd>>,
    demand: DashMap<CacheKey, VecDeque<Instant>>,
    counters: CacheCounters,
}

impl AdCache {
    /// Creates a cache, validating the configuration
    pub fn new(config: AdCacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            buckets: DashMap::new(),
            demand: DashMap::new(),
            counters: CacheCounters::default(),
        })
    }

    /// Creates a cache with the default configuration
    pub fn with_defaults() -> Self {
        Self {
            config: AdCacheConfig::default(),
            buckets: DashMap::new(),
            demand: DashMap::new(),
            counters: CacheCounters::default(),
        }
    }

    /// Returns the active configuration
    pub fn config(&self) -> &AdCacheConfig {
        &self.config
    }

    /// Looks up inventory for `base` on the given screen, consuming the hit.
    ///
    /// Tiers are tried in order: screen-specific, shared base, then the
    /// generic bucket for the same screen-size class. The first live entry
    /// wins and is removed. Entries past their TTL are destroyed in passing
    /// and never returned.
    pub fn get(&self, base: &AdUnitId, screen: Option<&ScreenContext>) -> Option<CachedAd> {
        let primary = match screen {
            Some(screen) => CacheKey::screen_specific(base, screen),
            None => CacheKey::shared(base),
        };
        self.record_demand(&primary);

        let mut tiers = vec![primary];
        if let Some(screen) = screen {
            tiers.push(CacheKey::shared(base));
            tiers.push(CacheKey::generic(screen));
        }

        for key in &tiers {
            if let Some(entry) = self.take_live(key) {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, provider = %entry.provider, "Cache hit");
                return Some(entry);
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Stores a loaded ad under `key`.
    ///
    /// Shown or otherwise unusable handles are refused: once displayed, the
    /// inventory is spent and caching it would serve a dead ad later. When
    /// the bucket is full the oldest entry is destroyed to make room.
    /// Returns whether the entry was stored.
    pub fn put(&self, key: CacheKey, entry: CachedAd) -> bool {
        if !entry.is_ready() {
            tracing::warn!(key = %key, provider = %entry.provider, "Refusing to cache an ad that is not ready");
            let mut entry = entry;
            entry.destroy();
            return false;
        }

        let mut bucket = self.buckets.entry(key.clone()).or_default();
        while bucket.len() >= self.config.max_per_unit {
            if let Some(mut oldest) = bucket.pop_front() {
                oldest.destroy();
                self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "Evicted oldest entry from full bucket");
            } else {
                break;
            }
        }
        bucket.push_back(entry);
        self.counters.stored.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Destroys and removes every entry under `key`, returning how many
    pub fn remove(&self, key: &CacheKey) -> usize {
        match self.buckets.remove(key) {
            Some((_, mut bucket)) => {
                let count = bucket.len();
                for entry in bucket.iter_mut() {
                    entry.destroy();
                }
                count
            }
            None => 0,
        }
    }

    /// Destroys and removes all entries in all buckets
    pub fn clear(&self) {
        let keys: Vec<CacheKey> = self.buckets.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.remove(&key);
        }
    }

    /// Live entries currently held under `key`.
    ///
    /// Expired entries are pruned in passing so the answer reflects what a
    /// `get` would actually find.
    pub fn size_of(&self, key: &CacheKey) -> usize {
        match self.buckets.get_mut(key) {
            Some(mut bucket) => {
                self.prune_expired(key, &mut bucket);
                bucket.len()
            }
            None => 0,
        }
    }

    /// How many entries this key deserves, based on recent demand.
    ///
    /// Every key warrants one. Keys seeing steady traffic warrant more, up
    /// to the per-bucket capacity limit.
    pub fn recommended_depth(&self, key: &CacheKey) -> usize {
        let recent = match self.demand.get_mut(key) {
            Some(mut history) => {
                Self::prune_demand(&mut history);
                history.len()
            }
            None => 0,
        };

        let mut depth = 1;
        if recent >= BUSY_REQUESTS_PER_WINDOW {
            depth += 1;
        }
        if recent >= HOT_REQUESTS_PER_WINDOW {
            depth += 1;
        }
        depth.min(self.config.max_per_unit)
    }

    /// Fills target buckets toward their recommended depth.
    ///
    /// For each target key the deficit against `max(requested, recommended)`
    /// is computed, that many loads run concurrently through `loader`, and
    /// the successes are stored. The report counts every triggered load.
    pub async fn warm<L, Fut>(&self, targets: HashMap<CacheKey, usize>, loader: L) -> WarmReport
    where
        L: Fn(CacheKey) -> Fut,
        Fut: Future<Output = std::result::Result<(Box<dyn AdHandle>, ProviderId), LoadError>>
            + Send
            + 'static,
    {
        let mut loads: JoinSet<(CacheKey, std::result::Result<_, LoadError>)> = JoinSet::new();
        let mut requested = 0;

        for (key, wanted) in targets {
            let desired = wanted
                .max(self.recommended_depth(&key))
                .min(self.config.max_per_unit);
            let needed = desired.saturating_sub(self.size_of(&key));

            for _ in 0..needed {
                let key = key.clone();
                let load = loader(key.clone());
                requested += 1;
                loads.spawn(async move { (key, load.await) });
            }
        }

        let mut warmed = 0;
        let mut failed = 0;
        while let Some(joined) = loads.join_next().await {
            match joined {
                Ok((key, Ok((handle, provider)))) => {
                    if self.put(key, CachedAd::new(handle, provider)) {
                        warmed += 1;
                    } else {
                        failed += 1;
                    }
                }
                Ok((key, Err(error))) => {
                    tracing::warn!(key = %key, error = %error, "Warm-up load failed");
                    failed += 1;
                }
                Err(join_error) => {
                    tracing::error!(error = %join_error, "Warm-up task panicked");
                    failed += 1;
                }
            }
        }

        let report = WarmReport {
            requested,
            warmed,
            failed,
        };
        tracing::info!(
            requested = report.requested,
            warmed = report.warmed,
            failed = report.failed,
            "Cache warm-up pass finished"
        );
        report
    }

    /// Returns a counter snapshot
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            stored: self.counters.stored.load(Ordering::Relaxed),
            entries: self.buckets.iter().map(|b| b.value().len()).sum(),
        }
    }

    // Pops the first live entry under `key`, destroying expired ones.
    fn take_live(&self, key: &CacheKey) -> Option<CachedAd> {
        let mut bucket = self.buckets.get_mut(key)?;
        self.prune_expired(key, &mut bucket);
        bucket.pop_front()
    }

    fn prune_expired(&self, key: &CacheKey, bucket: &mut VecDeque<CachedAd>) {
        while let Some(front) = bucket.front() {
            if !front.is_expired(self.config.ttl) {
                break;
            }
            if let Some(mut expired) = bucket.pop_front() {
                expired.destroy();
                self.counters.expired.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "Destroyed expired cache entry");
            }
        }
    }

    fn record_demand(&self, key: &CacheKey) {
        let mut history = self.demand.entry(key.clone()).or_default();
        Self::prune_demand(&mut history);
        history.push_back(Instant::now());
    }

    fn prune_demand(history: &mut VecDeque<Instant>) {
        while let Some(oldest) = history.front() {
            if oldest.elapsed() <= REQUEST_WINDOW {
                break;
            }
            history.pop_front();
        }
    }
}
