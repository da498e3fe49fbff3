//! Strategy-aware ad loading engine.
//!
//! The engine owns one slot record per [`AdSlotKey`] and drives it through
//! Idle -> Loading -> Ready -> Shown, with Failed and Destroyed as the off
//! ramps. A request consults the frequency gate, then the cache, then the
//! fresh path (pool or waterfall) according to the format's strategy, with
//! transparent backoff retries for retryable failures. Loads are
//! single-flight per slot: a second request while one is in flight is
//! rejected instead of queued, and destroying a slot invalidates whatever
//! its in-flight load eventually produces.

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use adrail_cache::{AdCache, AdCacheConfig, CacheKey, CachedAd, WarmReport};
use adrail_error::{AdError, ErrorContext, LoadError, ShowError};
use adrail_resilience::{with_timeout, BackoffConfig, CircuitBreakerConfig, RetryScheduler};
use adrail_traits::{
    AdFormat, AdHandle, AdSlotKey, AdUnitId, DisplayToken, ProviderId, ShowSession,
};

use crate::frequency::{FrequencyGate, FrequencyPolicy, GateDecision};
use crate::pool::AdPool;
use crate::registry::ProviderRegistry;
use crate::stats::{EngineStats, FormatCounters, PoolSnapshot};
use crate::strategy::{resolve_effective_config, LoadingStrategy};
use crate::waterfall::{ProviderWaterfall, WaterfallWin};

/// Default total attempt budget per request, initial load included
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

// ============================================================================
// Configuration
// ============================================================================

/// Per-format loading configuration.
#[derive(Debug, Clone)]
pub struct FormatConfig {
    /// Strategy driving cache and fresh-load behavior
    pub strategy: LoadingStrategy,
    /// Waterfall chain in priority order
    pub providers: Vec<ProviderId>,
    /// Ad unit each provider loads for this format
    pub ad_units: HashMap<ProviderId, AdUnitId>,
    /// Units to preload into a pool; non-empty routes requests via the pool
    pub pool_units: Vec<AdUnitId>,
    /// Frequency capping for this format, if any
    pub frequency: Option<FrequencyPolicy>,
    /// Total load attempts per request, initial load included
    pub max_attempts: u32,
    /// Upper bound on one fresh waterfall pass
    pub fresh_timeout: Option<Duration>,
}

impl FormatConfig {
    /// Creates a config for `strategy` with no providers wired yet
    pub fn new(strategy: LoadingStrategy) -> Self {
        Self {
            strategy,
            providers: Vec::new(),
            ad_units: HashMap::new(),
            pool_units: Vec::new(),
            frequency: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            fresh_timeout: None,
        }
    }

    /// Appends a provider to the chain and maps it to `ad_unit`
    pub fn with_provider(mut self, provider: impl Into<String>, ad_unit: impl Into<String>) -> Self {
        let provider = ProviderId::new(provider);
        if !self.providers.contains(&provider) {
            self.providers.push(provider.clone());
        }
        self.ad_units.insert(provider, AdUnitId::new(ad_unit));
        self
    }

    /// Configures pool preloading over `units`
    pub fn with_pool_units(mut self, units: impl IntoIterator<Item = AdUnitId>) -> Self {
        self.pool_units = units.into_iter().collect();
        self
    }

    /// Applies a frequency policy
    pub fn with_frequency(mut self, policy: FrequencyPolicy) -> Self {
        self.frequency = Some(policy);
        self
    }

    /// Sets the total attempt budget per request
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Bounds each fresh waterfall pass to `timeout`
    pub fn with_fresh_timeout(mut self, timeout: Duration) -> Self {
        self.fresh_timeout = Some(timeout);
        self
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct AdEngineConfig {
    /// One entry per served format
    pub formats: HashMap<AdFormat, FormatConfig>,
    /// Circuit breaker settings shared by waterfall and pools
    pub breaker: CircuitBreakerConfig,
    /// Backoff schedule for transparent retries
    pub backoff: BackoffConfig,
    /// Shared ad cache settings
    pub cache: AdCacheConfig,
}

impl AdEngineConfig {
    /// Creates a config with default resilience settings and no formats
    pub fn new() -> Self {
        Self {
            formats: HashMap::new(),
            breaker: CircuitBreakerConfig::new("ad-providers"),
            backoff: BackoffConfig::default(),
            cache: AdCacheConfig::default(),
        }
    }

    /// Adds or replaces the configuration for `format`
    pub fn with_format(mut self, format: AdFormat, config: FormatConfig) -> Self {
        self.formats.insert(format, config);
        self
    }

    /// Validates strategy assignments and nested settings.
    pub fn validate(&self) -> Result<(), AdError> {
        self.cache.validate()?;
        for (format, config) in &self.formats {
            if config.strategy == LoadingStrategy::OnlyCache && *format == AdFormat::Native {
                return Err(AdError::UnsupportedStrategy {
                    strategy: config.strategy.as_str().to_string(),
                    format: format.as_str().to_string(),
                });
            }
            if config.max_attempts == 0 {
                return Err(AdError::InvalidConfig(format!(
                    "max_attempts must be at least 1 for format {format}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for AdEngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Slots and Decisions
// ============================================================================

/// Lifecycle state of one ad slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Nothing loaded and nothing in flight
    Idle,
    /// A load is in flight; concurrent requests are rejected
    Loading,
    /// An ad is held and waiting to show
    Ready,
    /// The held ad is on screen
    Shown,
    /// The last load failed
    Failed,
    /// The surface went away; pending work for this slot is void
    Destroyed,
}

struct SlotRecord {
    state: SlotState,
    handle: Option<Box<dyn AdHandle>>,
    provider: Option<ProviderId>,
    from_cache: bool,
    from_pool: bool,
    attempts: u32,
    generation: u64,
}

impl Default for SlotRecord {
    fn default() -> Self {
        Self {
            state: SlotState::Idle,
            handle: None,
            provider: None,
            from_cache: false,
            from_pool: false,
            attempts: 0,
            generation: 0,
        }
    }
}

impl fmt::Debug for SlotRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotRecord")
            .field("state", &self.state)
            .field("provider", &self.provider)
            .field("from_cache", &self.from_cache)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Why a request was skipped without an ad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The call was not the Nth in the configured cadence
    EveryNth,
    /// The lifetime show cap is reached
    MaxShows,
    /// The previous show was too recent
    MinInterval,
    /// Cache-only strategy found nothing cached
    NoCache,
}

/// Outcome of a request.
///
/// `Ready` means the slot now holds an ad; call [`AdEngine::show`] to put it
/// on screen. The handle itself stays inside the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// An ad is loaded and waiting in the slot
    Ready {
        /// Provider that produced the ad
        provider: ProviderId,
        /// True when served from the cache rather than a fresh load
        from_cache: bool,
        /// Retries that were needed, 0 for a first-try fill
        attempts: u32,
    },
    /// No ad: policy said not to serve this request
    Skipped(SkipReason),
}

enum Claim {
    Claimed(u64),
    Existing(Decision),
}

fn skip_reason(decision: GateDecision) -> Option<SkipReason> {
    match decision {
        GateDecision::Allow => None,
        GateDecision::SkipEveryNth => Some(SkipReason::EveryNth),
        GateDecision::SkipMaxShows => Some(SkipReason::MaxShows),
        GateDecision::SkipMinInterval => Some(SkipReason::MinInterval),
    }
}

fn as_load_error(error: AdError) -> LoadError {
    match error {
        AdError::Load(load) => load,
        AdError::WaterfallExhausted { last, .. } | AdError::RetriesExhausted { last, .. } => last,
        other => LoadError::Internal(other.to_string()),
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Coordinates gate, cache, pools, waterfall, and retries per slot.
pub struct AdEngine {
    formats: HashMap<AdFormat, FormatConfig>,
    registry: Arc<ProviderRegistry>,
    waterfall: ProviderWaterfall,
    cache: Arc<AdCache>,
    gate: FrequencyGate<AdSlotKey>,
    pools: HashMap<AdFormat, AdPool>,
    retries: RetryScheduler<AdSlotKey>,
    slots: DashMap<AdSlotKey, SlotRecord>,
    counters: DashMap<AdFormat, Arc<FormatCounters>>,
}

impl AdEngine {
    /// Builds an engine from `config` over the providers in `registry`.
    ///
    /// Pools are created for every format that configures `pool_units`; each
    /// pool gets its own breaker derived from the shared breaker settings.
    pub fn new(config: AdEngineConfig, registry: Arc<ProviderRegistry>) -> Result<Self, AdError> {
        config.validate()?;
        let AdEngineConfig {
            formats,
            breaker,
            backoff,
            cache,
        } = config;

        let mut pools = HashMap::new();
        let counters = DashMap::new();
        for (format, format_config) in &formats {
            counters.insert(*format, Arc::new(FormatCounters::default()));
            if !format_config.pool_units.is_empty() {
                let pool_breaker = CircuitBreakerConfig {
                    name: format!("pool-{}", format.as_str()),
                    ..breaker.clone()
                };
                pools.insert(
                    *format,
                    AdPool::new(format_config.pool_units.iter().cloned(), pool_breaker),
                );
            }
        }

        Ok(Self {
            formats,
            waterfall: ProviderWaterfall::new(Arc::clone(&registry), breaker),
            registry,
            cache: Arc::new(AdCache::new(cache)?),
            gate: FrequencyGate::new(),
            pools,
            retries: RetryScheduler::new(backoff),
            slots: DashMap::new(),
            counters,
        })
    }

    /// Requests an ad for `slot`.
    ///
    /// Runs the frequency gate first, then resolves the format's strategy:
    /// cache read, fresh load through pool or waterfall with transparent
    /// retries, and cache fallback where the strategy allows it. `force`
    /// bypasses only the minimum-interval gate rule.
    ///
    /// Returns [`AdError::AlreadyLoading`] when a load for this slot is
    /// already in flight.
    pub async fn request(&self, slot: &AdSlotKey, force: bool) -> Result<Decision, AdError> {
        let config = self.formats.get(&slot.format).ok_or_else(|| {
            AdError::InvalidConfig(format!("format {} is not configured", slot.format))
        })?;
        let counters = self.counters_for(slot.format);
        counters.record_request();

        if let Some(policy) = &config.frequency {
            if let Some(reason) = skip_reason(self.gate.should_show(slot, policy, force)) {
                counters.record_skip();
                debug!(slot = %slot, reason = ?reason, "request gated");
                return Ok(Decision::Skipped(reason));
            }
        }

        let generation = match self.claim_slot(slot)? {
            Claim::Existing(decision) => return Ok(decision),
            Claim::Claimed(generation) => generation,
        };

        let effective = resolve_effective_config(config.strategy);

        if effective.read_cache_first {
            if let Some(cached) = self.cache.get(&slot.ad_unit, slot.screen.as_ref()) {
                let (handle, provider) = cached.into_parts();
                let decision = self.complete_load(slot, generation, handle, provider, true, false, 0)?;
                counters.record_cache_hit();
                info!(slot = %slot, "served from cache");
                return Ok(decision);
            }
            if !effective.load_fresh {
                self.release_slot(slot, generation);
                counters.record_skip();
                debug!(slot = %slot, "cache miss under cache-only strategy");
                return Ok(Decision::Skipped(SkipReason::NoCache));
            }
        }

        match self.load_fresh(slot, config).await {
            Ok((handle, provider, from_pool, attempts)) => {
                let decision =
                    self.complete_load(slot, generation, handle, provider, false, from_pool, attempts)?;
                counters.record_fresh();
                Ok(decision)
            }
            Err(error) => {
                if effective.cache_fallback_on_failure {
                    if let Some(cached) = self.cache.get(&slot.ad_unit, slot.screen.as_ref()) {
                        let (handle, provider) = cached.into_parts();
                        let decision =
                            self.complete_load(slot, generation, handle, provider, true, false, 0)?;
                        counters.record_cache_hit();
                        info!(slot = %slot, error = %error, "fresh load failed, served cache fallback");
                        return Ok(decision);
                    }
                }
                self.fail_slot(slot, generation);
                counters.record_failure();
                warn!(slot = %slot, error = %error, "request failed");
                Err(error)
            }
        }
    }

    /// Shows the ad held by `slot` on the surface identified by `token`.
    ///
    /// On success the slot moves to Shown and the frequency gate records the
    /// display; call [`on_shown`](AdEngine::on_shown) once the ad leaves the
    /// screen. A failed show destroys the ad and fails the slot.
    pub async fn show(
        &self,
        slot: &AdSlotKey,
        token: &DisplayToken,
    ) -> Result<ShowSession, AdError> {
        let (mut handle, generation, from_pool) = {
            let mut record = self.slots.get_mut(slot).ok_or_else(|| AdError::NotReady {
                slot: slot.to_string(),
            })?;
            if record.state != SlotState::Ready {
                return Err(AdError::NotReady {
                    slot: slot.to_string(),
                });
            }
            let handle = match record.handle.take() {
                Some(handle) => handle,
                None => {
                    return Err(AdError::NotReady {
                        slot: slot.to_string(),
                    })
                }
            };
            record.state = SlotState::Shown;
            (handle, record.generation, record.from_pool)
        };

        match handle.show(token).await {
            Ok(session) => {
                self.gate.record_show(slot);
                self.counters_for(slot.format).record_show();
                if from_pool {
                    if let Some(pool) = self.pools.get(&slot.format) {
                        pool.record_impression();
                    }
                }
                info!(slot = %slot, token = token.id(), "ad on screen");
                match self.slots.get_mut(slot) {
                    Some(mut record)
                        if record.generation == generation && record.state == SlotState::Shown =>
                    {
                        record.handle = Some(handle);
                    }
                    _ => handle.destroy(),
                }
                Ok(session)
            }
            Err(error) => {
                handle.destroy();
                if let Some(mut record) = self.slots.get_mut(slot) {
                    if record.generation == generation && record.state == SlotState::Shown {
                        record.state = SlotState::Failed;
                        record.provider = None;
                    }
                }
                warn!(slot = %slot, error = %error, "show failed");
                Err(AdError::Show(error))
            }
        }
    }

    /// Reports that the shown ad left the screen; the slot returns to Idle.
    pub fn on_shown(&self, slot: &AdSlotKey) {
        if let Some(mut record) = self.slots.get_mut(slot) {
            if record.state != SlotState::Shown {
                return;
            }
            if let Some(mut handle) = record.handle.take() {
                handle.destroy();
            }
            record.state = SlotState::Idle;
            record.provider = None;
            record.from_cache = false;
            record.from_pool = false;
            debug!(slot = %slot, "show finished, slot idle");
        }
    }

    /// Reports that the slot's surface was destroyed.
    ///
    /// Pending retries are cancelled and whatever an in-flight load produces
    /// is discarded. An unshown ready ad is returned to the cache when the
    /// format's strategy fills opportunistically; otherwise it is destroyed.
    pub async fn on_destroyed(&self, slot: &AdSlotKey) {
        self.retries.cancel(slot).await;
        let salvaged = {
            let mut record = match self.slots.get_mut(slot) {
                Some(record) => record,
                None => return,
            };
            record.generation += 1;
            let state = record.state;
            record.state = SlotState::Destroyed;
            let handle = record.handle.take();
            let provider = record.provider.take();
            record.from_cache = false;
            record.from_pool = false;
            match (state, handle, provider) {
                (SlotState::Ready, Some(handle), Some(provider)) => Some((handle, provider)),
                (_, Some(mut handle), _) => {
                    handle.destroy();
                    None
                }
                _ => None,
            }
        };
        debug!(slot = %slot, "slot destroyed");

        if let Some((mut handle, provider)) = salvaged {
            let keep = self
                .formats
                .get(&slot.format)
                .map(|config| resolve_effective_config(config.strategy).opportunistic_cache_fill)
                .unwrap_or(false);
            if keep && handle.is_ready() {
                if self
                    .cache
                    .put(Self::cache_key(slot), CachedAd::new(handle, provider))
                {
                    debug!(slot = %slot, "unshown ad returned to cache");
                }
            } else {
                handle.destroy();
            }
        }
    }

    /// Warms the cache for `targets` through each format's waterfall.
    ///
    /// Targets for unconfigured formats are skipped. Depth per key follows
    /// recent demand, clamped by the cache's per-key capacity.
    pub async fn warm_cache(&self, targets: &[AdSlotKey]) -> WarmReport {
        let mut grouped: HashMap<AdFormat, HashMap<CacheKey, usize>> = HashMap::new();
        for slot in targets {
            if !self.formats.contains_key(&slot.format) {
                warn!(slot = %slot, "skipping warm target for unconfigured format");
                continue;
            }
            *grouped
                .entry(slot.format)
                .or_default()
                .entry(Self::cache_key(slot))
                .or_insert(0) += 1;
        }

        let mut total = WarmReport {
            requested: 0,
            warmed: 0,
            failed: 0,
        };
        for (format, keys) in grouped {
            let config = match self.formats.get(&format) {
                Some(config) => config,
                None => continue,
            };
            let waterfall = self.waterfall.clone();
            let chain = config.providers.clone();
            let units = config.ad_units.clone();
            let loader = move |_key: CacheKey| {
                let waterfall = waterfall.clone();
                let chain = chain.clone();
                let units = units.clone();
                async move {
                    match waterfall.load(format, &chain, &units).await {
                        Ok(win) => Ok((win.handle, win.provider)),
                        Err(error) => Err(as_load_error(error)),
                    }
                }
            };
            let report = self.cache.warm(keys, loader).await;
            total.requested += report.requested;
            total.warmed += report.warmed;
            total.failed += report.failed;
        }
        total
    }

    /// Refills every eligible slot of the format's pool once.
    ///
    /// Units behind an open breaker are skipped. Returns how many slots were
    /// filled.
    pub async fn replenish_pool(&self, format: AdFormat) -> Result<usize, AdError> {
        let pool = self.pools.get(&format).ok_or_else(|| {
            AdError::InvalidConfig(format!("no pool configured for format {format}"))
        })?;
        let config = self.formats.get(&format).ok_or_else(|| {
            AdError::InvalidConfig(format!("format {format} is not configured"))
        })?;

        let mut filled = 0usize;
        for ad_unit in pool.units().await {
            if pool.breaker().is_open(&ad_unit).await {
                continue;
            }
            if !pool.mark_loading(&ad_unit).await {
                continue;
            }
            let units: HashMap<ProviderId, AdUnitId> = config
                .providers
                .iter()
                .map(|provider| (provider.clone(), ad_unit.clone()))
                .collect();
            match self
                .waterfall_pass(format, &config.providers, &units, config.fresh_timeout)
                .await
            {
                Ok(win) => {
                    pool.mark_ready(&ad_unit, win.handle).await;
                    filled += 1;
                }
                Err(error) => {
                    pool.mark_failed(&ad_unit).await;
                    warn!(format = %format, ad_unit = %ad_unit, error = %error, "pool refill failed");
                }
            }
        }
        info!(format = %format, filled, ready = pool.ready_count().await, "pool replenished");
        Ok(filled)
    }

    /// Current lifecycle state of `slot`, if the engine has seen it
    pub fn slot_state(&self, slot: &AdSlotKey) -> Option<SlotState> {
        self.slots.get(slot).map(|record| record.state)
    }

    /// Aggregate counters across formats, cache, pools, and circuits.
    pub async fn stats(&self) -> EngineStats {
        let mut formats: Vec<_> = self
            .counters
            .iter()
            .map(|entry| entry.value().snapshot(*entry.key()))
            .collect();
        formats.sort_by_key(|stats| stats.format.as_str());

        let mut pools = Vec::new();
        for (format, pool) in &self.pools {
            pools.push(PoolSnapshot {
                format: *format,
                stats: pool.stats().await,
            });
        }
        pools.sort_by_key(|snapshot| snapshot.format.as_str());

        EngineStats {
            formats,
            cache: self.cache.stats(),
            pools,
            circuits: self.waterfall.breaker().metrics().await,
        }
    }

    /// Serializes the stats snapshot for debug surfaces.
    pub async fn export_debug_info(&self) -> Result<serde_json::Value, AdError> {
        let stats = self.stats().await;
        serde_json::to_value(&stats).context("serializing engine stats")
    }

    /// The shared ad cache
    pub fn cache(&self) -> &AdCache {
        &self.cache
    }

    /// The pool serving `format`, when one is configured
    pub fn pool(&self, format: AdFormat) -> Option<&AdPool> {
        self.pools.get(&format)
    }

    /// The frequency gate shared across formats
    pub fn gate(&self) -> &FrequencyGate<AdSlotKey> {
        &self.gate
    }

    /// The provider registry the engine loads through
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn counters_for(&self, format: AdFormat) -> Arc<FormatCounters> {
        let entry = self.counters.entry(format).or_default();
        Arc::clone(&*entry)
    }

    fn cache_key(slot: &AdSlotKey) -> CacheKey {
        match &slot.screen {
            Some(screen) => CacheKey::screen_specific(&slot.ad_unit, screen),
            None => CacheKey::shared(&slot.ad_unit),
        }
    }

    /// Claims the slot for a load, or reports why it cannot be claimed.
    fn claim_slot(&self, slot: &AdSlotKey) -> Result<Claim, AdError> {
        let mut record = self.slots.entry(slot.clone()).or_default();
        match record.state {
            SlotState::Loading => {
                warn!(slot = %slot, "rejecting concurrent load");
                Err(AdError::AlreadyLoading {
                    slot: slot.to_string(),
                })
            }
            SlotState::Shown => Err(AdError::Show(ShowError::AlreadyShowing)),
            SlotState::Ready => {
                let still_ready = matches!(&record.handle, Some(handle) if handle.is_ready());
                match (&record.provider, still_ready) {
                    (Some(provider), true) => Ok(Claim::Existing(Decision::Ready {
                        provider: provider.clone(),
                        from_cache: record.from_cache,
                        attempts: record.attempts,
                    })),
                    _ => {
                        if let Some(mut stale) = record.handle.take() {
                            debug!(slot = %slot, "held ad went stale, reloading");
                            stale.destroy();
                        }
                        record.state = SlotState::Loading;
                        record.generation += 1;
                        record.provider = None;
                        Ok(Claim::Claimed(record.generation))
                    }
                }
            }
            SlotState::Idle | SlotState::Failed | SlotState::Destroyed => {
                record.state = SlotState::Loading;
                record.generation += 1;
                record.provider = None;
                record.from_cache = false;
                record.from_pool = false;
                Ok(Claim::Claimed(record.generation))
            }
        }
    }

    /// Stores a load result if this load still owns the slot.
    fn complete_load(
        &self,
        slot: &AdSlotKey,
        generation: u64,
        mut handle: Box<dyn AdHandle>,
        provider: ProviderId,
        from_cache: bool,
        from_pool: bool,
        attempts: u32,
    ) -> Result<Decision, AdError> {
        let mut record = match self.slots.get_mut(slot) {
            Some(record) => record,
            None => {
                handle.destroy();
                return Err(AdError::Load(LoadError::Cancelled));
            }
        };
        if record.state == SlotState::Destroyed {
            handle.destroy();
            debug!(slot = %slot, "discarding load for destroyed slot");
            return Err(AdError::SlotDestroyed {
                slot: slot.to_string(),
            });
        }
        if record.generation != generation || record.state != SlotState::Loading {
            handle.destroy();
            debug!(slot = %slot, "discarding superseded load result");
            return Err(AdError::Load(LoadError::Cancelled));
        }
        record.state = SlotState::Ready;
        record.handle = Some(handle);
        record.provider = Some(provider.clone());
        record.from_cache = from_cache;
        record.from_pool = from_pool;
        record.attempts = attempts;
        Ok(Decision::Ready {
            provider,
            from_cache,
            attempts,
        })
    }

    fn release_slot(&self, slot: &AdSlotKey, generation: u64) {
        if let Some(mut record) = self.slots.get_mut(slot) {
            if record.generation == generation && record.state == SlotState::Loading {
                record.state = SlotState::Idle;
            }
        }
    }

    fn fail_slot(&self, slot: &AdSlotKey, generation: u64) {
        if let Some(mut record) = self.slots.get_mut(slot) {
            if record.generation == generation && record.state == SlotState::Loading {
                record.state = SlotState::Failed;
            }
        }
    }

    /// Fresh load with transparent retries up to the format's budget.
    async fn load_fresh(
        &self,
        slot: &AdSlotKey,
        config: &FormatConfig,
    ) -> Result<(Box<dyn AdHandle>, ProviderId, bool, u32), AdError> {
        let max_attempts = config.max_attempts.max(1);
        let mut attempt: u32 = 0;
        loop {
            match self.dispatch_load(slot, config).await {
                Ok((handle, provider, from_pool)) => {
                    return Ok((handle, provider, from_pool, attempt))
                }
                Err(error) => {
                    let next_attempt = attempt + 1;
                    if next_attempt >= max_attempts || !error.is_retryable() {
                        // A first-attempt failure surfaces as-is; once a
                        // retry ran, report how much of the budget was spent.
                        if attempt > 0 {
                            return Err(AdError::RetriesExhausted {
                                attempts: attempt,
                                last: as_load_error(error),
                            });
                        }
                        return Err(error);
                    }
                    let (tx, rx) = oneshot::channel();
                    let ticket = self
                        .retries
                        .schedule(slot.clone(), attempt, max_attempts, move || async move {
                            let _ = tx.send(());
                            Ok::<(), Infallible>(())
                        })
                        .await;
                    match ticket {
                        Ok(ticket) => {
                            warn!(
                                slot = %slot,
                                attempt = next_attempt,
                                delay_ms = ticket.delay.as_millis() as u64,
                                error = %error,
                                "load failed, retry scheduled"
                            );
                        }
                        Err(_) => return Err(error),
                    }
                    match rx.await {
                        Ok(()) => {
                            attempt = next_attempt;
                        }
                        // The ticket was cancelled out from under us.
                        Err(_) => return Err(AdError::Load(LoadError::Cancelled)),
                    }
                }
            }
        }
    }

    /// One load attempt: pooled serve or direct waterfall.
    async fn dispatch_load(
        &self,
        slot: &AdSlotKey,
        config: &FormatConfig,
    ) -> Result<(Box<dyn AdHandle>, ProviderId, bool), AdError> {
        let pool = match self.pools.get(&slot.format) {
            Some(pool) => pool,
            None => {
                let win = self
                    .waterfall_pass(slot.format, &config.providers, &config.ad_units, config.fresh_timeout)
                    .await?;
                return Ok((win.handle, win.provider, false));
            }
        };

        if let Some((ad_unit, handle)) = pool.take_ready().await {
            let provider = handle.provider().clone();
            debug!(slot = %slot, ad_unit = %ad_unit, "served from pool");
            return Ok((handle, provider, true));
        }

        let ad_unit = match pool.next_loadable().await {
            Some(ad_unit) => ad_unit,
            None => {
                return Err(AdError::PoolExhausted {
                    format: slot.format.as_str().to_string(),
                })
            }
        };
        if !pool.mark_loading(&ad_unit).await {
            return Err(AdError::PoolExhausted {
                format: slot.format.as_str().to_string(),
            });
        }
        let units: HashMap<ProviderId, AdUnitId> = config
            .providers
            .iter()
            .map(|provider| (provider.clone(), ad_unit.clone()))
            .collect();
        match self
            .waterfall_pass(slot.format, &config.providers, &units, config.fresh_timeout)
            .await
        {
            Ok(win) => {
                pool.record_fill(&ad_unit).await;
                Ok((win.handle, win.provider, true))
            }
            Err(error) => {
                pool.mark_failed(&ad_unit).await;
                Err(error)
            }
        }
    }

    /// One waterfall pass, time-bounded when a limit is configured.
    ///
    /// An expired limit drops the in-flight pass, which cancels whatever
    /// provider load was running.
    async fn waterfall_pass(
        &self,
        format: AdFormat,
        chain: &[ProviderId],
        units: &HashMap<ProviderId, AdUnitId>,
        limit: Option<Duration>,
    ) -> Result<WaterfallWin, AdError> {
        match limit {
            Some(limit) => {
                match with_timeout(limit, "fresh ad load", self.waterfall.load(format, chain, units))
                    .await
                {
                    Ok(result) => result,
                    Err(expired) => {
                        warn!(format = %format, limit_ms = limit.as_millis() as u64, "fresh load timed out");
                        Err(AdError::Load(LoadError::Timeout {
                            elapsed_ms: expired.duration.as_millis() as u64,
                        }))
                    }
                }
            }
            None => self.waterfall.load(format, chain, units).await,
        }
    }
}

impl fmt::Debug for AdEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdEngine")
            .field("formats", &self.formats.keys().collect::<Vec<_>>())
            .field("pools", &self.pools.keys().collect::<Vec<_>>())
            .field("slots", &self.slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adrail_testing::{FakeHandle, FakeProvider, LoadOutcome};
    use adrail_traits::{ScreenContext, ShowEvent};

    fn slot_key(format: AdFormat, unit: &str) -> AdSlotKey {
        AdSlotKey::new(format, AdUnitId::new(unit))
    }

    fn engine_for(
        format: AdFormat,
        config: FormatConfig,
        providers: Vec<Arc<FakeProvider>>,
    ) -> AdEngine {
        let registry = Arc::new(ProviderRegistry::new());
        for provider in providers {
            registry.register(provider);
        }
        AdEngine::new(
            AdEngineConfig::new().with_format(format, config),
            registry,
        )
        .unwrap()
    }

    fn seed_cache(engine: &AdEngine, slot: &AdSlotKey, provider: &str) {
        let handle = Box::new(FakeHandle::ready(ProviderId::new(provider)));
        assert!(engine.cache().put(
            AdEngine::cache_key(slot),
            CachedAd::new(handle, ProviderId::new(provider)),
        ));
    }

    #[tokio::test]
    async fn on_demand_serves_fresh_load() {
        let provider = Arc::new(FakeProvider::filling("admob"));
        let engine = engine_for(
            AdFormat::Banner,
            FormatConfig::new(LoadingStrategy::OnDemand).with_provider("admob", "unit-banner"),
            vec![Arc::clone(&provider)],
        );
        let slot = slot_key(AdFormat::Banner, "home-banner");

        let decision = engine.request(&slot, false).await.unwrap();
        assert_eq!(
            decision,
            Decision::Ready {
                provider: ProviderId::new("admob"),
                from_cache: false,
                attempts: 0,
            }
        );
        assert_eq!(engine.slot_state(&slot), Some(SlotState::Ready));
        assert_eq!(provider.requested_units().await, vec![AdUnitId::new("unit-banner")]);
    }

    #[tokio::test]
    async fn unconfigured_format_is_rejected() {
        let engine = engine_for(
            AdFormat::Banner,
            FormatConfig::new(LoadingStrategy::OnDemand),
            vec![],
        );
        let err = engine
            .request(&slot_key(AdFormat::Rewarded, "spin"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, AdError::InvalidConfig(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_request_is_rejected_not_queued() {
        let provider = Arc::new(
            FakeProvider::filling("admob").with_delay(Duration::from_millis(500)),
        );
        let engine = engine_for(
            AdFormat::Interstitial,
            FormatConfig::new(LoadingStrategy::OnDemand).with_provider("admob", "unit-int"),
            vec![Arc::clone(&provider)],
        );
        let slot = slot_key(AdFormat::Interstitial, "level-end");

        let (first, second) = tokio::join!(engine.request(&slot, false), engine.request(&slot, false));

        assert!(matches!(first, Ok(Decision::Ready { .. })));
        assert!(matches!(second, Err(AdError::AlreadyLoading { .. })));
        assert_eq!(provider.load_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hybrid_retries_transparently_then_fills() {
        let provider = Arc::new(FakeProvider::scripted(
            "admob",
            vec![
                LoadOutcome::Fail(LoadError::Network("socket reset".into())),
                LoadOutcome::Fill,
            ],
        ));
        let engine = engine_for(
            AdFormat::Interstitial,
            FormatConfig::new(LoadingStrategy::Hybrid)
                .with_provider("admob", "unit-int")
                .with_max_attempts(2),
            vec![Arc::clone(&provider)],
        );
        let slot = slot_key(AdFormat::Interstitial, "level-end");

        let decision = engine.request(&slot, false).await.unwrap();
        assert_eq!(
            decision,
            Decision::Ready {
                provider: ProviderId::new("admob"),
                from_cache: false,
                attempts: 1,
            }
        );
        assert_eq!(provider.load_calls(), 2);
    }

    #[tokio::test]
    async fn single_attempt_failure_surfaces_the_waterfall_error() {
        let provider = Arc::new(FakeProvider::failing("admob", LoadError::NoFill));
        let engine = engine_for(
            AdFormat::Banner,
            FormatConfig::new(LoadingStrategy::OnDemand)
                .with_provider("admob", "unit-banner")
                .with_max_attempts(1),
            vec![Arc::clone(&provider)],
        );
        let slot = slot_key(AdFormat::Banner, "home-banner");

        let err = engine.request(&slot, false).await.unwrap_err();
        assert_eq!(
            err,
            AdError::WaterfallExhausted {
                attempts: 1,
                last: LoadError::NoFill,
            }
        );
        assert_eq!(engine.slot_state(&slot), Some(SlotState::Failed));
        assert_eq!(provider.load_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_exhaustion_surfaces_last_error() {
        let provider = Arc::new(FakeProvider::failing("admob", LoadError::NoFill));
        let engine = engine_for(
            AdFormat::Banner,
            FormatConfig::new(LoadingStrategy::OnDemand)
                .with_provider("admob", "unit-banner")
                .with_max_attempts(3),
            vec![Arc::clone(&provider)],
        );
        let slot = slot_key(AdFormat::Banner, "home-banner");

        let err = engine.request(&slot, false).await.unwrap_err();
        assert_eq!(
            err,
            AdError::RetriesExhausted {
                attempts: 2,
                last: LoadError::NoFill,
            }
        );
        assert_eq!(engine.slot_state(&slot), Some(SlotState::Failed));
        assert_eq!(provider.load_calls(), 3);
    }

    #[tokio::test]
    async fn non_retryable_failure_skips_the_retry_budget() {
        let provider = Arc::new(FakeProvider::failing(
            "admob",
            LoadError::InvalidAdUnit {
                ad_unit: "bad".into(),
                reason: "unknown unit".into(),
            },
        ));
        let engine = engine_for(
            AdFormat::Banner,
            FormatConfig::new(LoadingStrategy::OnDemand)
                .with_provider("admob", "bad")
                .with_max_attempts(3),
            vec![Arc::clone(&provider)],
        );

        let err = engine
            .request(&slot_key(AdFormat::Banner, "home-banner"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, AdError::WaterfallExhausted { .. }));
        assert_eq!(provider.load_calls(), 1);
    }

    #[tokio::test]
    async fn hybrid_prefers_cache_over_fresh() {
        let provider = Arc::new(FakeProvider::filling("admob"));
        let engine = engine_for(
            AdFormat::Interstitial,
            FormatConfig::new(LoadingStrategy::Hybrid).with_provider("admob", "unit-int"),
            vec![Arc::clone(&provider)],
        );
        let slot = slot_key(AdFormat::Interstitial, "level-end");
        seed_cache(&engine, &slot, "applovin");

        let decision = engine.request(&slot, false).await.unwrap();
        assert_eq!(
            decision,
            Decision::Ready {
                provider: ProviderId::new("applovin"),
                from_cache: true,
                attempts: 0,
            }
        );
        assert_eq!(provider.load_calls(), 0);
    }

    #[tokio::test]
    async fn only_cache_hits_and_misses() {
        let provider = Arc::new(FakeProvider::filling("admob"));
        let engine = engine_for(
            AdFormat::Banner,
            FormatConfig::new(LoadingStrategy::OnlyCache).with_provider("admob", "unit-banner"),
            vec![Arc::clone(&provider)],
        );
        let slot = slot_key(AdFormat::Banner, "home-banner");

        let decision = engine.request(&slot, false).await.unwrap();
        assert_eq!(decision, Decision::Skipped(SkipReason::NoCache));
        assert_eq!(engine.slot_state(&slot), Some(SlotState::Idle));
        assert_eq!(provider.load_calls(), 0);

        seed_cache(&engine, &slot, "admob");
        let decision = engine.request(&slot, false).await.unwrap();
        assert!(matches!(decision, Decision::Ready { from_cache: true, .. }));
        assert_eq!(provider.load_calls(), 0);
    }

    #[tokio::test]
    async fn screen_slot_is_served_by_shared_cache_entry() {
        let engine = engine_for(
            AdFormat::Native,
            FormatConfig::new(LoadingStrategy::Hybrid),
            vec![],
        );
        let screen = ScreenContext::new("home", 360);
        let slot = slot_key(AdFormat::Native, "feed-native").with_screen(screen);

        // Only the shared tier has inventory for this unit.
        let handle = Box::new(FakeHandle::ready(ProviderId::new("meta")));
        engine.cache().put(
            CacheKey::shared(&AdUnitId::new("feed-native")),
            CachedAd::new(handle, ProviderId::new("meta")),
        );

        let decision = engine.request(&slot, false).await.unwrap();
        assert!(matches!(decision, Decision::Ready { from_cache: true, .. }));
    }

    #[tokio::test]
    async fn fresh_failure_falls_back_to_cache() {
        let provider = Arc::new(FakeProvider::failing("admob", LoadError::NoFill));
        let engine = engine_for(
            AdFormat::AppOpen,
            FormatConfig::new(LoadingStrategy::FreshWithCacheFallback)
                .with_provider("admob", "unit-open")
                .with_max_attempts(1),
            vec![Arc::clone(&provider)],
        );
        let slot = slot_key(AdFormat::AppOpen, "cold-start");
        seed_cache(&engine, &slot, "applovin");

        let decision = engine.request(&slot, false).await.unwrap();
        assert_eq!(
            decision,
            Decision::Ready {
                provider: ProviderId::new("applovin"),
                from_cache: true,
                attempts: 0,
            }
        );
        assert_eq!(provider.load_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_fresh_load_times_out_into_cache_fallback() {
        let provider = Arc::new(
            FakeProvider::filling("admob").with_delay(Duration::from_secs(60)),
        );
        let engine = engine_for(
            AdFormat::AppOpen,
            FormatConfig::new(LoadingStrategy::FreshWithCacheFallback)
                .with_provider("admob", "unit-open")
                .with_max_attempts(1)
                .with_fresh_timeout(Duration::from_millis(800)),
            vec![Arc::clone(&provider)],
        );
        let slot = slot_key(AdFormat::AppOpen, "cold-start");
        seed_cache(&engine, &slot, "applovin");

        let decision = engine.request(&slot, false).await.unwrap();
        assert!(matches!(decision, Decision::Ready { from_cache: true, .. }));
        assert_eq!(provider.load_calls(), 1);
    }

    #[tokio::test]
    async fn fresh_failure_without_cache_fails_the_slot() {
        let provider = Arc::new(FakeProvider::failing("admob", LoadError::NoFill));
        let engine = engine_for(
            AdFormat::AppOpen,
            FormatConfig::new(LoadingStrategy::FreshWithCacheFallback)
                .with_provider("admob", "unit-open")
                .with_max_attempts(1),
            vec![provider],
        );
        let slot = slot_key(AdFormat::AppOpen, "cold-start");

        let err = engine.request(&slot, false).await.unwrap_err();
        assert!(matches!(err, AdError::WaterfallExhausted { .. }));
        assert_eq!(engine.slot_state(&slot), Some(SlotState::Failed));
    }

    #[tokio::test]
    async fn every_nth_gate_follows_the_cadence() {
        let provider = Arc::new(FakeProvider::filling("admob"));
        let engine = engine_for(
            AdFormat::Interstitial,
            FormatConfig::new(LoadingStrategy::OnDemand)
                .with_provider("admob", "unit-int")
                .with_frequency(FrequencyPolicy::new().with_every_nth(3)),
            vec![Arc::clone(&provider)],
        );
        let slot = slot_key(AdFormat::Interstitial, "level-end");

        for _ in 0..2 {
            assert_eq!(
                engine.request(&slot, false).await.unwrap(),
                Decision::Skipped(SkipReason::EveryNth)
            );
        }
        assert!(matches!(
            engine.request(&slot, false).await.unwrap(),
            Decision::Ready { .. }
        ));
        assert_eq!(provider.load_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn force_bypasses_min_interval_but_not_max_shows() {
        let provider = Arc::new(FakeProvider::filling("admob"));
        let engine = engine_for(
            AdFormat::Interstitial,
            FormatConfig::new(LoadingStrategy::OnDemand)
                .with_provider("admob", "unit-int")
                .with_frequency(
                    FrequencyPolicy::new()
                        .with_min_interval(Duration::from_secs(60))
                        .with_max_shows(2),
                ),
            vec![provider],
        );
        let slot = slot_key(AdFormat::Interstitial, "level-end");

        engine.request(&slot, false).await.unwrap();
        engine.show(&slot, &DisplayToken::new(1)).await.unwrap();
        engine.on_shown(&slot);

        // Within the interval: a normal request is gated, a forced one is not.
        assert_eq!(
            engine.request(&slot, false).await.unwrap(),
            Decision::Skipped(SkipReason::MinInterval)
        );
        assert!(matches!(
            engine.request(&slot, true).await.unwrap(),
            Decision::Ready { .. }
        ));
        engine.show(&slot, &DisplayToken::new(2)).await.unwrap();
        engine.on_shown(&slot);

        // The lifetime cap holds even when forced.
        assert_eq!(
            engine.request(&slot, true).await.unwrap(),
            Decision::Skipped(SkipReason::MaxShows)
        );
    }

    #[tokio::test]
    async fn show_emits_session_and_records_the_display() {
        let provider = Arc::new(FakeProvider::filling("admob"));
        let engine = engine_for(
            AdFormat::Rewarded,
            FormatConfig::new(LoadingStrategy::OnDemand).with_provider("admob", "unit-reward"),
            vec![Arc::clone(&provider)],
        );
        let slot = slot_key(AdFormat::Rewarded, "spin-wheel");

        engine.request(&slot, false).await.unwrap();
        let mut session = engine.show(&slot, &DisplayToken::new(7)).await.unwrap();
        assert_eq!(session.next_event().await, Some(ShowEvent::Impression));
        assert_eq!(engine.slot_state(&slot), Some(SlotState::Shown));
        assert_eq!(engine.gate().counts(&slot).1, 1);

        engine.on_shown(&slot);
        assert_eq!(engine.slot_state(&slot), Some(SlotState::Idle));
        let watches = provider.created_handles().await;
        assert!(watches[0].was_destroyed());
    }

    #[tokio::test]
    async fn show_without_a_ready_ad_is_rejected() {
        let engine = engine_for(
            AdFormat::Rewarded,
            FormatConfig::new(LoadingStrategy::OnDemand),
            vec![],
        );
        let slot = slot_key(AdFormat::Rewarded, "spin-wheel");

        let err = engine.show(&slot, &DisplayToken::new(1)).await.unwrap_err();
        assert!(matches!(err, AdError::NotReady { .. }));
    }

    #[tokio::test]
    async fn request_while_showing_is_rejected() {
        let engine = engine_for(
            AdFormat::Interstitial,
            FormatConfig::new(LoadingStrategy::OnDemand).with_provider("admob", "unit-int"),
            vec![Arc::new(FakeProvider::filling("admob"))],
        );
        let slot = slot_key(AdFormat::Interstitial, "level-end");

        engine.request(&slot, false).await.unwrap();
        engine.show(&slot, &DisplayToken::new(1)).await.unwrap();

        let err = engine.request(&slot, false).await.unwrap_err();
        assert_eq!(err, AdError::Show(ShowError::AlreadyShowing));
    }

    #[tokio::test]
    async fn failed_show_fails_the_slot_and_destroys_the_ad() {
        let registry = Arc::new(ProviderRegistry::new());
        let engine = AdEngine::new(
            AdEngineConfig::new().with_format(
                AdFormat::Interstitial,
                FormatConfig::new(LoadingStrategy::OnlyCache),
            ),
            registry,
        )
        .unwrap();
        let slot = slot_key(AdFormat::Interstitial, "level-end");

        let handle = FakeHandle::failing_show(
            ProviderId::new("admob"),
            ShowError::Internal("sdk crash".into()),
        );
        let watch = handle.watch();
        engine.cache().put(
            AdEngine::cache_key(&slot),
            CachedAd::new(Box::new(handle), ProviderId::new("admob")),
        );

        engine.request(&slot, false).await.unwrap();
        let err = engine.show(&slot, &DisplayToken::new(1)).await.unwrap_err();
        assert_eq!(err, AdError::Show(ShowError::Internal("sdk crash".into())));
        assert_eq!(engine.slot_state(&slot), Some(SlotState::Failed));
        assert!(watch.was_destroyed());
    }

    #[tokio::test]
    async fn repeated_request_returns_the_held_ad() {
        let provider = Arc::new(FakeProvider::filling("admob"));
        let engine = engine_for(
            AdFormat::Banner,
            FormatConfig::new(LoadingStrategy::OnDemand).with_provider("admob", "unit-banner"),
            vec![Arc::clone(&provider)],
        );
        let slot = slot_key(AdFormat::Banner, "home-banner");

        let first = engine.request(&slot, false).await.unwrap();
        let second = engine.request(&slot, false).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.load_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_during_backoff_cancels_the_retry() {
        let provider = Arc::new(FakeProvider::scripted(
            "admob",
            vec![LoadOutcome::Fail(LoadError::Network("socket reset".into()))],
        ));
        let engine = Arc::new(engine_for(
            AdFormat::Interstitial,
            FormatConfig::new(LoadingStrategy::OnDemand)
                .with_provider("admob", "unit-int")
                .with_max_attempts(3),
            vec![Arc::clone(&provider)],
        ));
        let slot = slot_key(AdFormat::Interstitial, "level-end");

        let task = tokio::spawn({
            let engine = Arc::clone(&engine);
            let slot = slot.clone();
            async move { engine.request(&slot, false).await }
        });
        // Let the first attempt fail and park in its backoff wait.
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert_eq!(provider.load_calls(), 1);

        engine.on_destroyed(&slot).await;
        let result = task.await.unwrap();
        assert_eq!(result.unwrap_err(), AdError::Load(LoadError::Cancelled));
        assert_eq!(provider.load_calls(), 1);
        assert_eq!(engine.slot_state(&slot), Some(SlotState::Destroyed));
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_during_flight_discards_the_late_fill() {
        let provider = Arc::new(
            FakeProvider::filling("admob").with_delay(Duration::from_secs(5)),
        );
        let engine = Arc::new(engine_for(
            AdFormat::Interstitial,
            FormatConfig::new(LoadingStrategy::OnDemand).with_provider("admob", "unit-int"),
            vec![Arc::clone(&provider)],
        ));
        let slot = slot_key(AdFormat::Interstitial, "level-end");

        let task = tokio::spawn({
            let engine = Arc::clone(&engine);
            let slot = slot.clone();
            async move { engine.request(&slot, false).await }
        });
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert_eq!(provider.load_calls(), 1);

        engine.on_destroyed(&slot).await;
        tokio::time::advance(Duration::from_secs(5)).await;

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, AdError::SlotDestroyed { .. }));
        let watches = provider.created_handles().await;
        assert!(watches[0].was_destroyed());
    }

    #[tokio::test]
    async fn destroyed_ready_ad_is_returned_to_cache_when_strategy_allows() {
        let provider = Arc::new(FakeProvider::filling("admob"));
        let engine = engine_for(
            AdFormat::AppOpen,
            FormatConfig::new(LoadingStrategy::FreshWithCacheFallback)
                .with_provider("admob", "unit-open"),
            vec![Arc::clone(&provider)],
        );
        let slot = slot_key(AdFormat::AppOpen, "cold-start");

        engine.request(&slot, false).await.unwrap();
        engine.on_destroyed(&slot).await;

        // The unshown ad went back to the cache rather than being destroyed.
        let watches = provider.created_handles().await;
        assert!(!watches[0].was_destroyed());
        let cached = engine.cache().get(&slot.ad_unit, None).unwrap();
        assert_eq!(cached.provider, ProviderId::new("admob"));
    }

    #[tokio::test]
    async fn destroyed_ready_ad_is_dropped_under_on_demand() {
        let provider = Arc::new(FakeProvider::filling("admob"));
        let engine = engine_for(
            AdFormat::Banner,
            FormatConfig::new(LoadingStrategy::OnDemand).with_provider("admob", "unit-banner"),
            vec![Arc::clone(&provider)],
        );
        let slot = slot_key(AdFormat::Banner, "home-banner");

        engine.request(&slot, false).await.unwrap();
        engine.on_destroyed(&slot).await;

        let watches = provider.created_handles().await;
        assert!(watches[0].was_destroyed());
        assert!(engine.cache().get(&slot.ad_unit, None).is_none());
    }

    #[tokio::test]
    async fn pool_serves_preloaded_ads_without_new_loads() {
        let provider = Arc::new(FakeProvider::filling("admob"));
        let engine = engine_for(
            AdFormat::Interstitial,
            FormatConfig::new(LoadingStrategy::OnDemand)
                .with_provider("admob", "ignored")
                .with_pool_units([AdUnitId::new("pool-1"), AdUnitId::new("pool-2")]),
            vec![Arc::clone(&provider)],
        );

        assert_eq!(engine.replenish_pool(AdFormat::Interstitial).await.unwrap(), 2);
        assert_eq!(
            provider.requested_units().await,
            vec![AdUnitId::new("pool-1"), AdUnitId::new("pool-2")]
        );

        let slot = slot_key(AdFormat::Interstitial, "level-end");
        let decision = engine.request(&slot, false).await.unwrap();
        assert!(matches!(decision, Decision::Ready { from_cache: false, .. }));
        // Served from the pool: no additional provider load.
        assert_eq!(provider.load_calls(), 2);
        assert_eq!(
            engine.pool(AdFormat::Interstitial).unwrap().ready_count().await,
            1
        );
    }

    #[tokio::test]
    async fn empty_pool_loads_directly_with_the_pool_unit() {
        let provider = Arc::new(FakeProvider::filling("admob"));
        let engine = engine_for(
            AdFormat::Interstitial,
            FormatConfig::new(LoadingStrategy::OnDemand)
                .with_provider("admob", "ignored")
                .with_pool_units([AdUnitId::new("pool-1")]),
            vec![Arc::clone(&provider)],
        );
        let slot = slot_key(AdFormat::Interstitial, "level-end");

        let decision = engine.request(&slot, false).await.unwrap();
        assert!(matches!(decision, Decision::Ready { .. }));
        // The waterfall loaded the pool's unit, not the chain mapping.
        assert_eq!(provider.requested_units().await, vec![AdUnitId::new("pool-1")]);

        let stats = engine.pool(AdFormat::Interstitial).unwrap().stats().await;
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.fills, 1);
        assert_eq!(stats.ready, 0);
    }

    #[tokio::test]
    async fn pool_with_no_loadable_units_reports_exhaustion() {
        let provider = Arc::new(FakeProvider::filling("admob"));
        let engine = engine_for(
            AdFormat::Interstitial,
            FormatConfig::new(LoadingStrategy::OnDemand)
                .with_provider("admob", "ignored")
                .with_pool_units([AdUnitId::new("pool-1")]),
            vec![provider],
        );
        engine
            .pool(AdFormat::Interstitial)
            .unwrap()
            .breaker()
            .force_open(&AdUnitId::new("pool-1"))
            .await;

        let err = engine
            .request(&slot_key(AdFormat::Interstitial, "level-end"), false)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AdError::PoolExhausted {
                format: "interstitial".to_string()
            }
        );
    }

    #[tokio::test]
    async fn pool_impressions_flow_into_show_rate() {
        let provider = Arc::new(FakeProvider::filling("admob"));
        let engine = engine_for(
            AdFormat::Interstitial,
            FormatConfig::new(LoadingStrategy::OnDemand)
                .with_provider("admob", "ignored")
                .with_pool_units([AdUnitId::new("pool-1")]),
            vec![provider],
        );
        let slot = slot_key(AdFormat::Interstitial, "level-end");

        engine.replenish_pool(AdFormat::Interstitial).await.unwrap();
        engine.request(&slot, false).await.unwrap();
        engine.show(&slot, &DisplayToken::new(1)).await.unwrap();

        let stats = engine.pool(AdFormat::Interstitial).unwrap().stats().await;
        assert_eq!(stats.impressions, 1);
        assert!((stats.show_rate - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn warm_cache_fills_keys_for_later_cache_reads() {
        let provider = Arc::new(FakeProvider::filling("admob"));
        let engine = engine_for(
            AdFormat::Banner,
            FormatConfig::new(LoadingStrategy::OnlyCache).with_provider("admob", "unit-banner"),
            vec![Arc::clone(&provider)],
        );
        let slot = slot_key(AdFormat::Banner, "home-banner");

        let report = engine.warm_cache(std::slice::from_ref(&slot)).await;
        assert_eq!(report.warmed, 1);
        assert_eq!(report.failed, 0);

        let decision = engine.request(&slot, false).await.unwrap();
        assert!(matches!(decision, Decision::Ready { from_cache: true, .. }));
        assert_eq!(provider.load_calls(), 1);
    }

    #[tokio::test]
    async fn validation_rejects_cache_only_native() {
        let config = AdEngineConfig::new().with_format(
            AdFormat::Native,
            FormatConfig::new(LoadingStrategy::OnlyCache),
        );
        let err = AdEngine::new(config, Arc::new(ProviderRegistry::new())).unwrap_err();
        assert_eq!(
            err,
            AdError::UnsupportedStrategy {
                strategy: "only_cache".to_string(),
                format: "native".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn validation_rejects_zero_attempt_budget() {
        let config = AdEngineConfig::new().with_format(
            AdFormat::Banner,
            FormatConfig::new(LoadingStrategy::OnDemand).with_max_attempts(0),
        );
        let err = AdEngine::new(config, Arc::new(ProviderRegistry::new())).unwrap_err();
        assert!(matches!(err, AdError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn stats_expose_the_request_counters() {
        let provider = Arc::new(FakeProvider::filling("admob"));
        let engine = engine_for(
            AdFormat::Banner,
            FormatConfig::new(LoadingStrategy::OnDemand).with_provider("admob", "unit-banner"),
            vec![provider],
        );
        let slot = slot_key(AdFormat::Banner, "home-banner");

        engine.request(&slot, false).await.unwrap();
        engine.show(&slot, &DisplayToken::new(1)).await.unwrap();

        let stats = engine.stats().await;
        assert_eq!(stats.formats.len(), 1);
        assert_eq!(stats.formats[0].requests, 1);
        assert_eq!(stats.formats[0].served_fresh, 1);
        assert_eq!(stats.formats[0].shows, 1);

        let json = engine.export_debug_info().await.unwrap();
        assert_eq!(json["formats"][0]["format"], "banner");
        assert!(json["cache"].is_object());
    }

    #[tokio::test]
    async fn failed_requests_count_into_stats() {
        let provider = Arc::new(FakeProvider::failing("admob", LoadError::NoFill));
        let engine = engine_for(
            AdFormat::Banner,
            FormatConfig::new(LoadingStrategy::OnDemand)
                .with_provider("admob", "unit-banner")
                .with_max_attempts(1),
            vec![provider],
        );
        let slot = slot_key(AdFormat::Banner, "home-banner");

        let _ = engine.request(&slot, false).await;
        let _ = engine.request(&slot, false).await;

        let stats = engine.stats().await;
        assert_eq!(stats.formats[0].requests, 2);
        assert_eq!(stats.formats[0].failures, 2);
    }
}
