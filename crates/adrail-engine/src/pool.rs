//! Preloaded ad pools with breaker-aware refill.
//!
//! A pool keeps one slot per configured ad unit so full-screen formats can
//! serve instantly from memory. Slots move Idle -> Loading -> Ready, are
//! consumed on take, and return to Idle until the next refill pass. Units
//! whose loads keep failing cool down behind a per-unit circuit breaker and
//! are skipped when picking the next slot to refill.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use adrail_resilience::{CircuitBreaker, CircuitBreakerConfig};
use adrail_traits::{AdHandle, AdUnitId};

/// Lifecycle of one pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolSlotState {
    /// No ad held and no load in flight
    Idle,
    /// A refill load is in flight
    Loading,
    /// A loaded ad is waiting to be taken
    Ready,
    /// The last load failed; eligible again once the breaker allows
    Failed,
}

struct PoolEntry {
    ad_unit: AdUnitId,
    state: PoolSlotState,
    handle: Option<Box<dyn AdHandle>>,
}

impl fmt::Debug for PoolEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEntry")
            .field("ad_unit", &self.ad_unit)
            .field("state", &self.state)
            .field("has_handle", &self.handle.is_some())
            .finish()
    }
}

/// Counters and derived rates for one pool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoolStats {
    /// Load dispatches into the pool
    pub requests: u64,
    /// Loads that produced an ad
    pub fills: u64,
    /// Pool ads that reached the screen
    pub impressions: u64,
    /// Slots currently holding a ready ad
    pub ready: usize,
    /// fills / requests, 0 when nothing was requested yet
    pub fill_rate: f64,
    /// impressions / fills, 0 when nothing filled yet
    pub show_rate: f64,
}

/// Fixed set of ad unit slots served in registration order.
///
/// The pool never loads by itself; callers pick a unit with
/// [`next_loadable`](AdPool::next_loadable), run the load, and report the
/// outcome with [`mark_ready`](AdPool::mark_ready) or
/// [`mark_failed`](AdPool::mark_failed).
#[derive(Debug)]
pub struct AdPool {
    entries: Mutex<Vec<PoolEntry>>,
    breaker: CircuitBreaker<AdUnitId>,
    requests: AtomicU64,
    fills: AtomicU64,
    impressions: AtomicU64,
}

impl AdPool {
    /// Creates a pool over `units`, duplicates removed, order preserved.
    pub fn new(units: impl IntoIterator<Item = AdUnitId>, breaker: CircuitBreakerConfig) -> Self {
        let mut entries: Vec<PoolEntry> = Vec::new();
        for ad_unit in units {
            if entries.iter().any(|e| e.ad_unit == ad_unit) {
                continue;
            }
            entries.push(PoolEntry {
                ad_unit,
                state: PoolSlotState::Idle,
                handle: None,
            });
        }
        Self {
            entries: Mutex::new(entries),
            breaker: CircuitBreaker::new(breaker),
            requests: AtomicU64::new(0),
            fills: AtomicU64::new(0),
            impressions: AtomicU64::new(0),
        }
    }

    /// Adds a unit slot; returns false if the unit is already registered.
    pub async fn register(&self, ad_unit: AdUnitId) -> bool {
        let mut entries = self.entries.lock().await;
        if entries.iter().any(|e| e.ad_unit == ad_unit) {
            return false;
        }
        entries.push(PoolEntry {
            ad_unit,
            state: PoolSlotState::Idle,
            handle: None,
        });
        true
    }

    /// Takes the first ready ad in registration order, if any.
    ///
    /// Taking consumes the slot: it returns to Idle and will only serve again
    /// after a refill. Ads that went stale while pooled are destroyed on the
    /// way through instead of being served.
    pub async fn take_ready(&self) -> Option<(AdUnitId, Box<dyn AdHandle>)> {
        let mut entries = self.entries.lock().await;
        for entry in entries.iter_mut() {
            if entry.state != PoolSlotState::Ready {
                continue;
            }
            entry.state = PoolSlotState::Idle;
            match entry.handle.take() {
                Some(handle) if handle.is_ready() => {
                    debug!(ad_unit = %entry.ad_unit, "pool serve");
                    return Some((entry.ad_unit.clone(), handle));
                }
                Some(mut stale) => {
                    warn!(ad_unit = %entry.ad_unit, "pooled ad went stale, dropping");
                    stale.destroy();
                }
                None => {}
            }
        }
        None
    }

    /// First unit in registration order that is refillable right now.
    ///
    /// A unit qualifies when its slot is Idle or Failed and its breaker is
    /// not open.
    pub async fn next_loadable(&self) -> Option<AdUnitId> {
        let mut entries = self.entries.lock().await;
        for entry in entries.iter_mut() {
            match entry.state {
                PoolSlotState::Idle | PoolSlotState::Failed => {}
                PoolSlotState::Loading | PoolSlotState::Ready => continue,
            }
            if self.breaker.is_open(&entry.ad_unit).await {
                debug!(ad_unit = %entry.ad_unit, "pool refill skipped, circuit open");
                continue;
            }
            return Some(entry.ad_unit.clone());
        }
        None
    }

    /// Claims `ad_unit` for a refill load and counts the request.
    ///
    /// Returns false when the unit is unknown or already Loading or Ready,
    /// in which case no request is counted.
    pub async fn mark_loading(&self, ad_unit: &AdUnitId) -> bool {
        let mut entries = self.entries.lock().await;
        let entry = match entries.iter_mut().find(|e| &e.ad_unit == ad_unit) {
            Some(entry) => entry,
            None => return false,
        };
        match entry.state {
            PoolSlotState::Idle | PoolSlotState::Failed => {
                entry.state = PoolSlotState::Loading;
                self.requests.fetch_add(1, Ordering::Relaxed);
                true
            }
            PoolSlotState::Loading | PoolSlotState::Ready => false,
        }
    }

    /// Stores a filled ad in its slot and records the success.
    ///
    /// A fill for an unregistered unit is destroyed and reported as false.
    pub async fn mark_ready(&self, ad_unit: &AdUnitId, mut handle: Box<dyn AdHandle>) -> bool {
        let mut entries = self.entries.lock().await;
        let entry = match entries.iter_mut().find(|e| &e.ad_unit == ad_unit) {
            Some(entry) => entry,
            None => {
                warn!(ad_unit = %ad_unit, "pool fill for unregistered unit, dropping");
                handle.destroy();
                return false;
            }
        };
        if let Some(mut stale) = entry.handle.take() {
            warn!(ad_unit = %ad_unit, "pool slot refilled while ready, dropping stale ad");
            stale.destroy();
        }
        entry.state = PoolSlotState::Ready;
        entry.handle = Some(handle);
        self.fills.fetch_add(1, Ordering::Relaxed);
        self.breaker.record_success(ad_unit).await;
        debug!(ad_unit = %ad_unit, "pool slot ready");
        true
    }

    /// Records a fill that was handed straight to the caller.
    ///
    /// The slot returns to Idle without storing a handle; fill accounting and
    /// breaker state advance exactly as for [`mark_ready`](AdPool::mark_ready).
    pub async fn record_fill(&self, ad_unit: &AdUnitId) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.iter_mut().find(|e| &e.ad_unit == ad_unit) {
            entry.state = PoolSlotState::Idle;
            self.fills.fetch_add(1, Ordering::Relaxed);
            self.breaker.record_success(ad_unit).await;
        }
    }

    /// Records a failed refill and trips the unit's breaker accounting.
    pub async fn mark_failed(&self, ad_unit: &AdUnitId) {
        let mut entries = self.entries.lock().await;
        let entry = match entries.iter_mut().find(|e| &e.ad_unit == ad_unit) {
            Some(entry) => entry,
            None => return,
        };
        if let Some(mut stale) = entry.handle.take() {
            stale.destroy();
        }
        entry.state = PoolSlotState::Failed;
        self.breaker.record_failure(ad_unit).await;
        debug!(ad_unit = %ad_unit, "pool load failed");
    }

    /// Counts an impression for an ad that came from this pool.
    pub fn record_impression(&self) {
        self.impressions.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of slots currently holding a ready ad
    pub async fn ready_count(&self) -> usize {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .filter(|e| e.state == PoolSlotState::Ready && e.handle.is_some())
            .count()
    }

    /// Registered units in registration order
    pub async fn units(&self) -> Vec<AdUnitId> {
        let entries = self.entries.lock().await;
        entries.iter().map(|e| e.ad_unit.clone()).collect()
    }

    /// Number of registered unit slots
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// True when no units are registered
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// The per-unit circuit breaker guarding refills
    pub fn breaker(&self) -> &CircuitBreaker<AdUnitId> {
        &self.breaker
    }

    /// Counters and rates snapshot
    pub async fn stats(&self) -> PoolStats {
        let ready = self.ready_count().await;
        let requests = self.requests.load(Ordering::Relaxed);
        let fills = self.fills.load(Ordering::Relaxed);
        let impressions = self.impressions.load(Ordering::Relaxed);
        PoolStats {
            requests,
            fills,
            impressions,
            ready,
            fill_rate: ratio(fills, requests),
            show_rate: ratio(impressions, fills),
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}
