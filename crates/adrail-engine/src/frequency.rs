//! Show-frequency capping.
//!
//! Placements can be throttled three ways: an every-Nth cadence, a lifetime
//! show cap, and a minimum interval between shows. Checks run in that fixed
//! order and the first failing check wins. A caller-supplied force flag
//! bypasses the minimum interval and nothing else.

use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

/// Per-placement limits on ad display
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrequencyPolicy {
    /// Allow only every Nth request through (counted per key)
    pub every_nth: Option<u32>,
    /// Lifetime cap on shows for this key
    pub max_shows: Option<u64>,
    /// Minimum time between two shows
    pub min_interval: Option<Duration>,
}

impl FrequencyPolicy {
    /// A policy with no limits; every check allows
    pub fn new() -> Self {
        Self::default()
    }

    /// Allows only every `n`th call through
    pub fn with_every_nth(mut self, n: u32) -> Self {
        self.every_nth = Some(n);
        self
    }

    /// Caps the total number of shows
    pub fn with_max_shows(mut self, max: u64) -> Self {
        self.max_shows = Some(max);
        self
    }

    /// Requires at least `interval` between shows
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = Some(interval);
        self
    }
}

/// Outcome of a gate check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GateDecision {
    /// The show may proceed
    Allow,
    /// This call is not the Nth in the cadence
    SkipEveryNth,
    /// The lifetime show cap is reached
    SkipMaxShows,
    /// The last show was too recent
    SkipMinInterval,
}

impl GateDecision {
    /// True when the decision permits showing
    pub fn is_allow(&self) -> bool {
        matches!(self, GateDecision::Allow)
    }
}

#[derive(Debug, Default)]
struct GateState {
    call_count: u64,
    total_shows: u64,
    last_show_at: Option<Instant>,
}

/// Per-key gate counters for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct GateSnapshot {
    /// The key, rendered for display
    pub key: String,
    /// Requests counted toward the cadence
    pub call_count: u64,
    /// Shows recorded so far
    pub total_shows: u64,
    /// Milliseconds since the last show, if any
    pub since_last_show_ms: Option<u64>,
}

/// Frequency gate with independent counters per key.
///
/// Counters live for the process lifetime; destroying a slot does not reset
/// them, so caps survive screen recreation.
#[derive(Debug)]
pub struct FrequencyGate<K: Eq + Hash> {
    states: DashMap<K, GateState>,
}

impl<K: Eq + Hash> Default for FrequencyGate<K> {
    fn default() -> Self {
        Self {
            states: DashMap::new(),
        }
    }
}

impl<K> FrequencyGate<K>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    /// Creates a gate with no recorded history
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
        }
    }

    /// Checks whether `key` may show under `policy`.
    ///
    /// The call itself is counted toward the every-Nth cadence, whether or
    /// not it is allowed. `force` bypasses only the min-interval check; the
    /// cadence and the lifetime cap always apply.
    pub fn should_show(&self, key: &K, policy: &FrequencyPolicy, force: bool) -> GateDecision {
        let mut state = self.states.entry(key.clone()).or_default();
        state.call_count += 1;

        if let Some(n) = policy.every_nth {
            if n > 0 && state.call_count % u64::from(n) != 0 {
                tracing::debug!(key = %key, call = state.call_count, n, "Skipped by every-nth cadence");
                return GateDecision::SkipEveryNth;
            }
        }

        if let Some(max) = policy.max_shows {
            if state.total_shows >= max {
                tracing::debug!(key = %key, shows = state.total_shows, max, "Skipped by show cap");
                return GateDecision::SkipMaxShows;
            }
        }

        if let Some(interval) = policy.min_interval {
            if let Some(last) = state.last_show_at {
                if last.elapsed() < interval {
                    if force {
                        tracing::debug!(key = %key, "Force flag bypassed min-interval check");
                    } else {
                        tracing::debug!(key = %key, "Skipped by min interval");
                        return GateDecision::SkipMinInterval;
                    }
                }
            }
        }

        GateDecision::Allow
    }

    /// Counts a request that never went through [`Self::should_show`].
    ///
    /// `should_show` already counts its own call; use this only for paths
    /// that bypass the gate but should still advance the cadence.
    pub fn record_call(&self, key: &K) {
        self.states.entry(key.clone()).or_default().call_count += 1;
    }

    /// Records an actual display.
    ///
    /// Call only after the ad really went on screen, not when a show was
    /// merely permitted.
    pub fn record_show(&self, key: &K) {
        let mut state = self.states.entry(key.clone()).or_default();
        state.total_shows += 1;
        state.last_show_at = Some(Instant::now());
    }

    /// Returns `(call_count, total_shows)` for a key
    pub fn counts(&self, key: &K) -> (u64, u64) {
        match self.states.get(key) {
            Some(state) => (state.call_count, state.total_shows),
            None => (0, 0),
        }
    }

    /// Counter snapshot across all keys, sorted by key
    pub fn snapshot(&self) -> Vec<GateSnapshot> {
        let mut all: Vec<GateSnapshot> = self
            .states
            .iter()
            .map(|entry| GateSnapshot {
                key: entry.key().to_string(),
                call_count: entry.call_count,
                total_shows: entry.total_shows,
                since_last_show_ms: entry
                    .last_show_at
                    .map(|at| at.elapsed().as_millis() as u64),
            })
            .collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }
}
