//! Loading strategies and their effective behavior.
//!
//! A strategy is configured per ad format. Resolving one is a pure function
//! so the mapping stays testable as a table, with no clock or state behind
//! it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a format acquires its inventory on each request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadingStrategy {
    /// Always load fresh; the cache is never consulted or filled
    OnDemand,
    /// Serve only from cache; a miss is a silent skip, never an error
    OnlyCache,
    /// Serve from cache when possible, otherwise load fresh for this call
    Hybrid,
    /// Load fresh, fall back to cache on failure or timeout
    FreshWithCacheFallback,
}

impl LoadingStrategy {
    /// Stable lowercase name, as used in configuration and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadingStrategy::OnDemand => "on_demand",
            LoadingStrategy::OnlyCache => "only_cache",
            LoadingStrategy::Hybrid => "hybrid",
            LoadingStrategy::FreshWithCacheFallback => "fresh_with_cache_fallback",
        }
    }
}

impl fmt::Display for LoadingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The concrete behavior a strategy resolves to for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveConfig {
    /// Consult the cache before any load
    pub read_cache_first: bool,
    /// Dispatch a fresh load (always, or on cache miss)
    pub load_fresh: bool,
    /// On fresh-load failure or timeout, serve a cached entry instead
    pub cache_fallback_on_failure: bool,
    /// Fresh wins that are not shown immediately may be cached for later
    pub opportunistic_cache_fill: bool,
}

/// Resolves a strategy to its effective per-request behavior
pub fn resolve_effective_config(strategy: LoadingStrategy) -> EffectiveConfig {
    match strategy {
        LoadingStrategy::OnDemand => EffectiveConfig {
            read_cache_first: false,
            load_fresh: true,
            cache_fallback_on_failure: false,
            opportunistic_cache_fill: false,
        },
        LoadingStrategy::OnlyCache => EffectiveConfig {
            read_cache_first: true,
            load_fresh: false,
            cache_fallback_on_failure: false,
            opportunistic_cache_fill: false,
        },
        LoadingStrategy::Hybrid => EffectiveConfig {
            read_cache_first: true,
            load_fresh: true,
            cache_fallback_on_failure: false,
            opportunistic_cache_fill: false,
        },
        LoadingStrategy::FreshWithCacheFallback => EffectiveConfig {
            read_cache_first: false,
            load_fresh: true,
            cache_fallback_on_failure: true,
            opportunistic_cache_fill: true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_on_demand_ignores_cache() {
        let effective = resolve_effective_config(LoadingStrategy::OnDemand);
        assert!(!effective.read_cache_first);
        assert!(effective.load_fresh);
        assert!(!effective.cache_fallback_on_failure);
        assert!(!effective.opportunistic_cache_fill);
    }

    #[test]
    fn test_only_cache_never_loads() {
        let effective = resolve_effective_config(LoadingStrategy::OnlyCache);
        assert!(effective.read_cache_first);
        assert!(!effective.load_fresh);
        assert!(!effective.cache_fallback_on_failure);
        assert!(!effective.opportunistic_cache_fill);
    }

    #[test]
    fn test_hybrid_reads_cache_then_loads() {
        let effective = resolve_effective_config(LoadingStrategy::Hybrid);
        assert!(effective.read_cache_first);
        assert!(effective.load_fresh);
        assert!(!effective.cache_fallback_on_failure);
        assert!(!effective.opportunistic_cache_fill);
    }

    #[test]
    fn test_fresh_with_fallback_skips_cache_read() {
        let effective = resolve_effective_config(LoadingStrategy::FreshWithCacheFallback);
        assert!(!effective.read_cache_first);
        assert!(effective.load_fresh);
        assert!(effective.cache_fallback_on_failure);
        assert!(effective.opportunistic_cache_fill);
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(LoadingStrategy::OnDemand.as_str(), "on_demand");
        assert_eq!(LoadingStrategy::OnlyCache.as_str(), "only_cache");
        assert_eq!(LoadingStrategy::Hybrid.as_str(), "hybrid");
        assert_eq!(
            LoadingStrategy::FreshWithCacheFallback.as_str(),
            "fresh_with_cache_fallback"
        );
    }

    #[test]
    fn test_strategy_serde_round_trip() {
        let json = serde_json::to_string(&LoadingStrategy::FreshWithCacheFallback).unwrap();
        assert_eq!(json, "\"fresh_with_cache_fallback\"");
        let back: LoadingStrategy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, LoadingStrategy::FreshWithCacheFallback);
    }
}
