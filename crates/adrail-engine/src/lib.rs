//! # AdRail Engine
//!
//! The loading engine that ties the AdRail SDK together.
//!
//! Given a set of [`AdProvider`](adrail_traits::AdProvider) implementations
//! and a per-format [`FormatConfig`], the engine answers one question for the
//! app: "give me an ad for this slot, or tell me why not". Behind that call
//! it runs:
//!
//! - **Loading strategies**: cache-first, fresh-first, or cache-only per format
//! - **Provider waterfall**: priority-ordered chain with per-pair circuit breaking
//! - **Transparent retries**: exponential backoff inside a single `request` call
//! - **Frequency capping**: every-Nth, max-shows and min-interval gates per slot
//! - **Ad pools**: preloaded inventory served before any network round trip
//!
//! ## Quick Start
//!
//! Configuration is plain data and builds without a runtime:
//!
//! ```rust
//! use adrail_engine::{AdEngineConfig, FormatConfig, LoadingStrategy};
//! use adrail_traits::AdFormat;
//!
//! let config = AdEngineConfig::new().with_format(
//!     AdFormat::Interstitial,
//!     FormatConfig::new(LoadingStrategy::Hybrid)
//!         .with_provider("admob", "ca-app-pub-1/inter-main")
//!         .with_provider("unity", "unity-inter-main")
//!         .with_max_attempts(2),
//! );
//!
//! assert!(config.validate().is_ok());
//! ```
//!
//! Driving the engine needs registered providers and a Tokio runtime:
//!
//! ```rust,ignore
//! use adrail_engine::{AdEngine, Decision, ProviderRegistry};
//! use adrail_traits::{AdFormat, AdSlotKey, AdUnitId, DisplayToken};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(ProviderRegistry::new());
//! registry.register(Arc::new(my_admob_adapter));
//!
//! let engine = AdEngine::new(config, registry)?;
//! let slot = AdSlotKey::new(AdFormat::Interstitial, AdUnitId::new("ca-app-pub-1/inter-main"));
//!
//! match engine.request(&slot, false).await? {
//!     Decision::Ready { provider, from_cache, .. } => {
//!         let mut session = engine.show(&slot, &DisplayToken::new(1)).await?;
//!         while let Some(event) = session.next_event().await { /* impressions, revenue */ }
//!         engine.on_shown(&slot);
//!     }
//!     Decision::Skipped(reason) => {
//!         // Frequency gate or empty cache; nothing to show this time
//!     }
//! }
//! ```
//!
//! ## Strategy Semantics
//!
//! | Strategy | Cache read | Fresh load | On fresh failure |
//! |----------|-----------|------------|------------------|
//! | `OnDemand` | no | yes | error |
//! | `OnlyCache` | yes | no | n/a |
//! | `Hybrid` | yes | on miss | error |
//! | `FreshWithCacheFallback` | no | yes | cache fallback |
//!
//! One structural restriction is enforced at [`AdEngineConfig::validate`]:
//! native ads cannot use `OnlyCache`, because a native assets view rendered
//! from a stale cached response has no paint-time fallback.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod engine;
pub mod frequency;
pub mod pool;
pub mod registry;
pub mod stats;
pub mod strategy;
pub mod waterfall;

// Re-export main types
pub use engine::{
    AdEngine, AdEngineConfig, Decision, FormatConfig, SkipReason, SlotState, DEFAULT_MAX_ATTEMPTS,
};

pub use frequency::{FrequencyGate, FrequencyPolicy, GateDecision, GateSnapshot};

pub use pool::{AdPool, PoolSlotState, PoolStats};

pub use registry::ProviderRegistry;

pub use stats::{EngineStats, FormatCounters, FormatStats, PoolSnapshot};

pub use strategy::{resolve_effective_config, EffectiveConfig, LoadingStrategy};

pub use waterfall::{BreakerKey, ProviderWaterfall, WaterfallWin};
