//! # AdRail - Client-Side Ad Loading SDK
//!
//! AdRail keeps ads flowing when networks flake: loading strategies, a
//! TTL-bounded ad cache, circuit-broken provider waterfalls, transparent
//! retries, preloaded pools and frequency capping behind one `request` call.
//! Use feature flags to include only the components you need.
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `default` | The full loading engine |
//! | `core` | Slot and unit identifiers, provider traits, error types |
//! | `resilience` | Circuit breaker, exponential backoff, retry scheduling |
//! | `cache` | TTL and capacity bounded ad cache |
//! | `engine` | Strategies, waterfall, pools and frequency capping |
//! | `testing` | Fake providers and proptest strategies |
//! | `full` | Engine + testing |
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! # The whole engine
//! adrail = "0.1"
//!
//! # Just the resilience primitives
//! adrail = { version = "0.1", default-features = false, features = ["resilience"] }
//!
//! # Everything, fakes included
//! adrail = { version = "0.1", features = ["full"] }
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use adrail::prelude::*;
//! use adrail::engine::{AdEngine, ProviderRegistry};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(ProviderRegistry::new());
//! registry.register(Arc::new(my_mediation_adapter));
//!
//! let engine = AdEngine::new(config, registry)?;
//! let decision = engine.request(&slot, false).await?;
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]
#![warn(missing_docs)]

// ============================================================================
// Core re-exports (always available with any component)
// ============================================================================

#[cfg(feature = "core")]
#[cfg_attr(docsrs, doc(cfg(feature = "core")))]
pub use adrail_error as error;

#[cfg(feature = "core")]
#[cfg_attr(docsrs, doc(cfg(feature = "core")))]
pub use adrail_traits as traits;

// ============================================================================
// Component re-exports
// ============================================================================

/// Circuit breaker, backoff and retry scheduling
#[cfg(feature = "resilience")]
#[cfg_attr(docsrs, doc(cfg(feature = "resilience")))]
pub mod resilience {
    pub use adrail_resilience::*;
}

/// TTL and capacity bounded ad cache
#[cfg(feature = "cache")]
#[cfg_attr(docsrs, doc(cfg(feature = "cache")))]
pub mod cache {
    pub use adrail_cache::*;
}

/// Strategy-aware loading engine
#[cfg(feature = "engine")]
#[cfg_attr(docsrs, doc(cfg(feature = "engine")))]
pub mod engine {
    pub use adrail_engine::*;
}

/// Fake providers and proptest strategies
#[cfg(feature = "testing")]
#[cfg_attr(docsrs, doc(cfg(feature = "testing")))]
pub mod testing {
    pub use adrail_testing::*;
}

// ============================================================================
// Prelude - commonly used types
// ============================================================================

/// Prelude module for convenient imports
///
/// ```ignore
/// use adrail::prelude::*;
/// ```
pub mod prelude {
    #[cfg(feature = "core")]
    pub use adrail_traits::prelude::*;

    #[cfg(feature = "engine")]
    pub use adrail_engine::{
        AdEngine, AdEngineConfig, Decision, FormatConfig, LoadingStrategy, ProviderRegistry,
    };
}

// ============================================================================
// Version information
// ============================================================================

/// Returns the AdRail SDK version
pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Returns enabled component features as a vec
pub fn enabled_components() -> Vec<&'static str> {
    #[allow(unused_mut)]
    let mut components = Vec::new();

    #[cfg(feature = "resilience")]
    components.push("resilience");

    #[cfg(feature = "cache")]
    components.push("cache");

    #[cfg(feature = "engine")]
    components.push("engine");

    #[cfg(feature = "testing")]
    components.push("testing");

    components
}

// ============================================================================
// Tests
// ============================================================================
