//! # Adrail Error
//!
//! This crate provides unified error types for the adrail ad-loading engine.
//! It consolidates error handling across the loading, caching, and display
//! layers into a consistent error hierarchy.
//!
//! ## Error Categories
//!
//! - [`AdError`] - Top-level error type
//! - [`LoadError`] - Provider load failures
//! - [`ShowError`] - Display-time failures
//!
//! Frequency-gate skips and cache misses are deliberately *not* errors; they
//! surface as non-error decisions in the engine layer.
//!
//! ## Example
//!
//! ```
//! use adrail_error::{AdError, Result};
//!
//! fn validate_capacity(max_per_unit: usize) -> Result<()> {
//!     if !(1..=3).contains(&max_per_unit) {
//!         return Err(AdError::InvalidConfig(format!(
//!             "max_per_unit must be between 1 and 3, got {max_per_unit}"
//!         )));
//!     }
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::time::Duration;

use thiserror::Error;

/// Failure reported by a provider while loading an ad.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// Transport-level failure between the provider SDK and its backend
    #[error("Network error: {0}")]
    Network(String),

    /// The provider responded but had no inventory for this request
    #[error("No fill")]
    NoFill,

    /// The ad unit identifier was rejected by the provider
    #[error("Invalid ad unit '{ad_unit}': {reason}")]
    InvalidAdUnit {
        /// The rejected ad unit identifier
        ad_unit: String,
        /// Reason reported by the provider
        reason: String,
    },

    /// A mediation partner in the provider's own chain failed
    #[error("Mediation error from {provider}: {message}")]
    Mediation {
        /// Provider that reported the failure
        provider: String,
        /// Error message from the mediation layer
        message: String,
    },

    /// Unclassified failure inside the provider
    #[error("Internal load error: {0}")]
    Internal(String),

    /// The load did not complete within the allowed time
    #[error("Load timed out after {elapsed_ms}ms")]
    Timeout {
        /// How long the load ran before being cut off
        elapsed_ms: u64,
    },

    /// The load was cancelled because its slot was destroyed
    #[error("Load cancelled")]
    Cancelled,
}

impl LoadError {
    /// Returns true if a later attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LoadError::Network(_)
                | LoadError::NoFill
                | LoadError::Mediation { .. }
                | LoadError::Timeout { .. }
        )
    }
}

/// Failure reported by a provider while showing a loaded ad.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShowError {
    /// Another full-screen ad is currently on screen
    #[error("An ad is already showing")]
    AlreadyShowing,

    /// The loaded ad expired before it could be shown
    #[error("Ad expired before it could be shown")]
    AdExpired,

    /// Unclassified failure inside the provider
    #[error("Internal show error: {0}")]
    Internal(String),
}

/// The main error type for adrail operations.
///
/// Covers everything the engine can surface to its caller. The surface is
/// deliberately narrow: only provider exhaustion, pool exhaustion,
/// configuration problems, and explicit timeouts reach the caller; gate
/// skips and cache misses degrade silently to a non-error decision.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdError {
    // ============ Load Errors ============
    /// A provider load failed
    #[error("Load failed: {0}")]
    Load(#[from] LoadError),

    // ============ Show Errors ============
    /// A provider show failed
    #[error("Show failed: {0}")]
    Show(#[from] ShowError),

    // ============ Circuit / Retry Errors ============
    /// The circuit for this resource is open; no attempt was made
    #[error("Circuit open for {resource}, retry after {retry_after_ms}ms")]
    CircuitOpen {
        /// Key the tripped circuit guards (provider, ad unit pair, ...)
        resource: String,
        /// Time until the circuit auto-closes
        retry_after_ms: u64,
    },

    /// Every provider in the chain was tried or skipped without a fill
    #[error("All providers failed after {attempts} attempts: {last}")]
    WaterfallExhausted {
        /// Number of providers actually attempted
        attempts: u32,
        /// The last concrete failure observed
        last: LoadError,
    },

    /// Every provider in the chain was skipped by an open circuit
    #[error("All provider circuits open, retry after {retry_after_ms}ms")]
    AllCircuitsOpen {
        /// Shortest time until some circuit auto-closes
        retry_after_ms: u64,
    },

    /// The transparent retry budget was spent without a successful load
    #[error("Load failed after {attempts} retries: {last}")]
    RetriesExhausted {
        /// Number of transparent retries consumed
        attempts: u32,
        /// The last concrete failure observed
        last: LoadError,
    },

    // ============ Pool Errors ============
    /// The ad pool has nothing ready and nothing loadable
    #[error("Ad pool exhausted for format {format}")]
    PoolExhausted {
        /// Format whose pool ran dry
        format: String,
    },

    // ============ Configuration Errors ============
    /// The provider chain for this format is empty
    #[error("No providers configured for format {format}")]
    NoProvidersConfigured {
        /// Format with the empty chain
        format: String,
    },

    /// No provider in the chain has an ad unit mapping
    #[error("No ad unit mapping for any provider in format {format}")]
    NoAdUnitMapping {
        /// Format whose chain had no usable mapping
        format: String,
    },

    /// The requested strategy is not available for this format
    #[error("Strategy {strategy} is not supported for format {format}")]
    UnsupportedStrategy {
        /// The rejected strategy
        strategy: String,
        /// Format it was configured for
        format: String,
    },

    /// A configuration value failed validation
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    // ============ Slot Lifecycle Errors ============
    /// A load is already in flight for this slot
    #[error("Load already in progress for slot {slot}")]
    AlreadyLoading {
        /// Slot with the in-flight load
        slot: String,
    },

    /// Show was requested but the slot holds no ready ad
    #[error("Slot {slot} has no ad ready to show")]
    NotReady {
        /// Slot that was asked to show
        slot: String,
    },

    /// The slot was destroyed while the operation was in flight
    #[error("Slot {slot} was destroyed")]
    SlotDestroyed {
        /// The destroyed slot
        slot: String,
    },

    // ============ Generic ============
    /// Unknown/other error
    #[error("{0}")]
    Other(String),

    /// Wrapped error from an external source
    #[error("External error: {message}")]
    External {
        /// Error message
        message: String,
    },
}

/// Convenient Result type using AdError
pub type Result<T> = std::result::Result<T, AdError>;

/// Extension trait for adding context to errors
pub trait ErrorContext<T> {
    /// Adds context to an error
    fn context(self, ctx: impl Into<String>) -> Result<T>;

    /// Adds context using a closure (lazy evaluation)
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: std::error::Error> ErrorContext<T> for std::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| AdError::External {
            message: format!("{}: {}", ctx.into(), e),
        })
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| AdError::External {
            message: format!("{}: {}", f(), e),
        })
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| AdError::Other(ctx.into()))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.ok_or_else(|| AdError::Other(f()))
    }
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    /// Unknown error
    Unknown = 0,
    /// Network failure during load
    Network = 1001,
    /// Provider had no fill
    NoFill = 1002,
    /// Invalid ad unit
    InvalidAdUnit = 1003,
    /// Mediation partner failure
    Mediation = 1004,
    /// Internal load failure
    LoadInternal = 1005,
    /// Load timed out
    LoadTimeout = 1006,
    /// Load cancelled
    LoadCancelled = 1007,
    /// An ad is already showing
    AlreadyShowing = 2001,
    /// Ad expired before show
    AdExpired = 2002,
    /// Internal show failure
    ShowInternal = 2003,
    /// Circuit open
    CircuitOpen = 3001,
    /// Waterfall exhausted
    WaterfallExhausted = 3002,
    /// All circuits open
    AllCircuitsOpen = 3003,
    /// Retry budget spent
    RetriesExhausted = 3004,
    /// Pool exhausted
    PoolExhausted = 4001,
    /// No providers configured
    NoProvidersConfigured = 4002,
    /// No ad unit mapping
    NoAdUnitMapping = 4003,
    /// Unsupported strategy
    UnsupportedStrategy = 5001,
    /// Invalid configuration
    InvalidConfig = 5002,
    /// Load already in progress
    AlreadyLoading = 6001,
    /// Slot not ready
    NotReady = 6002,
    /// Slot destroyed
    SlotDestroyed = 6003,
}

impl AdError {
    /// Returns the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AdError::Load(e) => match e {
                LoadError::Network(_) => ErrorCode::Network,
                LoadError::NoFill => ErrorCode::NoFill,
                LoadError::InvalidAdUnit { .. } => ErrorCode::InvalidAdUnit,
                LoadError::Mediation { .. } => ErrorCode::Mediation,
                LoadError::Internal(_) => ErrorCode::LoadInternal,
                LoadError::Timeout { .. } => ErrorCode::LoadTimeout,
                LoadError::Cancelled => ErrorCode::LoadCancelled,
            },
            AdError::Show(e) => match e {
                ShowError::AlreadyShowing => ErrorCode::AlreadyShowing,
                ShowError::AdExpired => ErrorCode::AdExpired,
                ShowError::Internal(_) => ErrorCode::ShowInternal,
            },
            AdError::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            AdError::WaterfallExhausted { .. } => ErrorCode::WaterfallExhausted,
            AdError::AllCircuitsOpen { .. } => ErrorCode::AllCircuitsOpen,
            AdError::RetriesExhausted { .. } => ErrorCode::RetriesExhausted,
            AdError::PoolExhausted { .. } => ErrorCode::PoolExhausted,
            AdError::NoProvidersConfigured { .. } => ErrorCode::NoProvidersConfigured,
            AdError::NoAdUnitMapping { .. } => ErrorCode::NoAdUnitMapping,
            AdError::UnsupportedStrategy { .. } => ErrorCode::UnsupportedStrategy,
            AdError::InvalidConfig(_) => ErrorCode::InvalidConfig,
            AdError::AlreadyLoading { .. } => ErrorCode::AlreadyLoading,
            AdError::NotReady { .. } => ErrorCode::NotReady,
            AdError::SlotDestroyed { .. } => ErrorCode::SlotDestroyed,
            _ => ErrorCode::Unknown,
        }
    }

    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            AdError::Load(e) => e.is_retryable(),
            AdError::WaterfallExhausted { last, .. }
            | AdError::RetriesExhausted { last, .. } => last.is_retryable(),
            AdError::CircuitOpen { .. } | AdError::AllCircuitsOpen { .. } => true,
            _ => false,
        }
    }

    /// Returns the suggested retry delay, if the error carries one
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AdError::CircuitOpen { retry_after_ms, .. }
            | AdError::AllCircuitsOpen { retry_after_ms } => {
                Some(Duration::from_millis(*retry_after_ms))
            }
            _ => None,
        }
    }
}
