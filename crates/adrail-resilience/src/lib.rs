//! # AdRail Resilience
//!
//! Resilience patterns for the AdRail ad-loading SDK.
//!
//! This crate provides the failure-handling building blocks the loading
//! engine leans on when mediation networks misbehave:
//!
//! - **Circuit Breaker**: Stop hammering a provider or ad unit that keeps failing
//! - **Exponential Backoff**: Compute retry delays with increasing spacing
//! - **Retry Scheduler**: One pending, cancellable retry per slot
//! - **Timeouts**: Bound fresh-load attempts so cache fallback stays responsive
//!
//! ## Quick Start
//!
//! ```rust
//! use adrail_resilience::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() {
//! // One breaker, independent state per provider/ad-unit key
//! let breaker: CircuitBreaker<String> = CircuitBreaker::new(
//!     CircuitBreakerConfig::new("mediation")
//!         .with_failure_threshold(3)
//!         .with_reset_timeout(Duration::from_secs(30)),
//! );
//!
//! breaker.record_failure(&"admob/banner-main".to_string()).await;
//! assert!(!breaker.is_open(&"admob/banner-main".to_string()).await);
//! # }
//! ```
//!
//! ## Circuit Breaker
//!
//! The breaker opens a key after a streak of consecutive failures and
//! closes it again once the reset timeout elapses or a success lands:
//!
//! ```rust
//! use adrail_resilience::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let config = CircuitBreakerConfig::new("waterfall")
//!     .with_failure_threshold(3)      // Open after 3 consecutive failures
//!     .with_reset_timeout(Duration::from_secs(30)); // Auto-close after 30s
//!
//! let breaker: CircuitBreaker<String> = CircuitBreaker::new(config);
//!
//! if let Err(open) = breaker.check(&"unity/rewarded-shop".to_string()).await {
//!     println!("skip this provider, retry in {:?}", open.retry_after);
//! }
//! # }
//! ```
//!
//! ## Exponential Backoff
//!
//! The delay schedule follows `initial * multiplier^attempt`, capped:
//!
//! ```rust
//! use adrail_resilience::{BackoffConfig, ExponentialBackoff};
//! use std::time::Duration;
//!
//! let config = BackoffConfig::new()
//!     .with_initial_delay(Duration::from_millis(1000))
//!     .with_max_delay(Duration::from_secs(30))
//!     .with_multiplier(2.0);
//!
//! let mut backoff = ExponentialBackoff::new(config);
//! assert_eq!(backoff.next(), Some(Duration::from_millis(1000)));
//! assert_eq!(backoff.next(), Some(Duration::from_millis(2000)));
//! assert_eq!(backoff.next(), Some(Duration::from_millis(4000)));
//! ```
//!
//! ## Retry Scheduler
//!
//! At most one live retry per key. Scheduling again replaces the pending
//! ticket, and `cancel` guarantees the action never runs:
//!
//! ```rust,no_run
//! use adrail_resilience::RetryScheduler;
//!
//! # async fn example() {
//! let scheduler: RetryScheduler<String> = RetryScheduler::default_backoff();
//!
//! let ticket = scheduler
//!     .schedule("banner/home".to_string(), 0, 3, || async {
//!         // Re-issue the load here
//!         Ok::<_, String>(())
//!     })
//!     .await;
//! # let _ = ticket;
//! # }
//! ```
//!
//! ## Timeouts
//!
//! Bound a fresh load so the caller can fall back to cache:
//!
//! ```rust
//! use adrail_resilience::with_timeout;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let result = with_timeout(Duration::from_millis(800), "fresh_load", async { 42 }).await;
//! assert_eq!(result.unwrap(), 42);
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod circuit_breaker;
pub mod retry;
pub mod timeout;

// Re-export main types
pub use backoff::{BackoffConfig, ExponentialBackoff};

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, CircuitOpenError, CircuitState,
};

pub use retry::{RetryExhausted, RetryScheduler, RetryTicket};

pub use timeout::{with_timeout, TimeoutError};
