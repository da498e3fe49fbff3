//! Keyed circuit breaker
//!
//! Tracks consecutive failures per key and stops load attempts for keys
//! that keep failing, until a cooldown has elapsed.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Circuit states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests are rejected until the cooldown elapses
    Open,
}

/// Configuration for the keyed circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before a key's circuit opens
    pub failure_threshold: u32,
    /// Cooldown after the last failure before an open circuit closes again
    pub reset_timeout: Duration,
    /// Name for logging/metrics
    pub name: String,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
            name: "default".to_string(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with a name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set reset timeout
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

#[derive(Debug, Default)]
struct KeyState {
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    open: bool,
}

/// Error when a key's circuit is open
#[derive(Debug, Clone)]
pub struct CircuitOpenError {
    /// The guarded resource (breaker name plus key)
    pub resource: String,
    /// Time until the circuit may close
    pub retry_after: Duration,
}

impl fmt::Display for CircuitOpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Circuit for '{}' is open, retry after {:?}",
            self.resource, self.retry_after
        )
    }
}

impl std::error::Error for CircuitOpenError {}

/// Per-key snapshot used by diagnostics exports
#[derive(Debug, Clone, Serialize)]
pub struct CircuitMetrics {
    /// The key, rendered for display
    pub key: String,
    /// Current state after cooldown accounting
    pub state: CircuitState,
    /// Consecutive failures recorded so far
    pub consecutive_failures: u32,
    /// Milliseconds until an open circuit closes, if open
    pub retry_after_ms: Option<u64>,
}

/// Per-key circuit breaker.
///
/// Each key's circuit opens after `failure_threshold` consecutive failures
/// and closes by itself once `reset_timeout` has passed since the last
/// failure. There is no probing half-open state: the first call after the
/// cooldown proceeds directly, and its outcome decides what happens next.
#[derive(Debug)]
pub struct CircuitBreaker<K> {
    config: CircuitBreakerConfig,
    states: Mutex<HashMap<K, KeyState>>,
}

impl<K> CircuitBreaker<K>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    /// Create a new circuit breaker with config
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Create with default config and name
    pub fn with_name(name: impl Into<String>) -> Self {
        Self::new(CircuitBreakerConfig::new(name))
    }

    /// Record a failed operation for `key`
    pub async fn record_failure(&self, key: &K) {
        let mut states = self.states.lock().await;
        let state = states.entry(key.clone()).or_default();
        state.consecutive_failures += 1;
        state.last_failure_at = Some(Instant::now());

        if !state.open && state.consecutive_failures >= self.config.failure_threshold {
            state.open = true;
            tracing::warn!(
                circuit = %self.config.name,
                key = %key,
                failures = state.consecutive_failures,
                "Circuit opened due to consecutive failures"
            );
        }
    }

    /// Record a successful operation for `key`.
    ///
    /// While closed this resets the failure streak. A success that arrives
    /// while the circuit is open closes it immediately; callers are expected
    /// to consult [`CircuitBreaker::is_open`] first, so this is the recovery
    /// path for results that were already in flight when the circuit opened.
    pub async fn record_success(&self, key: &K) {
        let mut states = self.states.lock().await;
        let state = states.entry(key.clone()).or_default();
        if state.open {
            tracing::info!(
                circuit = %self.config.name,
                key = %key,
                "Circuit closed after success while open"
            );
        }
        state.open = false;
        state.consecutive_failures = 0;
        state.last_failure_at = None;
    }

    /// Check whether `key`'s circuit is open.
    ///
    /// An open circuit whose cooldown has elapsed closes here, so the answer
    /// is always current.
    pub async fn is_open(&self, key: &K) -> bool {
        let mut states = self.states.lock().await;
        match states.get_mut(key) {
            Some(state) => Self::effective_open(state, &self.config, key),
            None => false,
        }
    }

    /// Time until `key`'s circuit closes, if it is open
    pub async fn time_remaining(&self, key: &K) -> Option<Duration> {
        let mut states = self.states.lock().await;
        let state = states.get_mut(key)?;
        if !Self::effective_open(state, &self.config, key) {
            return None;
        }
        let last = state.last_failure_at?;
        self.config.reset_timeout.checked_sub(last.elapsed())
    }

    /// `is_open` as a `Result` for `?`-style call sites
    pub async fn check(&self, key: &K) -> Result<(), CircuitOpenError> {
        match self.time_remaining(key).await {
            Some(retry_after) => Err(CircuitOpenError {
                resource: format!("{}:{}", self.config.name, key),
                retry_after,
            }),
            None => Ok(()),
        }
    }

    /// Force a key's circuit open (for testing/admin)
    pub async fn force_open(&self, key: &K) {
        let mut states = self.states.lock().await;
        let state = states.entry(key.clone()).or_default();
        state.open = true;
        state.consecutive_failures = state
            .consecutive_failures
            .max(self.config.failure_threshold);
        state.last_failure_at = Some(Instant::now());
    }

    /// Force a key's circuit closed (for testing/admin)
    pub async fn force_close(&self, key: &K) {
        let mut states = self.states.lock().await;
        let state = states.entry(key.clone()).or_default();
        state.open = false;
        state.consecutive_failures = 0;
        state.last_failure_at = None;
    }

    /// Snapshot of every tracked key, cooldowns applied
    pub async fn metrics(&self) -> Vec<CircuitMetrics> {
        let mut states = self.states.lock().await;
        let config = &self.config;
        let mut out: Vec<CircuitMetrics> = states
            .iter_mut()
            .map(|(key, state)| {
                let open = Self::effective_open(state, config, key);
                let retry_after_ms = if open {
                    state
                        .last_failure_at
                        .and_then(|last| config.reset_timeout.checked_sub(last.elapsed()))
                        .map(|d| d.as_millis() as u64)
                } else {
                    None
                };
                CircuitMetrics {
                    key: key.to_string(),
                    state: if open {
                        CircuitState::Open
                    } else {
                        CircuitState::Closed
                    },
                    consecutive_failures: state.consecutive_failures,
                    retry_after_ms,
                }
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    // Applies the cooldown: an open circuit whose reset timeout has elapsed
    // transitions back to closed with its failure streak cleared.
    fn effective_open(state: &mut KeyState, config: &CircuitBreakerConfig, key: &K) -> bool {
        if !state.open {
            return false;
        }
        let expired = match state.last_failure_at {
            Some(last) => last.elapsed() > config.reset_timeout,
            None => true,
        };
        if expired {
            state.open = false;
            state.consecutive_failures = 0;
            state.last_failure_at = None;
            tracing::debug!(
                circuit = %config.name,
                key = %key,
                "Circuit closed after cooldown"
            );
            return false;
        }
        true
    }
}
