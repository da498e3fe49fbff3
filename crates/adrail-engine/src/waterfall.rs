//! Ordered provider waterfall with per-pair circuit breaking.
//!
//! A chain is walked front to back until some provider fills. Providers with
//! no ad unit mapping are skipped silently; providers behind an open circuit
//! are skipped without network traffic and without counting as an attempt.
//! Exhaustion reports the last concrete provider error when one was seen,
//! otherwise a synthetic error describing why nothing was attempted.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use adrail_error::AdError;
use adrail_error::LoadError;
use adrail_resilience::{CircuitBreaker, CircuitBreakerConfig};
use adrail_traits::{AdFormat, AdHandle, AdUnitId, ProviderId};

use crate::registry::ProviderRegistry;

/// Circuit key for one (provider, ad unit) pair.
///
/// Breaking per pair keeps one misconfigured unit from blacklisting the
/// provider's other placements.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BreakerKey {
    /// Provider half of the pair
    pub provider: ProviderId,
    /// Ad unit half of the pair
    pub ad_unit: AdUnitId,
}

impl BreakerKey {
    /// Creates a key for the pair
    pub fn new(provider: ProviderId, ad_unit: AdUnitId) -> Self {
        Self { provider, ad_unit }
    }
}

impl fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.ad_unit)
    }
}

/// A successful waterfall pass.
pub struct WaterfallWin {
    /// Provider that filled
    pub provider: ProviderId,
    /// The loaded ad
    pub handle: Box<dyn AdHandle>,
    /// Providers actually attempted, including the winner
    pub providers_tried: u32,
}

impl fmt::Debug for WaterfallWin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaterfallWin")
            .field("provider", &self.provider)
            .field("providers_tried", &self.providers_tried)
            .finish()
    }
}

/// Walks provider chains in priority order, breaker-gated per pair.
///
/// Cloning is cheap and shares the registry and breaker state, so one
/// waterfall can serve concurrent loads across formats.
#[derive(Debug, Clone)]
pub struct ProviderWaterfall {
    registry: Arc<ProviderRegistry>,
    breaker: Arc<CircuitBreaker<BreakerKey>>,
}

impl ProviderWaterfall {
    /// Creates a waterfall over `registry` with a fresh breaker
    pub fn new(registry: Arc<ProviderRegistry>, breaker: CircuitBreakerConfig) -> Self {
        Self {
            registry,
            breaker: Arc::new(CircuitBreaker::new(breaker)),
        }
    }

    /// The circuit breaker guarding (provider, ad unit) pairs
    pub fn breaker(&self) -> &CircuitBreaker<BreakerKey> {
        &self.breaker
    }

    /// The provider registry this waterfall resolves chains against
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Runs one waterfall pass over `chain` for `format`.
    ///
    /// `units` maps each provider to the ad unit it should load. Unmapped or
    /// unregistered providers are skipped and do not count as attempts. A
    /// fill records success on the pair's circuit and returns immediately;
    /// a failure records it and falls through to the next provider.
    pub async fn load(
        &self,
        format: AdFormat,
        chain: &[ProviderId],
        units: &HashMap<ProviderId, AdUnitId>,
    ) -> Result<WaterfallWin, AdError> {
        if chain.is_empty() {
            return Err(AdError::NoProvidersConfigured {
                format: format.as_str().to_string(),
            });
        }

        let mut tried: u32 = 0;
        let mut last_error: Option<LoadError> = None;
        let mut any_mapped = false;
        let mut shortest_open: Option<Duration> = None;

        for provider_id in chain {
            let ad_unit = match units.get(provider_id) {
                Some(unit) => unit,
                None => {
                    debug!(provider = %provider_id, format = %format, "no ad unit mapping, skipping");
                    continue;
                }
            };
            any_mapped = true;

            let key = BreakerKey::new(provider_id.clone(), ad_unit.clone());
            if let Some(remaining) = self.breaker.time_remaining(&key).await {
                debug!(
                    circuit = %key,
                    remaining_ms = remaining.as_millis() as u64,
                    "circuit open, skipping provider"
                );
                shortest_open = Some(match shortest_open {
                    Some(shortest) => shortest.min(remaining),
                    None => remaining,
                });
                continue;
            }

            let provider = match self.registry.get(provider_id) {
                Some(provider) => provider,
                None => {
                    warn!(provider = %provider_id, "provider in chain but not registered, skipping");
                    continue;
                }
            };

            tried += 1;
            match provider.load(format, ad_unit).await {
                Ok(handle) => {
                    self.breaker.record_success(&key).await;
                    info!(
                        provider = %provider_id,
                        ad_unit = %ad_unit,
                        format = %format,
                        position = tried,
                        "waterfall fill"
                    );
                    return Ok(WaterfallWin {
                        provider: provider_id.clone(),
                        handle,
                        providers_tried: tried,
                    });
                }
                Err(error) => {
                    self.breaker.record_failure(&key).await;
                    warn!(
                        provider = %provider_id,
                        ad_unit = %ad_unit,
                        format = %format,
                        error = %error,
                        "provider load failed, falling through"
                    );
                    last_error = Some(error);
                }
            }
        }

        if let Some(last) = last_error {
            return Err(AdError::WaterfallExhausted {
                attempts: tried,
                last,
            });
        }
        if !any_mapped {
            return Err(AdError::NoAdUnitMapping {
                format: format.as_str().to_string(),
            });
        }
        if let Some(remaining) = shortest_open {
            return Err(AdError::AllCircuitsOpen {
                retry_after_ms: remaining.as_millis() as u64,
            });
        }
        Err(AdError::NoProvidersConfigured {
            format: format.as_str().to_string(),
        })
    }
}
