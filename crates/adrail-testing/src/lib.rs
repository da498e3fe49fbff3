//! # AdRail Testing
//!
//! Shared testing infrastructure for the adrail crates:
//!
//! - **Fake providers and handles**: scriptable in-memory implementations of
//!   [`AdProvider`] and [`AdHandle`] with observable lifecycle flags
//! - **Edge case inputs**: ad unit names and screen contexts that exercise
//!   keying and bucketing boundaries
//! - **Property strategies**: `proptest` generators for core domain types
//!
//! This crate is internal tooling and is never published.
//!
//! ## Example
//!
//! ```
//! use adrail_testing::{FakeProvider, LoadOutcome};
//! use adrail_traits::{AdFormat, AdProvider, AdUnitId};
//! use adrail_error::LoadError;
//!
//! # async fn example() {
//! let provider = FakeProvider::scripted(
//!     "admob",
//!     vec![LoadOutcome::Fail(LoadError::NoFill), LoadOutcome::Fill],
//! );
//!
//! let unit = AdUnitId::new("unit-main");
//! assert!(provider.load(AdFormat::Banner, &unit).await.is_err());
//! assert!(provider.load(AdFormat::Banner, &unit).await.is_ok());
//! assert_eq!(provider.load_calls(), 2);
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use tokio::sync::Mutex;

use adrail_error::{LoadError, ShowError};
use adrail_traits::{
    AdFormat, AdHandle, AdProvider, AdSlotKey, AdUnitId, DisplayToken, ProviderId, ScreenContext,
    ShowEvent, ShowSession,
};

// ============================================================================
// Fake Ad Handles
// ============================================================================

/// Observer for a [`FakeHandle`] that outlives the boxed handle.
///
/// Handles move by value into caches, pools, and engine slots; the watch
/// shares the handle's lifecycle flags so tests can still assert what
/// happened to it afterwards.
#[derive(Debug, Clone)]
pub struct HandleWatch {
    shown: Arc<AtomicBool>,
    destroyed: Arc<AtomicBool>,
}

impl HandleWatch {
    /// True once the handle's `show` has been attempted
    pub fn was_shown(&self) -> bool {
        self.shown.load(Ordering::SeqCst)
    }

    /// True once the handle was destroyed
    pub fn was_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

/// In-memory [`AdHandle`] with scripted readiness and show behavior.
///
/// A successful `show` emits a single [`ShowEvent::Impression`] and then ends
/// the session. Both success and scripted failure are terminal: the handle
/// reports not ready afterwards.
#[derive(Debug)]
pub struct FakeHandle {
    provider: ProviderId,
    ready: bool,
    show_error: Option<ShowError>,
    shown: Arc<AtomicBool>,
    destroyed: Arc<AtomicBool>,
}

impl FakeHandle {
    /// A handle that reports ready and shows successfully
    pub fn ready(provider: ProviderId) -> Self {
        Self {
            provider,
            ready: true,
            show_error: None,
            shown: Arc::new(AtomicBool::new(false)),
            destroyed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A handle that is no longer showable (consumed or expired upstream)
    pub fn spent(provider: ProviderId) -> Self {
        Self {
            ready: false,
            ..Self::ready(provider)
        }
    }

    /// A ready handle whose first `show` fails with `error`
    pub fn failing_show(provider: ProviderId, error: ShowError) -> Self {
        Self {
            show_error: Some(error),
            ..Self::ready(provider)
        }
    }

    /// Returns a watch sharing this handle's lifecycle flags
    pub fn watch(&self) -> HandleWatch {
        HandleWatch {
            shown: Arc::clone(&self.shown),
            destroyed: Arc::clone(&self.destroyed),
        }
    }
}

#[async_trait]
impl AdHandle for FakeHandle {
    fn provider(&self) -> &ProviderId {
        &self.provider
    }

    fn is_ready(&self) -> bool {
        self.ready
            && !self.shown.load(Ordering::SeqCst)
            && !self.destroyed.load(Ordering::SeqCst)
    }

    async fn show(&mut self, _token: &DisplayToken) -> Result<ShowSession, ShowError> {
        if self.destroyed.load(Ordering::SeqCst) || !self.ready {
            return Err(ShowError::AdExpired);
        }
        if self.shown.swap(true, Ordering::SeqCst) {
            return Err(ShowError::AlreadyShowing);
        }
        if let Some(error) = self.show_error.take() {
            return Err(error);
        }
        let (tx, session) = ShowSession::channel();
        let _ = tx.send(ShowEvent::Impression);
        Ok(session)
    }

    fn destroy(&mut self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Fake Providers
// ============================================================================

/// One scripted result for a [`FakeProvider`] load call.
#[derive(Debug, Clone)]
pub enum LoadOutcome {
    /// Resolve with a ready handle
    Fill,
    /// Resolve with the given error
    Fail(LoadError),
}

/// Scriptable in-memory [`AdProvider`].
///
/// Scripted outcomes are consumed front to back; once the script is empty
/// every load resolves with the default outcome. The provider records each
/// requested ad unit and keeps a [`HandleWatch`] for every handle it creates,
/// so tests can follow handles that moved into the engine.
#[derive(Debug)]
pub struct FakeProvider {
    id: ProviderId,
    script: Mutex<VecDeque<LoadOutcome>>,
    default_outcome: LoadOutcome,
    delay: Option<Duration>,
    load_calls: AtomicU32,
    requested_units: Mutex<Vec<AdUnitId>>,
    handles: Mutex<Vec<HandleWatch>>,
}

impl FakeProvider {
    /// A provider that fills every load
    pub fn filling(id: impl Into<String>) -> Self {
        Self::with_default(id, LoadOutcome::Fill)
    }

    /// A provider that fails every load with `error`
    pub fn failing(id: impl Into<String>, error: LoadError) -> Self {
        Self::with_default(id, LoadOutcome::Fail(error))
    }

    /// A provider that consumes `script` front to back, then fills
    pub fn scripted(id: impl Into<String>, script: Vec<LoadOutcome>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::with_default(id, LoadOutcome::Fill)
        }
    }

    fn with_default(id: impl Into<String>, default_outcome: LoadOutcome) -> Self {
        Self {
            id: ProviderId::new(id),
            script: Mutex::new(VecDeque::new()),
            default_outcome,
            delay: None,
            load_calls: AtomicU32::new(0),
            requested_units: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Delays every load by `delay` before resolving.
    ///
    /// Under a paused test clock the delay only elapses via
    /// `tokio::time::advance`, which keeps in-flight loads observable.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of `load` calls received so far
    pub fn load_calls(&self) -> u32 {
        self.load_calls.load(Ordering::SeqCst)
    }

    /// Ad units requested so far, in call order
    pub async fn requested_units(&self) -> Vec<AdUnitId> {
        self.requested_units.lock().await.clone()
    }

    /// Watches for every handle this provider produced, in call order
    pub async fn created_handles(&self) -> Vec<HandleWatch> {
        self.handles.lock().await.clone()
    }
}

#[async_trait]
impl AdProvider for FakeProvider {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    async fn load(
        &self,
        _format: AdFormat,
        ad_unit: &AdUnitId,
    ) -> Result<Box<dyn AdHandle>, LoadError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        self.requested_units.lock().await.push(ad_unit.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let outcome = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.default_outcome.clone());
        match outcome {
            LoadOutcome::Fill => {
                let handle = FakeHandle::ready(self.id.clone());
                self.handles.lock().await.push(handle.watch());
                Ok(Box::new(handle))
            }
            LoadOutcome::Fail(error) => Err(error),
        }
    }
}

// ============================================================================
// Edge Case Inputs
// ============================================================================

/// Ad unit names that exercise keying and mapping boundaries.
pub struct EdgeCaseAdUnits;

impl EdgeCaseAdUnits {
    /// Empty unit name
    pub const EMPTY: &'static str = "";

    /// Whitespace-only unit name
    pub const WHITESPACE: &'static str = "   ";

    /// Typical production-looking unit id
    pub const TYPICAL: &'static str = "ca-app-pub-3940256099942544/6300978111";

    /// Name at the long end of what mediation dashboards accept
    pub const LONG: &'static str =
        "campaign-2024-q3-retargeting-lookalike-expansion-v2-test-cell-b-holdout-1pct-final";

    /// Unit name with non-ASCII characters
    pub const UNICODE: &'static str = "unité-publicitaire-🎯";

    /// Name containing the `+` that cache keys use as a separator
    pub const PLUS_SEPARATOR: &'static str = "unit+extra";
}

/// Screen contexts at the boundaries of size bucketing.
pub struct EdgeCaseScreens;

impl EdgeCaseScreens {
    /// Zero-width bucket, as reported before the first layout pass
    pub fn zero_width() -> ScreenContext {
        ScreenContext::new("home", 0)
    }

    /// Narrowest phone bucket in common use
    pub fn narrow_phone() -> ScreenContext {
        ScreenContext::new("feed", 320)
    }

    /// Largest tablet bucket in common use
    pub fn tablet() -> ScreenContext {
        ScreenContext::new("details", 1280)
    }

    /// Screen class with separator characters from minified route names
    pub fn minified_route() -> ScreenContext {
        ScreenContext::new("r/2_a", 360)
    }
}

// ============================================================================
// Property Test Strategies
// ============================================================================

/// Strategy over all ad formats
pub fn arb_ad_format() -> impl Strategy<Value = AdFormat> {
    prop_oneof![
        Just(AdFormat::Banner),
        Just(AdFormat::Interstitial),
        Just(AdFormat::Rewarded),
        Just(AdFormat::AppOpen),
        Just(AdFormat::Native),
    ]
}

/// Strategy over plausible ad unit ids
pub fn arb_ad_unit_id() -> impl Strategy<Value = AdUnitId> {
    "[a-z][a-z0-9_-]{0,30}".prop_map(AdUnitId::new)
}

/// Strategy over screen contexts with realistic width buckets
pub fn arb_screen_context() -> impl Strategy<Value = ScreenContext> {
    ("[a-z][a-z_]{0,15}", 120u32..=1600).prop_map(|(class, bucket)| ScreenContext::new(class, bucket))
}

/// Strategy over slot keys, with and without screen contexts
pub fn arb_slot_key() -> impl Strategy<Value = AdSlotKey> {
    (
        arb_ad_format(),
        arb_ad_unit_id(),
        proptest::option::of(arb_screen_context()),
    )
        .prop_map(|(format, ad_unit, screen)| {
            let key = AdSlotKey::new(format, ad_unit);
            match screen {
                Some(screen) => key.with_screen(screen),
                None => key,
            }
        })
}

// ============================================================================
// Tests
// ============================================================================
