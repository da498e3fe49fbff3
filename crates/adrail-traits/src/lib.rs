//! # Adrail Traits
//!
//! Unified types and traits for the adrail ad-loading engine. This crate
//! defines the vocabulary shared by every layer: ad formats, slot keys, the
//! provider contract, and the show-event channel.
//!
//! ## Design
//!
//! Providers are injected trait objects; the engine never constructs one.
//! Loaded ads travel as boxed [`AdHandle`]s whose teardown is explicit
//! (`destroy`), and showing requires a caller-supplied [`DisplayToken`] that
//! is never retained beyond the call.
//!
//! ## Example
//!
//! ```
//! use adrail_traits::{AdFormat, AdSlotKey, AdUnitId, ScreenContext};
//!
//! let slot = AdSlotKey::new(AdFormat::Native, AdUnitId::new("unit-main"))
//!     .with_screen(ScreenContext::new("home", 360));
//! assert_eq!(slot.to_string(), "native/unit-main@home_w360");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use adrail_error::{LoadError, ShowError};

/// The ad formats the engine can manage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdFormat {
    /// Inline banner
    Banner,
    /// Full-screen interstitial
    Interstitial,
    /// Full-screen rewarded ad
    Rewarded,
    /// App-open ad shown on foregrounding
    AppOpen,
    /// Native ad rendered by the caller
    Native,
}

impl AdFormat {
    /// Returns the lowercase identifier used in keys and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            AdFormat::Banner => "banner",
            AdFormat::Interstitial => "interstitial",
            AdFormat::Rewarded => "rewarded",
            AdFormat::AppOpen => "app_open",
            AdFormat::Native => "native",
        }
    }
}

impl fmt::Display for AdFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identifier of an ad unit at some provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AdUnitId(pub String);

impl AdUnitId {
    /// Creates a new AdUnitId from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AdUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for AdUnitId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AdUnitId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a mediation provider (e.g. "admob", "yandex")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderId(pub String);

impl ProviderId {
    /// Creates a new ProviderId from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ProviderId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ProviderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Secondary placement dimension used by the cache's tiered lookup.
///
/// Identifies where on screen an ad will land: the screen class (a logical
/// UI screen name) and a width bucket in dp. Two slots that share a screen
/// context can share cached inventory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScreenContext {
    /// Logical screen name (e.g. "home", "details")
    pub screen_class: String,
    /// Width bucket in dp
    pub size_bucket: u32,
}

impl ScreenContext {
    /// Creates a new screen context
    pub fn new(screen_class: impl Into<String>, size_bucket: u32) -> Self {
        Self {
            screen_class: screen_class.into(),
            size_bucket,
        }
    }

    /// Returns the key suffix this context contributes to cache keys
    pub fn suffix(&self) -> String {
        format!("{}_w{}", self.screen_class, self.size_bucket)
    }
}

impl fmt::Display for ScreenContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.suffix())
    }
}

/// Identifies one logical ad placement.
///
/// The screen context is optional; only the cache's multi-tier lookup uses
/// it. Everything else treats the key as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdSlotKey {
    /// Ad format of the placement
    pub format: AdFormat,
    /// Base ad unit identifier
    pub ad_unit: AdUnitId,
    /// Optional screen dimension for cache sharing
    pub screen: Option<ScreenContext>,
}

impl AdSlotKey {
    /// Creates a slot key without a screen context
    pub fn new(format: AdFormat, ad_unit: AdUnitId) -> Self {
        Self {
            format,
            ad_unit,
            screen: None,
        }
    }

    /// Attaches a screen context
    pub fn with_screen(mut self, screen: ScreenContext) -> Self {
        self.screen = Some(screen);
        self
    }
}

impl fmt::Display for AdSlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.screen {
            Some(screen) => write!(f, "{}/{}@{}", self.format, self.ad_unit, screen),
            None => write!(f, "{}/{}", self.format, self.ad_unit),
        }
    }
}

/// Per-call display token.
///
/// Supplied by the caller at each show and used only for the duration of
/// that call; the engine never stores one. Replaces any long-lived
/// reference to a UI surface. [`DisplayToken::next`] mints process-unique
/// ids for log correlation; [`DisplayToken::new`] accepts a caller-chosen
/// id when the surface already has one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisplayToken(pub u64);

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

impl DisplayToken {
    /// Creates a token with a caller-chosen id
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Creates a token with a fresh process-unique id
    pub fn next() -> Self {
        Self(NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the token id
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DisplayToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token-{}", self.0)
    }
}

/// Events delivered while a shown ad is on screen
#[derive(Debug, Clone, PartialEq)]
pub enum ShowEvent {
    /// The impression was counted by the provider
    Impression,
    /// Revenue was attributed to this impression
    Paid {
        /// Value in micro-units of the currency
        micros: u64,
        /// ISO currency code
        currency: String,
    },
    /// The user dismissed the ad
    Dismissed,
}

/// Live show started by [`AdHandle::show`].
///
/// A successful `show` call means the ad is on screen; subsequent events
/// (impression, paid, dismissed) arrive on this session's channel until the
/// sender side is dropped.
#[derive(Debug)]
pub struct ShowSession {
    events: mpsc::UnboundedReceiver<ShowEvent>,
}

impl ShowSession {
    /// Creates a connected (sender, session) pair.
    ///
    /// Provider implementations keep the sender and emit events as their SDK
    /// callbacks fire; the engine consumes the session.
    pub fn channel() -> (mpsc::UnboundedSender<ShowEvent>, ShowSession) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, ShowSession { events: rx })
    }

    /// Waits for the next show event; `None` once the provider is done
    pub async fn next_event(&mut self) -> Option<ShowEvent> {
        self.events.recv().await
    }
}

/// A loaded ad owned by the engine or cache.
///
/// Handles are opaque provider resources. They must be `destroy`ed exactly
/// once when evicted, cleared, or consumed, and become unusable afterwards.
#[async_trait]
pub trait AdHandle: Send + Sync {
    /// The provider that produced this handle
    fn provider(&self) -> &ProviderId;

    /// True while the ad can still be shown
    fn is_ready(&self) -> bool;

    /// Shows the ad on the surface identified by `token`.
    ///
    /// Full-screen formats implement this directly; view formats treat it as
    /// "handed to the caller for rendering". A failed show is terminal for
    /// this handle.
    async fn show(&mut self, token: &DisplayToken) -> Result<ShowSession, ShowError>;

    /// Releases provider-side resources. Idempotent.
    fn destroy(&mut self);
}

/// One mediation provider backend.
///
/// Implementations wrap a concrete ad-network SDK. They perform the actual
/// network I/O and hand back opaque handles; all retry, caching, and
/// frequency policy stays in the engine.
#[async_trait]
pub trait AdProvider: Send + Sync {
    /// Stable identifier used in chains and circuit keys
    fn id(&self) -> &ProviderId;

    /// Loads one ad for `ad_unit`.
    ///
    /// Resolves once the provider reports loaded or failed; cancellation is
    /// dropping the future.
    async fn load(
        &self,
        format: AdFormat,
        ad_unit: &AdUnitId,
    ) -> Result<Box<dyn AdHandle>, LoadError>;
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        AdFormat, AdHandle, AdProvider, AdSlotKey, AdUnitId, DisplayToken, ProviderId,
        ScreenContext, ShowEvent, ShowSession,
    };
    pub use adrail_error::{AdError, LoadError, ShowError};
}
