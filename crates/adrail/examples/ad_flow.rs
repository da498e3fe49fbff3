//! Ad Flow Example
//!
//! Drives the full loading engine against in-memory providers: waterfall
//! failover, show sessions, frequency capping and the debug export.
//!
//! Run with:
//! ```bash
//! cargo run -p adrail --example ad_flow
//! ```

use std::error::Error;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    println!("╔════════════════════════════════════════════════════╗");
    println!("║            🦀 AdRail Ad Flow Demo 🦀               ║");
    println!("╚════════════════════════════════════════════════════╝");
    println!();

    #[cfg(feature = "engine")]
    run().await?;

    #[cfg(not(feature = "engine"))]
    {
        println!("The `engine` feature is disabled! Try:");
        println!("  cargo run -p adrail --example ad_flow");
    }

    Ok(())
}

#[cfg(feature = "engine")]
async fn run() -> Result<(), Box<dyn Error>> {
    use adrail::engine::{
        AdEngine, AdEngineConfig, Decision, FormatConfig, FrequencyPolicy, LoadingStrategy,
        ProviderRegistry,
    };
    use adrail::prelude::*;
    use demo::DemoProvider;
    use std::sync::Arc;

    // Two mediation backends: admob has no fill for its first request,
    // unity always fills.
    let registry = Arc::new(ProviderRegistry::new());
    registry.register(Arc::new(DemoProvider::new("admob").fail_first(1)));
    registry.register(Arc::new(DemoProvider::new("unity")));

    let config = AdEngineConfig::new()
        .with_format(
            AdFormat::Interstitial,
            FormatConfig::new(LoadingStrategy::Hybrid)
                .with_provider("admob", "inter-main")
                .with_provider("unity", "unity-inter-main"),
        )
        .with_format(
            AdFormat::Rewarded,
            FormatConfig::new(LoadingStrategy::FreshWithCacheFallback)
                .with_provider("unity", "unity-rewarded-shop")
                .with_frequency(FrequencyPolicy::new().with_every_nth(2)),
        );

    let engine = AdEngine::new(config, registry)?;
    let inter = AdSlotKey::new(AdFormat::Interstitial, AdUnitId::new("inter-main"));
    let rewarded = AdSlotKey::new(AdFormat::Rewarded, AdUnitId::new("rewarded-shop"));

    println!("━━━ Interstitial: waterfall failover ━━━\n");

    match engine.request(&inter, false).await? {
        Decision::Ready {
            provider,
            from_cache,
            attempts,
        } => {
            println!("  ✅ ready from {provider} (cache: {from_cache}, retries: {attempts})");
        }
        Decision::Skipped(reason) => println!("  ⏭️  skipped: {reason:?}"),
    }

    let mut session = engine.show(&inter, &DisplayToken::new(1)).await?;
    while let Some(event) = session.next_event().await {
        println!("  📡 {event:?}");
    }
    engine.on_shown(&inter);

    println!("\n━━━ Rewarded: every-2nd frequency cap ━━━\n");

    for attempt in 1..=2 {
        match engine.request(&rewarded, false).await? {
            Decision::Ready { provider, .. } => {
                println!("  request {attempt}: ✅ ready from {provider}");
                let mut session = engine.show(&rewarded, &DisplayToken::new(2)).await?;
                while session.next_event().await.is_some() {}
                engine.on_shown(&rewarded);
            }
            Decision::Skipped(reason) => println!("  request {attempt}: ⏭️  {reason:?}"),
        }
    }

    println!("\n━━━ Engine state ━━━\n");

    let debug = engine.export_debug_info().await?;
    println!("{}", serde_json::to_string_pretty(&debug)?);

    Ok(())
}

#[cfg(feature = "engine")]
mod demo {
    use adrail::prelude::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Provider that fills instantly, with an optional initial no-fill streak.
    pub struct DemoProvider {
        id: ProviderId,
        no_fills_left: AtomicU32,
    }

    impl DemoProvider {
        pub fn new(id: &str) -> Self {
            Self {
                id: ProviderId::new(id),
                no_fills_left: AtomicU32::new(0),
            }
        }

        pub fn fail_first(self, count: u32) -> Self {
            self.no_fills_left.store(count, Ordering::SeqCst);
            self
        }
    }

    #[async_trait]
    impl AdProvider for DemoProvider {
        fn id(&self) -> &ProviderId {
            &self.id
        }

        async fn load(
            &self,
            _format: AdFormat,
            _ad_unit: &AdUnitId,
        ) -> Result<Box<dyn AdHandle>, LoadError> {
            let left = self.no_fills_left.load(Ordering::SeqCst);
            if left > 0 {
                self.no_fills_left.store(left - 1, Ordering::SeqCst);
                return Err(LoadError::NoFill);
            }
            Ok(Box::new(DemoHandle {
                provider: self.id.clone(),
                live: true,
            }))
        }
    }

    struct DemoHandle {
        provider: ProviderId,
        live: bool,
    }

    #[async_trait]
    impl AdHandle for DemoHandle {
        fn provider(&self) -> &ProviderId {
            &self.provider
        }

        fn is_ready(&self) -> bool {
            self.live
        }

        async fn show(&mut self, _token: &DisplayToken) -> Result<ShowSession, ShowError> {
            self.live = false;
            let (events, session) = ShowSession::channel();
            let _ = events.send(ShowEvent::Impression);
            let _ = events.send(ShowEvent::Paid {
                micros: 12_500,
                currency: "USD".to_string(),
            });
            let _ = events.send(ShowEvent::Dismissed);
            Ok(session)
        }

        fn destroy(&mut self) {
            self.live = false;
        }
    }
}
