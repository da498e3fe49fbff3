//! Provider registry.
//!
//! Providers register once at startup; chains then reference them by id.
//! A chain entry with no registered provider is skipped at load time, so
//! partially wired configurations degrade instead of failing outright.

use adrail_traits::{AdProvider, ProviderId};
use dashmap::DashMap;
use std::sync::Arc;

/// Registry of provider backends, keyed by their stable id
#[derive(Default)]
pub struct ProviderRegistry {
    providers: DashMap<ProviderId, Arc<dyn AdProvider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
        }
    }

    /// Registers a provider under its own id, replacing any previous one
    pub fn register(&self, provider: Arc<dyn AdProvider>) {
        let id = provider.id().clone();
        tracing::debug!(provider = %id, "Registered ad provider");
        self.providers.insert(id, provider);
    }

    /// Looks up a provider by id
    pub fn get(&self, id: &ProviderId) -> Option<Arc<dyn AdProvider>> {
        self.providers.get(id).map(|p| Arc::clone(&p))
    }

    /// Removes a provider, returning it if present
    pub fn remove(&self, id: &ProviderId) -> Option<Arc<dyn AdProvider>> {
        self.providers.remove(id).map(|(_, p)| p)
    }

    /// Returns all registered provider ids
    pub fn names(&self) -> Vec<ProviderId> {
        self.providers.iter().map(|p| p.key().clone()).collect()
    }

    /// Number of registered providers
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adrail_error::LoadError;
    use adrail_traits::{AdFormat, AdHandle, AdUnitId};
    use async_trait::async_trait;

    struct NoFillProvider {
        id: ProviderId,
    }

    #[async_trait]
    impl AdProvider for NoFillProvider {
        fn id(&self) -> &ProviderId {
            &self.id
        }

        async fn load(
            &self,
            _format: AdFormat,
            _ad_unit: &AdUnitId,
        ) -> Result<Box<dyn AdHandle>, LoadError> {
            Err(LoadError::NoFill)
        }
    }

    fn provider(name: &str) -> Arc<dyn AdProvider> {
        Arc::new(NoFillProvider {
            id: ProviderId::new(name),
        })
    }

    #[test]
    fn test_register_and_get() {
        let registry = ProviderRegistry::new();
        assert!(registry.is_empty());

        registry.register(provider("admob"));
        registry.register(provider("unity"));

        assert_eq!(registry.len(), 2);
        assert!(registry.get(&ProviderId::new("admob")).is_some());
        assert!(registry.get(&ProviderId::new("vungle")).is_none());
    }

    #[test]
    fn test_register_replaces() {
        let registry = ProviderRegistry::new();
        registry.register(provider("admob"));
        registry.register(provider("admob"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove() {
        let registry = ProviderRegistry::new();
        registry.register(provider("admob"));

        assert!(registry.remove(&ProviderId::new("admob")).is_some());
        assert!(registry.remove(&ProviderId::new("admob")).is_none());
        assert!(registry.is_empty());
    }
}
