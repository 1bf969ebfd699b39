//! Secret manager for resolving and caching secrets.

use crate::providers::SecretProvider;
use async_trait::async_trait;
use cinder_core::ports::SecretResolver;
use cinder_core::secrets::SecretScope;
use cinder_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Configuration for the secret manager.
#[derive(Debug, Clone)]
pub struct SecretManagerConfig {
    /// How long a resolved value is reused. Zero disables caching.
    pub cache_ttl: Duration,
}

impl Default for SecretManagerConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
        }
    }
}

struct CachedSecret {
    value: Zeroizing<String>,
    cached_at: Instant,
}

/// Resolves secrets from an ordered chain of providers. The first provider that has
/// the secret wins.
pub struct SecretManager {
    config: SecretManagerConfig,
    providers: Vec<Arc<dyn SecretProvider>>,
    cache: RwLock<HashMap<(SecretScope, String), CachedSecret>>,
}

impl SecretManager {
    pub fn new(config: SecretManagerConfig) -> Self {
        Self {
            config,
            providers: Vec::new(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Append a provider to the end of the chain.
    pub fn register_provider(&mut self, provider: Arc<dyn SecretProvider>) {
        info!(provider = %provider.name(), "Registering secret provider");
        self.providers.push(provider);
    }

    pub fn with_provider(mut self, provider: Arc<dyn SecretProvider>) -> Self {
        self.register_provider(provider);
        self
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(|p| p.name())
    }

    /// Secret names visible in `scope` across all providers.
    pub async fn list(&self, scope: &SecretScope) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for provider in &self.providers {
            names.extend(provider.list(scope).await?);
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Drop every cached value.
    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
        info!("Secret cache cleared");
    }

    pub async fn cache_size(&self) -> usize {
        self.cache.read().await.len()
    }

    async fn cached(&self, key: &(SecretScope, String)) -> Option<String> {
        if self.config.cache_ttl.is_zero() {
            return None;
        }
        let cache = self.cache.read().await;
        cache
            .get(key)
            .filter(|cached| cached.cached_at.elapsed() < self.config.cache_ttl)
            .map(|cached| cached.value.to_string())
    }
}

impl Default for SecretManager {
    fn default() -> Self {
        Self::new(SecretManagerConfig::default())
    }
}

#[async_trait]
impl SecretResolver for SecretManager {
    async fn resolve(&self, scope: &SecretScope, name: &str) -> Result<String> {
        if self.providers.is_empty() {
            return Err(Error::SecretProviderNotConfigured(
                "no secret providers registered".to_string(),
            ));
        }

        let key = (scope.clone(), name.to_string());
        if let Some(value) = self.cached(&key).await {
            debug!(name = %name, scope = %scope, "Secret cache hit");
            return Ok(value);
        }

        for provider in &self.providers {
            match provider.get(scope, name).await {
                Ok(value) => {
                    debug!(name = %name, scope = %scope, provider = %provider.name(), "Secret resolved");
                    if !self.config.cache_ttl.is_zero() {
                        self.cache.write().await.insert(
                            key,
                            CachedSecret {
                                value: Zeroizing::new(value.clone()),
                                cached_at: Instant::now(),
                            },
                        );
                    }
                    return Ok(value);
                }
                Err(Error::SecretNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(Error::SecretNotFound(format!("{name} ({scope})")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{EnvProvider, FileProvider};

    fn file(pairs: &[(&str, &str)]) -> Arc<dyn SecretProvider> {
        Arc::new(FileProvider::from_map(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ))
    }

    #[tokio::test]
    async fn test_first_provider_wins() {
        let manager = SecretManager::default()
            .with_provider(Arc::new(EnvProvider::from_vars(None, [("TOKEN", "from-env")])))
            .with_provider(file(&[("TOKEN", "from-file"), ("OTHER", "o")]));

        assert_eq!(
            manager.resolve(&SecretScope::Repository, "TOKEN").await.unwrap(),
            "from-env"
        );
        assert_eq!(manager.resolve(&SecretScope::Repository, "OTHER").await.unwrap(), "o");
        assert_eq!(
            manager.list(&SecretScope::Repository).await.unwrap(),
            vec!["OTHER".to_string(), "TOKEN".to_string()]
        );
        assert_eq!(manager.providers().collect::<Vec<_>>(), vec!["env", "file"]);
    }

    #[tokio::test]
    async fn test_missing_secret() {
        let manager = SecretManager::default().with_provider(file(&[]));
        let err = manager
            .resolve(&SecretScope::Repository, "NOPE")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SecretNotFound(msg) if msg.contains("NOPE")));
    }

    #[tokio::test]
    async fn test_no_providers() {
        let manager = SecretManager::default();
        assert!(matches!(
            manager.resolve(&SecretScope::Repository, "X").await,
            Err(Error::SecretProviderNotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn test_cache_is_per_scope() {
        let provider = FileProvider::from_map(HashMap::from([("KEY".into(), "repo".into())]))
            .with_environment("prod", HashMap::from([("KEY".into(), "prod".into())]));
        let manager = SecretManager::default().with_provider(Arc::new(provider));

        let prod = SecretScope::Environment("prod".into());
        assert_eq!(manager.resolve(&prod, "KEY").await.unwrap(), "prod");
        assert_eq!(manager.resolve(&SecretScope::Repository, "KEY").await.unwrap(), "repo");
        assert_eq!(manager.cache_size().await, 2);

        manager.clear_cache().await;
        assert_eq!(manager.cache_size().await, 0);
    }

    #[tokio::test]
    async fn test_zero_ttl_disables_cache() {
        let manager = SecretManager::new(SecretManagerConfig {
            cache_ttl: Duration::ZERO,
        })
        .with_provider(file(&[("A", "1")]));
        manager.resolve(&SecretScope::Repository, "A").await.unwrap();
        assert_eq!(manager.cache_size().await, 0);
    }
}
