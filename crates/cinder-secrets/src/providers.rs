//! Secret providers.

use async_trait::async_trait;
use cinder_core::secrets::SecretScope;
use cinder_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// A source of secret values.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Get a secret, failing with `Error::SecretNotFound` when this provider lacks it.
    async fn get(&self, scope: &SecretScope, name: &str) -> Result<String>;

    async fn exists(&self, scope: &SecretScope, name: &str) -> Result<bool> {
        match self.get(scope, name).await {
            Ok(_) => Ok(true),
            Err(Error::SecretNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Names available in `scope`.
    async fn list(&self, scope: &SecretScope) -> Result<Vec<String>>;

    fn name(&self) -> &str;
}

fn not_found(scope: &SecretScope, name: &str) -> Error {
    Error::SecretNotFound(format!("{name} ({scope})"))
}

enum EnvSource {
    Process,
    Snapshot(HashMap<String, String>),
}

/// Reads secrets from environment variables.
///
/// Repository secrets map to `PREFIX_NAME`. Environment secrets map to
/// `PREFIX_ENV_<ENVIRONMENT>_NAME`, with the environment name upper-cased and
/// non-alphanumerics replaced by `_`.
pub struct EnvProvider {
    prefix: Option<String>,
    source: EnvSource,
}

impl EnvProvider {
    pub fn new(prefix: Option<String>) -> Self {
        Self {
            prefix,
            source: EnvSource::Process,
        }
    }

    /// Use a fixed set of variables instead of the process environment.
    pub fn from_vars<I, K, V>(prefix: Option<String>, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            prefix,
            source: EnvSource::Snapshot(
                vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            ),
        }
    }

    fn scope_prefix(&self, scope: &SecretScope) -> String {
        let mut prefix = self
            .prefix
            .as_deref()
            .map(|p| format!("{p}_"))
            .unwrap_or_default();
        if let SecretScope::Environment(env) = scope {
            prefix.push_str("ENV_");
            prefix.extend(env.chars().map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            }));
            prefix.push('_');
        }
        prefix
    }

    fn var(&self, key: &str) -> Option<String> {
        match &self.source {
            EnvSource::Process => std::env::var(key).ok(),
            EnvSource::Snapshot(vars) => vars.get(key).cloned(),
        }
    }

    fn keys(&self) -> Vec<String> {
        match &self.source {
            EnvSource::Process => std::env::vars().map(|(k, _)| k).collect(),
            EnvSource::Snapshot(vars) => vars.keys().cloned().collect(),
        }
    }
}

impl Default for EnvProvider {
    fn default() -> Self {
        Self::new(Some("CINDER_SECRET".to_string()))
    }
}

#[async_trait]
impl SecretProvider for EnvProvider {
    async fn get(&self, scope: &SecretScope, name: &str) -> Result<String> {
        let key = format!("{}{name}", self.scope_prefix(scope));
        self.var(&key).ok_or_else(|| not_found(scope, name))
    }

    async fn list(&self, scope: &SecretScope) -> Result<Vec<String>> {
        let prefix = self.scope_prefix(scope);
        let mut names: Vec<String> = self
            .keys()
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            // Repository listing must not pick up environment-scoped variables.
            .filter(|name| !(scope == &SecretScope::Repository && name.starts_with("ENV_")))
            .collect();
        names.sort();
        Ok(names)
    }

    fn name(&self) -> &str {
        "env"
    }
}

/// On-disk layout read by [`FileProvider::load`].
///
/// ```yaml
/// repository:
///   NPM_TOKEN: abc
/// environments:
///   production:
///     DEPLOY_KEY: xyz
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretsFile {
    #[serde(default)]
    pub repository: HashMap<String, String>,
    #[serde(default)]
    pub environments: HashMap<String, HashMap<String, String>>,
}

/// Secrets held in memory, usually loaded from a local file.
#[derive(Default)]
pub struct FileProvider {
    secrets: SecretsFile,
}

impl FileProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repository-scoped secrets only.
    pub fn from_map(secrets: HashMap<String, String>) -> Self {
        Self {
            secrets: SecretsFile {
                repository: secrets,
                environments: HashMap::new(),
            },
        }
    }

    pub fn with_environment(
        mut self,
        environment: impl Into<String>,
        secrets: HashMap<String, String>,
    ) -> Self {
        self.secrets
            .environments
            .entry(environment.into())
            .or_default()
            .extend(secrets);
        self
    }

    /// Load a YAML or JSON secrets file, chosen by extension.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::SecretProviderNotConfigured(format!(
                "cannot read secrets file {}: {e}",
                path.display()
            ))
        })?;
        let secrets = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content).map_err(|e| Error::Serialization(e.to_string()))?
        } else {
            serde_yaml::from_str(&content).map_err(|e| Error::Serialization(e.to_string()))?
        };
        Ok(Self { secrets })
    }

    fn scope_map(&self, scope: &SecretScope) -> Option<&HashMap<String, String>> {
        match scope {
            SecretScope::Repository => Some(&self.secrets.repository),
            SecretScope::Environment(env) => self.secrets.environments.get(env),
        }
    }
}

#[async_trait]
impl SecretProvider for FileProvider {
    async fn get(&self, scope: &SecretScope, name: &str) -> Result<String> {
        self.scope_map(scope)
            .and_then(|secrets| secrets.get(name))
            .cloned()
            .ok_or_else(|| not_found(scope, name))
    }

    async fn list(&self, scope: &SecretScope) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .scope_map(scope)
            .map(|secrets| secrets.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }

    fn name(&self) -> &str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn production() -> SecretScope {
        SecretScope::Environment("production".into())
    }

    #[tokio::test]
    async fn test_env_provider_scopes() {
        let provider = EnvProvider::from_vars(
            Some("CINDER_SECRET".into()),
            [
                ("CINDER_SECRET_NPM_TOKEN", "repo-token"),
                ("CINDER_SECRET_ENV_PRODUCTION_DEPLOY_KEY", "prod-key"),
                ("UNRELATED", "x"),
            ],
        );

        assert_eq!(
            provider.get(&SecretScope::Repository, "NPM_TOKEN").await.unwrap(),
            "repo-token"
        );
        assert_eq!(provider.get(&production(), "DEPLOY_KEY").await.unwrap(), "prod-key");
        assert!(matches!(
            provider.get(&production(), "NPM_TOKEN").await,
            Err(Error::SecretNotFound(_))
        ));

        assert_eq!(
            provider.list(&SecretScope::Repository).await.unwrap(),
            vec!["NPM_TOKEN".to_string()]
        );
        assert_eq!(
            provider.list(&production()).await.unwrap(),
            vec!["DEPLOY_KEY".to_string()]
        );
    }

    #[tokio::test]
    async fn test_env_provider_mangles_environment_names() {
        let provider = EnvProvider::from_vars(None, [("ENV_STAGING_EU_1_KEY", "v")]);
        let scope = SecretScope::Environment("staging-eu.1".into());
        assert!(provider.exists(&scope, "KEY").await.unwrap());
        assert!(!provider.exists(&SecretScope::Repository, "KEY").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_provider() {
        let provider = FileProvider::from_map(HashMap::from([(
            "DB_PASSWORD".to_string(),
            "hunter2".to_string(),
        )]))
        .with_environment(
            "production",
            HashMap::from([("DB_PASSWORD".to_string(), "prod-pass".to_string())]),
        );

        assert_eq!(
            provider.get(&SecretScope::Repository, "DB_PASSWORD").await.unwrap(),
            "hunter2"
        );
        assert_eq!(provider.get(&production(), "DB_PASSWORD").await.unwrap(), "prod-pass");
        assert!(
            !provider
                .exists(&SecretScope::Environment("qa".into()), "DB_PASSWORD")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_load_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.yaml");
        std::fs::write(
            &path,
            "repository:\n  NPM_TOKEN: abc\nenvironments:\n  production:\n    DEPLOY_KEY: xyz\n",
        )
        .unwrap();

        let provider = FileProvider::load(&path).await.unwrap();
        assert_eq!(provider.get(&SecretScope::Repository, "NPM_TOKEN").await.unwrap(), "abc");
        assert_eq!(provider.get(&production(), "DEPLOY_KEY").await.unwrap(), "xyz");
    }

    #[tokio::test]
    async fn test_load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        std::fs::write(&path, r#"{"repository": {"TOKEN": "t"}}"#).unwrap();

        let provider = FileProvider::load(&path).await.unwrap();
        assert_eq!(provider.list(&SecretScope::Repository).await.unwrap(), vec!["TOKEN"]);
        assert!(provider.list(&production()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = FileProvider::load(Path::new("/nonexistent/secrets.yaml"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::SecretProviderNotConfigured(_)));
    }
}
