//! Per-run shared state handed to every worker.

use cinder_core::expr::ExprContext;
use cinder_core::ids::RunId;
use cinder_core::ports::SecretResolver;
use cinder_core::secrets::{SecretMasker, SecretScope};
use cinder_core::trigger::TriggerEvent;
use cinder_core::workflow::{EnvMap, WorkflowDefinition};
use cinder_core::Error;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Immutable run facts plus the run's secret cache, masker and cancellation token.
pub struct RunContext {
    pub run_id: RunId,
    pub workflow: Arc<WorkflowDefinition>,
    pub event: TriggerEvent,
    pub inputs: EnvMap,
    secrets: Option<Arc<dyn SecretResolver>>,
    resolved: RwLock<HashMap<(SecretScope, String), Option<Zeroizing<String>>>>,
    masker: RwLock<SecretMasker>,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new(
        run_id: RunId,
        workflow: Arc<WorkflowDefinition>,
        event: TriggerEvent,
        inputs: EnvMap,
        secrets: Option<Arc<dyn SecretResolver>>,
    ) -> Self {
        Self {
            run_id,
            workflow,
            event,
            inputs,
            secrets,
            resolved: RwLock::new(HashMap::new()),
            masker: RwLock::new(SecretMasker::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolve a secret, trying each scope in order. Unknown secrets yield `None`.
    pub async fn secret(&self, scopes: &[SecretScope], name: &str) -> Option<Zeroizing<String>> {
        for scope in scopes {
            if let Some(value) = self.secret_in_scope(scope, name).await {
                return Some(value);
            }
        }
        None
    }

    async fn secret_in_scope(&self, scope: &SecretScope, name: &str) -> Option<Zeroizing<String>> {
        let key = (scope.clone(), name.to_string());
        if let Some(cached) = self.resolved.read().await.get(&key) {
            return cached.clone();
        }

        let resolver = self.secrets.as_ref()?;
        let value = match resolver.resolve(scope, name).await {
            Ok(value) => Some(Zeroizing::new(value)),
            Err(Error::SecretNotFound(_)) => {
                debug!(run_id = %self.run_id, secret = name, %scope, "Secret not found in scope");
                None
            }
            Err(e) => {
                warn!(run_id = %self.run_id, secret = name, %scope, error = %e, "Secret lookup failed");
                return None;
            }
        };

        if let Some(v) = &value {
            self.masker.write().await.add(v);
        }
        self.resolved.write().await.insert(key, value.clone());
        value
    }

    /// Replace every secret resolved so far with `***`.
    pub async fn mask(&self, text: &str) -> String {
        self.masker.read().await.mask(text)
    }

    pub async fn mask_map(&self, map: &EnvMap) -> EnvMap {
        let masker = self.masker.read().await;
        map.iter()
            .map(|(k, v)| (k.clone(), masker.mask(v)))
            .collect()
    }

    /// Expression context carrying the run-wide roots.
    pub fn expr_context(&self) -> ExprContext {
        let mut run = EnvMap::new();
        run.insert("id".to_string(), self.run_id.to_string());
        run.insert("workflow".to_string(), self.workflow.name.clone());

        let mut trigger = serde_json::Map::new();
        trigger.insert("kind".into(), self.event.kind.as_str().into());
        trigger.insert("ref".into(), self.event.git_ref.clone().into());
        if let Some(branch) = self.event.branch() {
            trigger.insert("branch".into(), branch.into());
        }
        if let Some(tag) = self.event.tag() {
            trigger.insert("tag".into(), tag.into());
        }
        trigger.insert(
            "payload".into(),
            serde_json::Value::Object(self.event.payload.clone()),
        );

        ExprContext {
            run,
            trigger,
            inputs: self.inputs.clone(),
            env: self.workflow.env.clone(),
            ..Default::default()
        }
    }

    /// Forget and overwrite every resolved secret.
    pub async fn teardown(&self) {
        self.resolved.write().await.clear();
        self.masker.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cinder_core::workflow::TriggerKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingResolver {
        calls: AtomicU32,
    }

    #[async_trait]
    impl SecretResolver for CountingResolver {
        async fn resolve(&self, scope: &SecretScope, name: &str) -> cinder_core::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match (scope, name) {
                (SecretScope::Environment(env), "TOKEN") if env == "prod" => Ok("prod-token".into()),
                (SecretScope::Repository, "TOKEN") => Ok("repo-token".into()),
                _ => Err(Error::SecretNotFound(name.to_string())),
            }
        }
    }

    fn context(resolver: Arc<CountingResolver>) -> RunContext {
        let workflow: WorkflowDefinition =
            serde_json::from_value(serde_json::json!({ "name": "ci", "jobs": [] })).unwrap();
        RunContext::new(
            RunId::new(),
            Arc::new(workflow),
            TriggerEvent::new(TriggerKind::Push, "refs/heads/main"),
            EnvMap::new(),
            Some(resolver),
        )
    }

    #[tokio::test]
    async fn test_environment_scope_wins() {
        let resolver = Arc::new(CountingResolver {
            calls: AtomicU32::new(0),
        });
        let ctx = context(resolver.clone());

        let prod = SecretScope::lookup_order(Some("prod"));
        assert_eq!(ctx.secret(&prod, "TOKEN").await.as_deref().map(String::as_str), Some("prod-token"));
        let repo = SecretScope::lookup_order(None);
        assert_eq!(ctx.secret(&repo, "TOKEN").await.as_deref().map(String::as_str), Some("repo-token"));
        assert!(ctx.secret(&repo, "MISSING").await.is_none());

        // Cached after the first lookup.
        let calls = resolver.calls.load(Ordering::SeqCst);
        ctx.secret(&prod, "TOKEN").await;
        assert_eq!(resolver.calls.load(Ordering::SeqCst), calls);

        assert_eq!(ctx.mask("using prod-token").await, "using ***");
    }

    #[tokio::test]
    async fn test_teardown_forgets_secrets() {
        let resolver = Arc::new(CountingResolver {
            calls: AtomicU32::new(0),
        });
        let ctx = context(resolver);
        ctx.secret(&SecretScope::lookup_order(None), "TOKEN").await;
        let mut outputs = EnvMap::new();
        outputs.insert("auth".into(), "Bearer repo-token".into());
        assert_eq!(ctx.mask_map(&outputs).await["auth"], "Bearer ***");

        ctx.teardown().await;
        assert!(ctx.resolved.read().await.is_empty());
        assert_eq!(ctx.mask("repo-token").await, "repo-token");
    }

    #[test]
    fn test_expr_context_roots() {
        let resolver = Arc::new(CountingResolver {
            calls: AtomicU32::new(0),
        });
        let ctx = context(resolver).expr_context();
        assert_eq!(ctx.run["workflow"], "ci");
        assert_eq!(ctx.trigger["branch"], "main");
    }
}
