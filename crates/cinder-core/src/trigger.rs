//! Normalized trigger events and the run requests they produce.

use crate::workflow::{EnvMap, TriggerKind};
use serde::{Deserialize, Serialize};

/// An event delivered by the (external) event source.
///
/// `payload` is opaque to the engine except for a few recognized keys:
/// `paths` (changed files), `inputs` (dispatch inputs) and `base_ref` (pull request target).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub kind: TriggerKind,
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl TriggerEvent {
    pub fn new(kind: TriggerKind, git_ref: impl Into<String>) -> Self {
        Self {
            kind,
            git_ref: git_ref.into(),
            payload: serde_json::Map::new(),
        }
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Branch name with any `refs/heads/` prefix removed.
    pub fn branch(&self) -> Option<&str> {
        if self.git_ref.starts_with("refs/tags/") {
            return None;
        }
        Some(
            self.git_ref
                .strip_prefix("refs/heads/")
                .unwrap_or(&self.git_ref),
        )
    }

    pub fn tag(&self) -> Option<&str> {
        self.git_ref.strip_prefix("refs/tags/")
    }

    /// Changed paths carried by the payload, if the event source supplied them.
    pub fn changed_paths(&self) -> Option<Vec<String>> {
        self.payload.get("paths").and_then(|v| v.as_array()).map(|paths| {
            paths
                .iter()
                .filter_map(|p| p.as_str().map(str::to_string))
                .collect()
        })
    }

    /// Dispatch inputs, stringified.
    pub fn inputs(&self) -> EnvMap {
        self.payload
            .get("inputs")
            .and_then(|v| v.as_object())
            .map(|inputs| {
                inputs
                    .iter()
                    .map(|(k, v)| {
                        let value = match v {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (k.clone(), value)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Request to start one run of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub workflow: String,
    /// Index of the trigger spec that matched.
    pub trigger_index: usize,
    pub event: TriggerEvent,
    /// Validated inputs with defaults applied.
    pub inputs: EnvMap,
}
