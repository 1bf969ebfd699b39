//! Secret types.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

/// Where a secret is looked up.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "name", rename_all = "snake_case")]
pub enum SecretScope {
    Repository,
    Environment(String),
}

impl SecretScope {
    /// Scopes to consult for a job, most specific first.
    pub fn lookup_order(environment: Option<&str>) -> Vec<SecretScope> {
        match environment {
            Some(env) => vec![SecretScope::Environment(env.to_string()), SecretScope::Repository],
            None => vec![SecretScope::Repository],
        }
    }
}

impl fmt::Display for SecretScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretScope::Repository => f.write_str("repository"),
            SecretScope::Environment(name) => write!(f, "environment:{name}"),
        }
    }
}

/// A resolved secret. `Debug` never prints the value.
#[derive(Clone)]
pub struct SecretValue {
    pub name: String,
    pub value: Zeroizing<String>,
}

impl SecretValue {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Zeroizing::new(value.into()),
        }
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretValue")
            .field("name", &self.name)
            .field("value", &"***")
            .finish()
    }
}

/// Replaces known secret values with `***`. Held values are zeroed on drop.
#[derive(Default)]
pub struct SecretMasker {
    /// Longest first, so a secret containing another is masked whole.
    values: Vec<Zeroizing<String>>,
}

impl SecretMasker {
    pub const MASK: &'static str = "***";

    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secret. Each line of a multi-line value is also masked on its own, so
    /// output split into lines stays masked.
    pub fn add(&mut self, value: &str) {
        self.insert(value);
        if value.contains('\n') {
            for line in value.lines() {
                self.insert(line.trim_end_matches('\r'));
            }
        }
        self.values.sort_by(|a, b| b.len().cmp(&a.len()));
    }

    fn insert(&mut self, value: &str) {
        if value.trim().is_empty() || self.values.iter().any(|v| v.as_str() == value) {
            return;
        }
        self.values.push(Zeroizing::new(value.to_string()));
    }

    pub fn mask(&self, input: &str) -> String {
        let mut output = input.to_string();
        for value in &self.values {
            if output.contains(value.as_str()) {
                output = output.replace(value.as_str(), Self::MASK);
            }
        }
        output
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Forget every held value, overwriting its memory.
    pub fn clear(&mut self) {
        self.values.clear();
    }
}

impl fmt::Debug for SecretMasker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretMasker")
            .field("values", &self.values.len())
            .finish()
    }
}
