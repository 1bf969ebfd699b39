//! Error types for Cinder.

use crate::expr::ExprError;
use thiserror::Error;

/// Problems with a workflow definition. Always surfaced before any job is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Workflow has no jobs")]
    EmptyWorkflow,

    #[error("Duplicate job name: {0}")]
    DuplicateJob(String),

    #[error("Job '{needed_by}' needs unknown job '{job}'")]
    UnknownJob { job: String, needed_by: String },

    #[error("Job instance id '{0}' is produced twice")]
    DuplicateInstance(String),

    #[error("Cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Invalid matrix for job '{job}': {reason}")]
    InvalidMatrix { job: String, reason: String },

    #[error("Invalid expression in {location}: {source}")]
    InvalidExpression {
        location: String,
        #[source]
        source: ExprError,
    },

    #[error("Invalid trigger #{index}: {reason}")]
    InvalidTrigger { index: usize, reason: String },

    #[error("Artifact '{name}' is produced by both '{first}' and '{second}'")]
    DuplicateArtifact {
        name: String,
        first: String,
        second: String,
    },
}

#[derive(Debug, Error)]
pub enum Error {
    // Definition errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    // Run errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run cancelled: {reason}")]
    RunCancelled { reason: String },

    // Step runner errors
    #[error("Step runner unavailable: {0}")]
    Infrastructure(String),

    #[error("Unsupported step action: {0}")]
    UnsupportedAction(String),

    // Secret errors
    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    #[error("Secret provider not configured: {0}")]
    SecretProviderNotConfigured(String),

    // Cache errors
    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    // Artifact errors
    #[error("Artifact '{0}' already exists in this run")]
    ArtifactConflict(String),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Artifact store error: {0}")]
    ArtifactStore(String),

    // Persistence
    #[error("Run repository error: {0}")]
    Repository(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the same call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Infrastructure(_)
                | Error::CacheUnavailable(_)
                | Error::ArtifactStore(_)
                | Error::Repository(_)
                | Error::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_nodes() {
        let err = ConfigError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Cyclic dependency: a -> b -> a");
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Infrastructure("down".into()).is_transient());
        assert!(Error::CacheUnavailable("s3".into()).is_transient());
        assert!(!Error::ArtifactConflict("dist".into()).is_transient());
        assert!(!Error::Config(ConfigError::EmptyWorkflow).is_transient());
    }
}
