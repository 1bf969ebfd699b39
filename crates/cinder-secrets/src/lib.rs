//! Secret resolution for Cinder runs.
//!
//! Providers look secrets up by scope and name. [`SecretManager`] chains providers,
//! caches what they return, and is what the scheduler holds as its
//! [`SecretResolver`](cinder_core::ports::SecretResolver).

pub mod manager;
pub mod providers;

pub use manager::{SecretManager, SecretManagerConfig};
pub use providers::{EnvProvider, FileProvider, SecretProvider, SecretsFile};
