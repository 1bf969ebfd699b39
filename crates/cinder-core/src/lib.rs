//! Cinder Core
//!
//! Workflow model, run records, expression language, errors and the port traits
//! implemented by the other Cinder crates.

pub mod cache;
pub mod error;
pub mod expr;
pub mod glob;
pub mod ids;
pub mod interpolation;
pub mod ports;
pub mod run;
pub mod secrets;
pub mod trigger;
pub mod workflow;

pub use error::{ConfigError, Error, Result};
pub use ids::*;
