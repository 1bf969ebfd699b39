//! Step runners for Cinder.
//!
//! [`ShellRunner`] executes `run` steps as host processes. [`DryRunner`] records what
//! would run without touching the host.

pub mod dry_run;
pub mod runner;
pub mod shell;

pub use dry_run::DryRunner;
pub use cinder_core::ports::{OutputLine, OutputStream};
pub use runner::{RunnerConfig, parse_outputs, shell_command};
pub use shell::ShellRunner;
