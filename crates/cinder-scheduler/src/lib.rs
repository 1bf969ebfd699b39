//! Cinder Scheduler
//!
//! Trigger evaluation, matrix expansion, dependency graphs, the run scheduler and the
//! per-job step executor.

pub mod context;
pub mod dag;
pub mod engine;
pub mod executor;
pub mod groups;
pub mod matrix;
pub mod queue;
pub mod repository;
pub mod retry;
pub mod scheduler;
pub mod triggers;

pub use context::RunContext;
pub use dag::DependencyGraph;
pub use engine::{Engine, RunHandle};
pub use executor::{ExecutorConfig, StepExecutor};
pub use matrix::MatrixExpander;
pub use retry::RetryPolicy;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use triggers::{SystemClock, TriggerEvaluator};
