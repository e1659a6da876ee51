//! Cascade execution: services, hooks, cell executors, and the runner.

mod checkpoint;
mod deterministic;
mod hooks;
mod llm_cell;
mod outcome;
#[allow(clippy::module_inception)]
mod runner;
mod services;

pub use checkpoint::{CheckpointStore, InMemoryCheckpointStore};
#[cfg(feature = "sqlite")]
pub use checkpoint::SqliteCheckpointStore;
pub use deterministic::determine_routing;
pub use hooks::{CascadeHooks, CompositeHooks, HookAction, NoHooks};
pub use llm_cell::{extract_decision, parse_output, DecisionBlock};
pub use outcome::{
    CascadeFailure, FailureKind, ResumeMode, RunOutcome, RunnerError, SuspendedSession,
};
pub use runner::CascadeRunner;
pub use services::Services;
