//! Run outcomes, structured failures, and suspension state.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::echo::{CheckpointRecord, Echo};

/// Classification of a cell or cascade failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Invalid document, missing input, unknown cell reference.
    Configuration,
    /// Unknown tool, missing validator, unresolved template variable.
    Resolution,
    /// Ward or loop_until said no and budgets ran out.
    Validation,
    /// A deterministic tool raised.
    ToolExecution,
    /// Provider error or unparseable tool calls.
    LlmExecution,
    /// A tool exceeded its timeout.
    Timeout,
    /// The safety cap on cell invocations tripped.
    Runaway,
    /// A hook returned Abort.
    Aborted,
}

/// The structured failure object every terminal error produces.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CascadeFailure {
    pub cell_name: Option<String>,
    pub kind: FailureKind,
    pub reason: String,
    /// The last partial output the failing cell produced, when any exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_output: Option<Value>,
}

impl CascadeFailure {
    #[must_use]
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            cell_name: None,
            kind,
            reason: reason.into(),
            partial_output: None,
        }
    }

    #[must_use]
    pub fn in_cell(mut self, cell_name: &str) -> Self {
        self.cell_name = Some(cell_name.to_string());
        self
    }

    #[must_use]
    pub fn with_partial(mut self, output: Value) -> Self {
        self.partial_output = Some(output);
        self
    }
}

impl std::fmt::Display for CascadeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.cell_name {
            Some(cell) => write!(f, "cell '{cell}' failed ({:?}): {}", self.kind, self.reason),
            None => write!(f, "cascade failed ({:?}): {}", self.kind, self.reason),
        }
    }
}

/// How a human response re-enters the suspended cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMode {
    /// Inject the response and continue the turn loop.
    InjectAndContinue,
    /// The response selects a candidate winner.
    SelectWinner,
    /// The response answers a decision block and routes accordingly.
    Decision,
    /// The response acknowledges a screen or audible pause.
    Acknowledge,
}

/// Serialized suspension: everything needed to resume later, in this
/// process or another.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SuspendedSession {
    pub resume_token: String,
    pub session_id: String,
    pub cascade_id: String,
    pub echo: Echo,
    pub cell_name: String,
    pub resume_mode: ResumeMode,
    pub checkpoint: CheckpointRecord,
    pub input: Value,
}

/// Terminal result of `run` or `resume`.
#[derive(Clone, Debug)]
pub enum RunOutcome {
    Completed {
        session_id: String,
        /// Output of the final cell.
        output: Value,
        echo: Echo,
    },
    Suspended {
        session_id: String,
        resume_token: String,
        checkpoint: CheckpointRecord,
    },
    Failed {
        session_id: String,
        failure: CascadeFailure,
        echo: Echo,
    },
}

impl RunOutcome {
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            RunOutcome::Completed { session_id, .. }
            | RunOutcome::Suspended { session_id, .. }
            | RunOutcome::Failed { session_id, .. } => session_id,
        }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed { .. })
    }
}

/// Errors surfaced to the caller of the runner (as opposed to failures
/// recorded in the outcome).
#[derive(Debug, Error, Diagnostic)]
pub enum RunnerError {
    #[error(transparent)]
    #[diagnostic(code(rvbbit::runner::cascade))]
    Cascade(#[from] crate::cascade::CascadeError),

    #[error("no suspended session for resume token '{token}'")]
    #[diagnostic(
        code(rvbbit::runner::unknown_token),
        help("Resume tokens are returned in the Suspended outcome and are single-use.")
    )]
    UnknownToken { token: String },

    #[error("checkpoint store error: {0}")]
    #[diagnostic(code(rvbbit::runner::checkpoint_store))]
    CheckpointStore(String),

    #[error("log store error: {0}")]
    #[diagnostic(code(rvbbit::runner::log))]
    Log(#[from] crate::log::LogStoreError),
}
