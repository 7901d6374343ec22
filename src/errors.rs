//! Typed error hierarchy for the plan runner.
//!
//! Two top-level enums cover the two failure domains:
//! - `ExecutionError`: orchestration failures (caller errors, conflicts, storage)
//! - `ExecutorError`: failures of the external executor while running a task step

use thiserror::Error;

/// Errors from the orchestration surface (engine, gate registry, reactivation).
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Session id must be a non-empty string")]
    InvalidSessionId,

    #[error("Session {session_id} not found")]
    SessionNotFound { session_id: String },

    #[error("No execution run found for session {session_id}")]
    NoActiveRun { session_id: String },

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Submitted steps do not match the plan snapshot of run {run_id}")]
    PlanMismatch { run_id: String },

    #[error(
        "Ambiguous resume point: requested step {requested}, expected {}",
        describe_order(.expected)
    )]
    AmbiguousResume {
        requested: u32,
        expected: Option<u32>,
    },

    #[error("Run {run_id} is already active for session {session_id}")]
    RunAlreadyActive { session_id: String, run_id: String },

    #[error("Gate {gate_id} not found")]
    GateNotFound { gate_id: String },

    #[error("Gate {gate_id} was already resolved as {status}")]
    GateAlreadyResolved { gate_id: String, status: String },

    #[error("Gate {gate_id} at step {step_order} is still waiting for a decision")]
    GatePending { gate_id: String, step_order: u32 },

    #[error("Invalid gate decision '{0}': expected 'approved' or 'rejected'")]
    InvalidDecision(String),

    #[error("Run cannot be reactivated: {0}")]
    NotReactivatable(String),

    #[error("Storage error: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("Run registry lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExecutionError {
    /// Caller errors are rejected before any state mutation and map to 4xx responses.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidSessionId
                | Self::InvalidPlan(_)
                | Self::PlanMismatch { .. }
                | Self::AmbiguousResume { .. }
                | Self::InvalidDecision(_)
        )
    }

    /// Not-found kinds. Callers treat `session_not_found` as fatal to their
    /// cached reference and `no_active_run` as an idle state.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::SessionNotFound { .. } | Self::NoActiveRun { .. } | Self::GateNotFound { .. }
        )
    }

    /// Conflicts with the current state of a run or gate.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::RunAlreadyActive { .. }
                | Self::GateAlreadyResolved { .. }
                | Self::GatePending { .. }
                | Self::NotReactivatable(_)
        )
    }

    /// Machine-readable code sent to HTTP clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSessionId => "invalid_session_id",
            Self::SessionNotFound { .. } => "session_not_found",
            Self::NoActiveRun { .. } => "no_active_run",
            Self::InvalidPlan(_) => "invalid_plan",
            Self::PlanMismatch { .. } => "plan_mismatch",
            Self::AmbiguousResume { .. } => "ambiguous_resume",
            Self::RunAlreadyActive { .. } => "run_already_active",
            Self::GateNotFound { .. } => "gate_not_found",
            Self::GateAlreadyResolved { .. } => "gate_already_resolved",
            Self::GatePending { .. } => "gate_pending",
            Self::InvalidDecision(_) => "invalid_decision",
            Self::NotReactivatable(_) => "not_reactivatable",
            Self::Storage(_) | Self::LockPoisoned | Self::Other(_) => "internal",
        }
    }
}

fn describe_order(order: &Option<u32>) -> String {
    order.map(|o| o.to_string()).unwrap_or_else(|| "none".to_string())
}

/// Errors from a single executor invocation. The display text is what gets
/// preserved in the failed step record.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Failed to spawn executor command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Executor exited with code {exit_code}: {stderr}")]
    NonZeroExit { exit_code: i32, stderr: String },

    #[error("{0}")]
    Failed(String),

    #[error("Executor I/O error: {0}")]
    Io(#[from] std::io::Error),
}
