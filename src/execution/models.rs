use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Plan steps ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    #[default]
    Task,
    ApprovalGate,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::ApprovalGate => "approval_gate",
        }
    }
}

/// One step of an immutable plan snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStep {
    pub order: u32,
    pub action: String,
    #[serde(default)]
    pub expected_outcome: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub step_type: StepType,
}

impl PlanStep {
    pub fn task(order: u32, action: &str) -> Self {
        Self {
            order,
            action: action.to_string(),
            expected_outcome: None,
            tool: None,
            step_type: StepType::Task,
        }
    }

    pub fn gate(order: u32, action: &str) -> Self {
        Self {
            step_type: StepType::ApprovalGate,
            ..Self::task(order, action)
        }
    }

    pub fn is_gate(&self) -> bool {
        self.step_type == StepType::ApprovalGate
    }
}

/// Check that a plan is non-empty, its orders are positive and strictly increasing.
pub fn validate_plan(steps: &[PlanStep]) -> Result<(), String> {
    if steps.is_empty() {
        return Err("plan has no steps".to_string());
    }
    let mut previous: Option<u32> = None;
    for step in steps {
        if step.order == 0 {
            return Err("step orders must be positive".to_string());
        }
        if let Some(prev) = previous
            && step.order <= prev
        {
            return Err(format!(
                "step orders must be strictly increasing ({} follows {})",
                step.order, prev
            ));
        }
        if step.action.trim().is_empty() {
            return Err(format!("step {} has an empty action", step.order));
        }
        previous = Some(step.order);
    }
    Ok(())
}

// ── Runs ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    PausedGate,
    PausedDetached,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::PausedGate => "paused_gate",
            Self::PausedDetached => "paused_detached",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Statuses that count against the one-active-run-per-session invariant.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::PausedGate | Self::PausedDetached)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "paused_gate" => Ok(Self::PausedGate),
            "paused_detached" => Ok(Self::PausedDetached),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub session_id: String,
    pub agent_id: String,
    pub status: RunStatus,
    pub plan: Vec<PlanStep>,
    pub current_step_order: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn total_steps(&self) -> usize {
        self.plan.len()
    }

    pub fn step(&self, order: u32) -> Option<&PlanStep> {
        self.plan.iter().find(|s| s.order == order)
    }
}

// ── Step execution records ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid record status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    pub run_id: String,
    pub step_order: u32,
    pub status: RecordStatus,
    pub source: Option<String>,
    pub model: Option<String>,
    pub duration_ms: Option<u64>,
    pub tool_calls: Vec<ToolCall>,
    pub full_output: String,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Final outcome written into a record when its step ends.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub status: RecordStatus,
    pub model: Option<String>,
    pub duration_ms: u64,
    pub tool_calls: Vec<ToolCall>,
    pub full_output: String,
    pub error: Option<String>,
}

impl StepOutcome {
    pub fn completed(full_output: String, tool_calls: Vec<ToolCall>, duration_ms: u64) -> Self {
        Self {
            status: RecordStatus::Completed,
            model: None,
            duration_ms,
            tool_calls,
            full_output,
            error: None,
        }
    }

    pub fn failed(error: String, full_output: String, duration_ms: u64) -> Self {
        Self {
            status: RecordStatus::Failed,
            model: None,
            duration_ms,
            tool_calls: Vec::new(),
            full_output,
            error: Some(error),
        }
    }
}

/// Lowest step order in `plan` that has no terminal record.
///
/// Returns `None` when every step already has a completed or failed record.
pub fn next_step_order(plan: &[PlanStep], records: &[StepExecutionRecord]) -> Option<u32> {
    plan.iter()
        .map(|step| step.order)
        .find(|order| {
            !records
                .iter()
                .any(|r| r.step_order == *order && r.status.is_terminal())
        })
}

// ── Gates ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Waiting,
    Approved,
    Rejected,
}

impl GateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for GateStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Invalid gate status: {}", s)),
        }
    }
}

/// A human decision on a waiting gate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Approved,
    Rejected,
}

impl GateDecision {
    pub fn from_approved(approved: bool) -> Self {
        if approved { Self::Approved } else { Self::Rejected }
    }

    pub fn status(&self) -> GateStatus {
        match self {
            Self::Approved => GateStatus::Approved,
            Self::Rejected => GateStatus::Rejected,
        }
    }
}

impl FromStr for GateDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "approved" | "approve" => Ok(Self::Approved),
            "rejected" | "reject" => Ok(Self::Rejected),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gate {
    pub id: String,
    pub run_id: String,
    pub step_order: u32,
    pub status: GateStatus,
    pub resolved_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

// ── Activity ─────────────────────────────────────────────────────────

/// Append-only audit record broadcast to ambient observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub summary: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ActivityEvent {
    pub fn new(event_type: &str, summary: impl Into<String>, metadata: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            summary: summary.into(),
            metadata,
        }
    }
}

// ── Sessions & query views ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub agent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResults {
    pub run_id: String,
    pub run_status: RunStatus,
    pub steps: Vec<StepExecutionRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReactivationStatus {
    pub can_reactivate: bool,
    pub next_step_order: Option<u32>,
    pub pending_gate_id: Option<String>,
    pub pending_gate_step_order: Option<u32>,
    pub message: String,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub run_status: Option<RunStatus>,
}

impl ReactivationStatus {
    pub fn idle(message: &str) -> Self {
        Self {
            can_reactivate: false,
            next_step_order: None,
            pending_gate_id: None,
            pending_gate_step_order: None,
            message: message.to_string(),
            run_id: None,
            run_status: None,
        }
    }
}
