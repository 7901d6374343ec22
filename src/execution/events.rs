use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::models::{GateStatus, RecordStatus, StepType, ToolCall};

/// Events pushed on a run's dedicated stream, in transition order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    RunStarted {
        timestamp: DateTime<Utc>,
        run_id: String,
        session_id: String,
        agent_id: String,
        started_at: DateTime<Utc>,
        resumed_from: Option<u32>,
    },
    StepStarted {
        timestamp: DateTime<Utc>,
        step_order: u32,
        action: String,
        expected_outcome: Option<String>,
        tool: Option<String>,
        step_type: StepType,
    },
    StepOutputChunk {
        timestamp: DateTime<Utc>,
        step_order: u32,
        chunk: String,
    },
    StepCompleted {
        timestamp: DateTime<Utc>,
        step_order: u32,
        status: RecordStatus,
        source: String,
        model: Option<String>,
        duration_ms: u64,
        full_output: String,
        tool_calls: Vec<ToolCall>,
    },
    StepFailed {
        timestamp: DateTime<Utc>,
        step_order: u32,
        error: String,
    },
    GateWaiting {
        timestamp: DateTime<Utc>,
        gate_id: String,
        step_order: u32,
        action: String,
    },
    GateResolved {
        timestamp: DateTime<Utc>,
        gate_id: String,
        step_order: u32,
        status: GateStatus,
    },
    RunPaused {
        timestamp: DateTime<Utc>,
        next_step_order: Option<u32>,
        gate_id: Option<String>,
        step_order: Option<u32>,
        message: String,
    },
    RunCompleted {
        timestamp: DateTime<Utc>,
        completed_steps: usize,
        total_steps: usize,
        duration_ms: u64,
    },
    RunError {
        timestamp: DateTime<Utc>,
        error: String,
    },
}

impl ExecutionEvent {
    /// Wire name of the event, also used as the SSE `event:` field.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::StepStarted { .. } => "step_started",
            Self::StepOutputChunk { .. } => "step_output_chunk",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::GateWaiting { .. } => "gate_waiting",
            Self::GateResolved { .. } => "gate_resolved",
            Self::RunPaused { .. } => "run_paused",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunError { .. } => "run_error",
        }
    }

    pub fn run_error(error: impl Into<String>) -> Self {
        Self::RunError {
            timestamp: Utc::now(),
            error: error.into(),
        }
    }
}

/// Engine side of a run's dedicated stream.
///
/// Delivery is best effort. Once the consumer is gone the sender is marked
/// detached and further events are dropped; the run itself keeps going.
pub struct StreamSender {
    tx: mpsc::Sender<ExecutionEvent>,
    detached: bool,
}

/// Consumer side of a run's dedicated stream.
#[derive(Debug)]
pub struct RunStream {
    pub run_id: String,
    pub receiver: mpsc::Receiver<ExecutionEvent>,
}

/// Create the single stream attached to one engine instance.
pub fn stream_channel(run_id: &str, buffer: usize) -> (StreamSender, RunStream) {
    let (tx, receiver) = mpsc::channel(buffer.max(1));
    (
        StreamSender {
            tx,
            detached: false,
        },
        RunStream {
            run_id: run_id.to_string(),
            receiver,
        },
    )
}

impl StreamSender {
    /// Push an event. Returns false when the stream has no consumer any more.
    pub async fn emit(&mut self, event: ExecutionEvent) -> bool {
        if self.detached {
            return false;
        }
        if self.tx.send(event).await.is_err() {
            tracing::info!("execution stream consumer went away; continuing detached");
            self.detached = true;
        }
        !self.detached
    }

    /// Resolves once the consumer has dropped its receiver.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}
