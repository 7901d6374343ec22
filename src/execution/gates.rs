use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, oneshot};
use uuid::Uuid;

use super::activity::ActivityPublisher;
use super::db::{DbHandle, GateTransition};
use super::models::{Gate, GateDecision, GateStatus, RunStatus, StepOutcome};
use crate::errors::ExecutionError;

/// Source recorded on the step record of an approval gate.
pub const GATE_SOURCE: &str = "approval_gate";

/// Decision delivered to the engine parked on a gate.
#[derive(Debug, Clone)]
pub struct GateResolution {
    pub status: GateStatus,
    pub resolved_by: String,
}

/// A freshly opened gate and the channel its decision arrives on.
pub struct GateWait {
    pub gate: Gate,
    pub decision: oneshot::Receiver<GateResolution>,
}

/// Tracks approval checkpoints and hands decisions to parked engines.
///
/// The waiter map and the store transition are updated under one lock, so a
/// resolution is either delivered to a live engine or applied offline, never
/// both and never neither.
pub struct GateRegistry {
    db: DbHandle,
    activity: ActivityPublisher,
    waiters: Mutex<HashMap<String, oneshot::Sender<GateResolution>>>,
}

impl GateRegistry {
    pub fn new(db: DbHandle, activity: ActivityPublisher) -> Arc<Self> {
        Arc::new(Self {
            db,
            activity,
            waiters: Mutex::new(HashMap::new()),
        })
    }

    /// Create a `waiting` gate for `run_id` at `step_order` and register the caller as its waiter.
    pub async fn open_gate(&self, run_id: &str, step_order: u32) -> Result<GateWait, ExecutionError> {
        let mut waiters = self.waiters.lock().await;
        let gate_id = Uuid::new_v4().to_string();
        let run = run_id.to_string();
        let gate = self
            .db
            .call(move |db| db.create_gate(&gate_id, &run, step_order))
            .await
            .map_err(ExecutionError::Storage)?;
        let (tx, rx) = oneshot::channel();
        waiters.insert(gate.id.clone(), tx);
        tracing::info!(gate_id = %gate.id, run_id, step_order, "gate waiting");
        Ok(GateWait { gate, decision: rx })
    }

    /// Stop waiting on a gate whose stream went away.
    ///
    /// Returns false when a decision was already handed over, in which case the
    /// caller must still consume it.
    pub async fn withdraw(&self, gate_id: &str) -> bool {
        self.waiters.lock().await.remove(gate_id).is_some()
    }

    /// Resolve a gate exactly once.
    ///
    /// A parked engine is signalled directly. With no engine attached the
    /// decision is applied to the store: approval leaves the run
    /// `paused_detached` for reactivation, rejection fails it.
    pub async fn resolve(
        &self,
        gate_id: &str,
        decision: GateDecision,
        resolved_by: &str,
    ) -> Result<Gate, ExecutionError> {
        let mut waiters = self.waiters.lock().await;

        let id = gate_id.to_string();
        let by = resolved_by.to_string();
        let status = decision.status();
        let gate = match self
            .db
            .call(move |db| db.resolve_gate(&id, status, &by))
            .await
            .map_err(ExecutionError::Storage)?
        {
            GateTransition::Resolved(gate) => gate,
            GateTransition::AlreadyResolved(gate) => {
                return Err(ExecutionError::GateAlreadyResolved {
                    gate_id: gate.id,
                    status: gate.status.as_str().to_string(),
                });
            }
            GateTransition::NotFound => {
                return Err(ExecutionError::GateNotFound {
                    gate_id: gate_id.to_string(),
                });
            }
        };

        let resolution = GateResolution {
            status,
            resolved_by: resolved_by.to_string(),
        };
        let delivered = match waiters.remove(gate_id) {
            Some(tx) => tx.send(resolution).is_ok(),
            None => false,
        };
        drop(waiters);

        tracing::info!(gate_id, status = status.as_str(), resolved_by, delivered, "gate resolved");
        if !delivered {
            self.apply_offline(&gate).await?;
        }

        self.activity
            .publish(
                "gate_resolved",
                format!("Gate at step {} {} by {}", gate.step_order, status.as_str(), resolved_by),
                serde_json::json!({
                    "gate_id": gate.id,
                    "run_id": gate.run_id,
                    "step_order": gate.step_order,
                    "status": status,
                    "resolved_by": resolved_by,
                    "delivered": delivered,
                }),
            )
            .await;
        Ok(gate)
    }

    /// Record a decision nobody was waiting for.
    async fn apply_offline(&self, gate: &Gate) -> Result<(), ExecutionError> {
        let gate = gate.clone();
        self.db
            .call(move |db| {
                let record = db.get_step_record(&gate.run_id, gate.step_order)?;
                if let Some(record) = record.filter(|r| !r.status.is_terminal()) {
                    let outcome = gate_outcome(
                        gate.status,
                        gate.resolved_by.as_deref().unwrap_or("unknown"),
                        record.started_at,
                    );
                    db.finalize_step_record(&gate.run_id, gate.step_order, &outcome)?;
                }
                if let Some(run) = db.get_run(&gate.run_id)?
                    && run.status.is_active()
                {
                    let next = match gate.status {
                        GateStatus::Approved => RunStatus::PausedDetached,
                        _ => RunStatus::Failed,
                    };
                    db.update_run_status(&gate.run_id, next, Some(gate.step_order))?;
                }
                Ok(())
            })
            .await
            .map_err(ExecutionError::Storage)
    }
}

/// Final record for a gate step given its decision.
pub fn gate_outcome(
    status: GateStatus,
    resolved_by: &str,
    started_at: Option<DateTime<Utc>>,
) -> StepOutcome {
    let duration_ms = started_at
        .map(|t| (Utc::now() - t).num_milliseconds().max(0) as u64)
        .unwrap_or(0);
    match status {
        GateStatus::Rejected => StepOutcome::failed(
            format!("Gate rejected by {}", resolved_by),
            String::new(),
            duration_ms,
        ),
        _ => StepOutcome::completed(format!("Approved by {}", resolved_by), Vec::new(), duration_ms),
    }
}
