use super::engine::{ExecutionEngine, ExecutionRequest};
use super::events::RunStream;
use super::models::{GateStatus, ReactivationStatus, RunStatus, next_step_order};
use crate::errors::ExecutionError;

/// Answers "can this run continue, and from where" from persisted state only,
/// and re-attaches a fresh stream to a stalled run.
#[derive(Clone)]
pub struct ReactivationCoordinator {
    engine: ExecutionEngine,
}

impl ReactivationCoordinator {
    pub fn new(engine: ExecutionEngine) -> Self {
        Self { engine }
    }

    pub async fn status(&self, session_id: &str) -> Result<ReactivationStatus, ExecutionError> {
        self.engine.require_session(session_id)?;
        let Some(run) = self.engine.latest_run(session_id).await? else {
            return Ok(ReactivationStatus::idle(
                "No execution run has been started for this session",
            ));
        };

        let run_id = run.id.clone();
        let plan = run.plan.clone();
        let (records, pending_gate, decided_gate) = self
            .engine
            .db()
            .call(move |db| {
                let records = db.list_step_records(&run_id)?;
                let pending = db.pending_gate_for_run(&run_id)?;
                // A gate step whose decision landed but whose record was never finalized
                let decided = match next_step_order(&plan, &records) {
                    Some(order) => db
                        .gate_for_step(&run_id, order)?
                        .filter(|g| g.status != GateStatus::Waiting),
                    None => None,
                };
                Ok((records, pending, decided))
            })
            .await
            .map_err(ExecutionError::Storage)?;
        let next = next_step_order(&run.plan, &records);
        let live = self.engine.registry().is_live(&run.id);

        let (can_reactivate, message) = match run.status {
            RunStatus::Completed => (false, "Run completed".to_string()),
            RunStatus::Failed => (false, "Run failed; start a new run to retry".to_string()),
            _ if live => (false, "Run is attached to a live stream".to_string()),
            _ if pending_gate.is_some() => (
                false,
                format!(
                    "Waiting for approval at step {}; resolve the gate to continue",
                    pending_gate.as_ref().map(|g| g.step_order).unwrap_or_default()
                ),
            ),
            _ if decided_gate.as_ref().is_some_and(|g| g.status == GateStatus::Rejected) => (
                false,
                format!(
                    "Gate at step {} was rejected; start a new run to retry",
                    decided_gate.as_ref().map(|g| g.step_order).unwrap_or_default()
                ),
            ),
            _ => match next {
                Some(order) => (true, format!("Run can resume from step {}", order)),
                None => (false, "All steps have final records; start a new run".to_string()),
            },
        };

        Ok(ReactivationStatus {
            can_reactivate,
            next_step_order: next,
            pending_gate_id: pending_gate.as_ref().map(|g| g.id.clone()),
            pending_gate_step_order: pending_gate.as_ref().map(|g| g.step_order),
            message,
            run_id: Some(run.id),
            run_status: Some(run.status),
        })
    }

    /// Resume the session's stalled run from its next step on a new stream.
    pub async fn resume(&self, session_id: &str) -> Result<RunStream, ExecutionError> {
        let status = self.status(session_id).await?;
        if let (Some(gate_id), Some(step_order)) =
            (status.pending_gate_id.clone(), status.pending_gate_step_order)
        {
            return Err(ExecutionError::GatePending { gate_id, step_order });
        }
        if !status.can_reactivate {
            return Err(ExecutionError::NotReactivatable(status.message));
        }
        tracing::info!(session_id, next_step_order = ?status.next_step_order, "reactivating run");
        self.engine
            .start_or_resume(ExecutionRequest {
                session_id: session_id.to_string(),
                steps: Vec::new(),
                continue_from_step_order: status.next_step_order,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::activity::ActivityPublisher;
    use crate::execution::db::{DbHandle, ExecutionDb};
    use crate::execution::engine::EngineSettings;
    use crate::execution::executor::MockExecutor;
    use crate::execution::models::{PlanStep, StepOutcome};
    use crate::execution::sessions::InMemorySessions;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;

    fn setup() -> (ReactivationCoordinator, ExecutionEngine, String) {
        let db = DbHandle::new(ExecutionDb::new_in_memory().unwrap());
        let (tx, _) = broadcast::channel(64);
        let activity = ActivityPublisher::new(db.clone(), tx);
        let sessions = Arc::new(InMemorySessions::new());
        let session = sessions.create("t", None).unwrap().id;
        let engine = ExecutionEngine::new(
            db,
            Arc::new(MockExecutor::new(Duration::ZERO)),
            sessions,
            activity,
            EngineSettings::default(),
        );
        (ReactivationCoordinator::new(engine.clone()), engine, session)
    }

    /// Two completed steps of a three step plan, left detached.
    async fn seed_detached(engine: &ExecutionEngine, session: &str) {
        let sid = session.to_string();
        engine
            .db()
            .call(move |db| {
                db.create_run(
                    "r-1",
                    &sid,
                    "agent",
                    &[PlanStep::task(1, "a"), PlanStep::task(2, "b"), PlanStep::task(3, "c")],
                )?;
                for order in [1, 2] {
                    db.begin_step_record("r-1", order, "mock")?;
                    db.finalize_step_record("r-1", order, &StepOutcome::completed("x".into(), vec![], 1))?;
                }
                db.update_run_status("r-1", RunStatus::PausedDetached, Some(2))?;
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_status_without_any_run_is_idle_and_idempotent() {
        let (coordinator, _engine, session) = setup();
        let first = coordinator.status(&session).await.unwrap();
        let second = coordinator.status(&session).await.unwrap();
        assert!(!first.can_reactivate);
        assert!(first.next_step_order.is_none());
        assert!(first.pending_gate_id.is_none());
        assert!(first.pending_gate_step_order.is_none());
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_status_unknown_session() {
        let (coordinator, _engine, _session) = setup();
        assert!(matches!(
            coordinator.status("gone").await.unwrap_err(),
            ExecutionError::SessionNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_detached_run_reports_next_step() {
        let (coordinator, engine, session) = setup();
        seed_detached(&engine, &session).await;
        let status = coordinator.status(&session).await.unwrap();
        assert!(status.can_reactivate);
        assert_eq!(status.next_step_order, Some(3));
        assert_eq!(status.run_status, Some(RunStatus::PausedDetached));
    }

    #[tokio::test]
    async fn test_resume_runs_only_remaining_steps() {
        let (coordinator, engine, session) = setup();
        seed_detached(&engine, &session).await;
        let before = engine.results(&session).await.unwrap();

        let mut stream = coordinator.resume(&session).await.unwrap();
        let mut started = Vec::new();
        while let Some(event) = stream.receiver.recv().await {
            if let crate::execution::events::ExecutionEvent::StepStarted { step_order, .. } = event {
                started.push(step_order);
            }
        }
        assert_eq!(started, vec![3]);

        let after = engine.results(&session).await.unwrap();
        assert_eq!(after.run_status, RunStatus::Completed);
        assert_eq!(after.steps.len(), 3);
        // Earlier records untouched
        assert_eq!(after.steps[0].completed_at, before.steps[0].completed_at);
        assert_eq!(after.steps[1].started_at, before.steps[1].started_at);

        let status = coordinator.status(&session).await.unwrap();
        assert!(!status.can_reactivate);
        assert!(matches!(
            coordinator.resume(&session).await.unwrap_err(),
            ExecutionError::NotReactivatable(_)
        ));
    }

    #[tokio::test]
    async fn test_pending_gate_is_reported_and_blocks_resume() {
        let (coordinator, engine, session) = setup();
        let sid = session.clone();
        engine
            .db()
            .call(move |db| {
                db.create_run("r-1", &sid, "agent", &[PlanStep::gate(1, "review")])?;
                db.begin_step_record("r-1", 1, "approval_gate")?;
                db.create_gate("g-1", "r-1", 1)?;
                db.update_run_status("r-1", RunStatus::PausedGate, Some(1))?;
                Ok(())
            })
            .await
            .unwrap();

        let status = coordinator.status(&session).await.unwrap();
        assert!(!status.can_reactivate);
        assert_eq!(status.pending_gate_id.as_deref(), Some("g-1"));
        assert_eq!(status.pending_gate_step_order, Some(1));
        assert_eq!(status.next_step_order, Some(1));

        assert!(matches!(
            coordinator.resume(&session).await.unwrap_err(),
            ExecutionError::GatePending { .. }
        ));
    }

    /// Gate decided in the store while its step record is still `running`,
    /// as left behind by an engine that died right after the hand-off.
    async fn seed_decided_gate(engine: &ExecutionEngine, session: &str, status: GateStatus) {
        let sid = session.to_string();
        engine
            .db()
            .call(move |db| {
                db.create_run(
                    "r-1",
                    &sid,
                    "agent",
                    &[PlanStep::gate(1, "review"), PlanStep::task(2, "publish")],
                )?;
                db.begin_step_record("r-1", 1, "approval_gate")?;
                db.create_gate("g-1", "r-1", 1)?;
                db.resolve_gate("g-1", status, "alice")?;
                db.update_run_status("r-1", RunStatus::PausedDetached, Some(1))?;
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_resume_after_unrecorded_approval_does_not_ask_again() {
        let (coordinator, engine, session) = setup();
        seed_decided_gate(&engine, &session, GateStatus::Approved).await;

        let status = coordinator.status(&session).await.unwrap();
        assert!(status.can_reactivate);
        assert_eq!(status.next_step_order, Some(1));
        assert!(status.pending_gate_id.is_none());

        let mut stream = coordinator.resume(&session).await.unwrap();
        let mut names = Vec::new();
        while let Some(event) = stream.receiver.recv().await {
            names.push(event.event_name());
        }
        assert!(!names.contains(&"gate_waiting"));
        assert!(names.contains(&"gate_resolved"));
        assert_eq!(names.last(), Some(&"run_completed"));

        let results = engine.results(&session).await.unwrap();
        assert_eq!(results.run_status, RunStatus::Completed);
        assert_eq!(results.steps.len(), 2);
        let (pending, latest) = engine
            .db()
            .call(|db| Ok((db.pending_gate_for_run("r-1")?, db.gate_for_step("r-1", 1)?)))
            .await
            .unwrap();
        assert!(pending.is_none());
        assert_eq!(latest.unwrap().id, "g-1");
    }

    #[tokio::test]
    async fn test_unrecorded_rejection_refuses_reactivation() {
        let (coordinator, engine, session) = setup();
        seed_decided_gate(&engine, &session, GateStatus::Rejected).await;

        let status = coordinator.status(&session).await.unwrap();
        assert!(!status.can_reactivate);
        assert!(status.message.contains("rejected"));
        assert!(matches!(
            coordinator.resume(&session).await.unwrap_err(),
            ExecutionError::NotReactivatable(_)
        ));

        // An explicit continuation settles the stored rejection instead of reopening the gate
        let mut stream = engine
            .start_or_resume(ExecutionRequest {
                session_id: session.clone(),
                steps: Vec::new(),
                continue_from_step_order: Some(1),
            })
            .await
            .unwrap();
        let mut names = Vec::new();
        while let Some(event) = stream.receiver.recv().await {
            names.push(event.event_name());
        }
        assert!(!names.contains(&"gate_waiting"));
        assert_eq!(names.last(), Some(&"run_error"));

        let results = engine.results(&session).await.unwrap();
        assert_eq!(results.run_status, RunStatus::Failed);
        assert_eq!(results.steps.len(), 1);
        assert_eq!(results.steps[0].status, crate::execution::models::RecordStatus::Failed);
    }
}
