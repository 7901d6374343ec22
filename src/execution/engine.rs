//! The execution engine: drives one run through its steps.
//!
//! ## Lifecycle
//!
//! `start_or_resume` validates the request and claims the run synchronously,
//! so every caller error and ownership conflict is reported before any state
//! changes. The run itself is then driven by a spawned task that owns the
//! [`RunLease`] and the engine side of the run's stream:
//!
//! ```text
//! running ──task ok──> running ──...──> completed
//!    │  └──task err──> failed
//!    └──gate──> paused_gate ──approved──> running
//!                   │    └──rejected──> failed
//!                   └──stream gone──> (engine exits, gate stays waiting)
//! ```
//!
//! Events are emitted strictly in transition order. A dropped stream never
//! fails a run: task steps keep executing until the next gate.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::activity::ActivityPublisher;
use super::db::DbHandle;
use super::events::{ExecutionEvent, RunStream, StreamSender, stream_channel};
use super::executor::{StepExecutor, StepRequest};
use super::gates::{GATE_SOURCE, GateRegistry, GateResolution, gate_outcome};
use super::models::*;
use super::ownership::{RunLease, RunRegistry};
use super::sessions::SessionDirectory;
use crate::errors::ExecutionError;

/// A request to start a run, or continue the active one.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    pub session_id: String,
    /// Plan snapshot. May be empty for a continuation.
    pub steps: Vec<PlanStep>,
    pub continue_from_step_order: Option<u32>,
}

/// Engine-wide settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub agent_id: String,
    pub event_buffer: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            agent_id: "agent-execution".to_string(),
            event_buffer: 64,
        }
    }
}

#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    db: DbHandle,
    gates: Arc<GateRegistry>,
    registry: Arc<RunRegistry>,
    executor: Arc<dyn StepExecutor>,
    activity: ActivityPublisher,
    sessions: Arc<dyn SessionDirectory>,
    settings: EngineSettings,
}

/// How a gate step ended for the driving task.
enum GateFlow {
    Continue,
    Halt,
}

impl ExecutionEngine {
    pub fn new(
        db: DbHandle,
        executor: Arc<dyn StepExecutor>,
        sessions: Arc<dyn SessionDirectory>,
        activity: ActivityPublisher,
        settings: EngineSettings,
    ) -> Self {
        let gates = GateRegistry::new(db.clone(), activity.clone());
        Self {
            inner: Arc::new(EngineInner {
                db,
                gates,
                registry: RunRegistry::new(),
                executor,
                activity,
                sessions,
                settings,
            }),
        }
    }

    pub fn db(&self) -> &DbHandle {
        &self.inner.db
    }

    pub fn gates(&self) -> &Arc<GateRegistry> {
        &self.inner.gates
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.inner.registry
    }

    pub fn activity(&self) -> &ActivityPublisher {
        &self.inner.activity
    }

    pub fn sessions(&self) -> &Arc<dyn SessionDirectory> {
        &self.inner.sessions
    }

    /// Check the session id and that the session still exists.
    pub fn require_session(&self, session_id: &str) -> Result<Session, ExecutionError> {
        if session_id.trim().is_empty() {
            return Err(ExecutionError::InvalidSessionId);
        }
        self.inner
            .sessions
            .get(session_id)?
            .ok_or_else(|| ExecutionError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Most recent run for a session, if any.
    pub async fn latest_run(&self, session_id: &str) -> Result<Option<Run>, ExecutionError> {
        let session = session_id.to_string();
        self.inner
            .db
            .call(move |db| db.latest_run_for_session(&session))
            .await
            .map_err(ExecutionError::Storage)
    }

    /// Persisted records of the session's most recent run.
    pub async fn results(&self, session_id: &str) -> Result<ExecutionResults, ExecutionError> {
        self.require_session(session_id)?;
        let run = self
            .latest_run(session_id)
            .await?
            .ok_or_else(|| ExecutionError::NoActiveRun {
                session_id: session_id.to_string(),
            })?;
        let run_id = run.id.clone();
        let steps = self
            .inner
            .db
            .call(move |db| db.list_step_records(&run_id))
            .await
            .map_err(ExecutionError::Storage)?;
        Ok(ExecutionResults {
            run_id: run.id,
            run_status: run.status,
            steps,
        })
    }

    /// Move runs a previous process left `running` to `paused_detached`.
    pub async fn reconcile_orphans(&self) -> Result<Vec<String>, ExecutionError> {
        let moved = self
            .inner
            .db
            .call(|db| db.reconcile_orphaned_runs())
            .await
            .map_err(ExecutionError::Storage)?;
        for run_id in &moved {
            tracing::warn!(run_id = %run_id, "run was left running by a previous process; marked paused_detached");
            self.inner
                .activity
                .publish(
                    "run_detached",
                    format!("Run {} detached after restart", run_id),
                    serde_json::json!({ "run_id": run_id, "reason": "restart" }),
                )
                .await;
        }
        Ok(moved)
    }

    /// Start a new run for a session, or continue its active run.
    ///
    /// All validation and the ownership claim happen before this returns; the
    /// run is then driven in the background and reported on the returned stream.
    pub async fn start_or_resume(&self, request: ExecutionRequest) -> Result<RunStream, ExecutionError> {
        self.require_session(&request.session_id)?;
        if !request.steps.is_empty() {
            validate_plan(&request.steps).map_err(ExecutionError::InvalidPlan)?;
        }

        let (lease, run, from) = match request.continue_from_step_order {
            None => self.claim_new_run(&request).await?,
            Some(order) => self.claim_continuation(&request, order).await?,
        };

        let (sender, stream) = stream_channel(&run.id, self.inner.settings.event_buffer);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.drive(lease, run, from, sender).await;
        });
        Ok(stream)
    }

    async fn claim_new_run(
        &self,
        request: &ExecutionRequest,
    ) -> Result<(RunLease, Run, Option<u32>), ExecutionError> {
        if request.steps.is_empty() {
            return Err(ExecutionError::InvalidPlan("plan has no steps".to_string()));
        }
        let session_id = request.session_id.clone();
        let run_id = Uuid::new_v4().to_string();
        // Holding the session slot means no other engine can create or drive
        // a run for this session until the lease is dropped.
        let lease = self.inner.registry.claim(&run_id, &session_id)?;

        if let Some(active) = self.latest_run(&session_id).await?.filter(|r| r.status.is_active()) {
            if !self.finalize_if_exhausted(&active).await? {
                return Err(ExecutionError::RunAlreadyActive {
                    session_id,
                    run_id: active.id,
                });
            }
        }

        let agent_id = self.inner.settings.agent_id.clone();
        let steps = request.steps.clone();
        let run = self
            .inner
            .db
            .call(move |db| db.create_run(&run_id, &session_id, &agent_id, &steps))
            .await
            .map_err(ExecutionError::Storage)?;
        tracing::info!(run_id = %run.id, session_id = %run.session_id, steps = run.total_steps(), "run created");
        Ok((lease, run, None))
    }

    async fn claim_continuation(
        &self,
        request: &ExecutionRequest,
        requested: u32,
    ) -> Result<(RunLease, Run, Option<u32>), ExecutionError> {
        let session_id = request.session_id.clone();
        let candidate = self
            .latest_run(&session_id)
            .await?
            .filter(|r| r.status.is_active())
            .ok_or(ExecutionError::AmbiguousResume {
                requested,
                expected: None,
            })?;
        let lease = self.inner.registry.claim(&candidate.id, &session_id)?;

        // Re-read under the lease; a gate may have been resolved in between.
        let run_id = candidate.id.clone();
        let (run, records, pending_gate) = self
            .inner
            .db
            .call(move |db| {
                let run = db.get_run(&run_id)?;
                let records = db.list_step_records(&run_id)?;
                let gate = db.pending_gate_for_run(&run_id)?;
                Ok((run, records, gate))
            })
            .await
            .map_err(ExecutionError::Storage)?;
        let run = run
            .filter(|r| r.status.is_active())
            .ok_or(ExecutionError::AmbiguousResume {
                requested,
                expected: None,
            })?;

        if !request.steps.is_empty() {
            let submitted: Vec<u32> = request.steps.iter().map(|s| s.order).collect();
            let snapshot: Vec<u32> = run.plan.iter().map(|s| s.order).collect();
            if submitted != snapshot {
                return Err(ExecutionError::PlanMismatch { run_id: run.id });
            }
        }
        if let Some(gate) = pending_gate {
            return Err(ExecutionError::GatePending {
                gate_id: gate.id,
                step_order: gate.step_order,
            });
        }
        let expected = next_step_order(&run.plan, &records);
        if expected != Some(requested) {
            return Err(ExecutionError::AmbiguousResume { requested, expected });
        }

        let run_id = run.id.clone();
        let run = self
            .inner
            .db
            .call(move |db| db.update_run_status(&run_id, RunStatus::Running, Some(requested)))
            .await
            .map_err(ExecutionError::Storage)?;
        tracing::info!(run_id = %run.id, session_id = %run.session_id, from = requested, "run resumed");
        Ok((lease, run, Some(requested)))
    }

    /// Close out an active run whose every step already has a final record.
    async fn finalize_if_exhausted(&self, run: &Run) -> Result<bool, ExecutionError> {
        let run_id = run.id.clone();
        let plan = run.plan.clone();
        let finalized = self
            .inner
            .db
            .call(move |db| {
                let records = db.list_step_records(&run_id)?;
                if next_step_order(&plan, &records).is_some() {
                    return Ok(None);
                }
                let status = if records.iter().any(|r| r.status == RecordStatus::Failed) {
                    RunStatus::Failed
                } else {
                    RunStatus::Completed
                };
                db.update_run_status(&run_id, status, None).map(Some)
            })
            .await
            .map_err(ExecutionError::Storage)?;
        if let Some(run) = &finalized {
            tracing::info!(run_id = %run.id, status = run.status.as_str(), "finalized exhausted run");
        }
        Ok(finalized.is_some())
    }
}

impl EngineInner {
    /// Drive a claimed run to completion, failure, or a detached gate.
    async fn drive(self: Arc<Self>, lease: RunLease, run: Run, from: Option<u32>, mut stream: StreamSender) {
        let run_id = run.id.clone();
        if let Err(e) = self.drive_steps(&run, from, &mut stream).await {
            tracing::error!(run_id = %run_id, error = %e, "run interrupted by infrastructure error");
            stream.emit(ExecutionEvent::run_error(e.to_string())).await;
            let id = run_id.clone();
            let detached = self
                .db
                .call(move |db| match db.get_run(&id)? {
                    Some(r) if r.status.is_active() => {
                        db.update_run_status(&id, RunStatus::PausedDetached, None).map(|_| ())
                    }
                    _ => Ok(()),
                })
                .await;
            if let Err(e) = detached {
                tracing::error!(run_id = %run_id, error = %e, "failed to mark run detached");
            }
            self.activity
                .publish(
                    "run_detached",
                    format!("Run {} detached: {}", run_id, e),
                    serde_json::json!({ "run_id": run_id, "reason": e.to_string() }),
                )
                .await;
        }
        drop(lease);
    }

    async fn drive_steps(
        &self,
        run: &Run,
        from: Option<u32>,
        stream: &mut StreamSender,
    ) -> Result<(), ExecutionError> {
        stream
            .emit(ExecutionEvent::RunStarted {
                timestamp: Utc::now(),
                run_id: run.id.clone(),
                session_id: run.session_id.clone(),
                agent_id: run.agent_id.clone(),
                started_at: run.started_at,
                resumed_from: from,
            })
            .await;
        let (event_type, summary) = match from {
            Some(order) => ("run_resumed", format!("Run {} resumed from step {}", run.id, order)),
            None => ("run_started", format!("Run {} started with {} steps", run.id, run.total_steps())),
        };
        self.activity
            .publish(
                event_type,
                summary,
                serde_json::json!({
                    "run_id": run.id,
                    "session_id": run.session_id,
                    "agent_id": run.agent_id,
                    "resumed_from": from,
                }),
            )
            .await;

        let steps = run
            .plan
            .iter()
            .filter(|step| from.is_none_or(|f| step.order >= f));
        for step in steps {
            let proceed = if step.is_gate() {
                matches!(self.gate_step(run, step, stream).await?, GateFlow::Continue)
            } else {
                self.task_step(run, step, stream).await?
            };
            if !proceed {
                return Ok(());
            }
        }

        self.complete_run(run, stream).await
    }

    /// Run one task step. Returns false if the run failed.
    async fn task_step(
        &self,
        run: &Run,
        step: &PlanStep,
        stream: &mut StreamSender,
    ) -> Result<bool, ExecutionError> {
        let source = self.executor.source().to_string();
        let Some(_record) = self.begin_record(run, step, &source).await? else {
            return Ok(true);
        };

        stream
            .emit(ExecutionEvent::StepStarted {
                timestamp: Utc::now(),
                step_order: step.order,
                action: step.action.clone(),
                expected_outcome: step.expected_outcome.clone(),
                tool: step.tool.clone(),
                step_type: step.step_type,
            })
            .await;
        tracing::info!(run_id = %run.id, step_order = step.order, "step started");

        let request = StepRequest {
            run_id: run.id.clone(),
            session_id: run.session_id.clone(),
            step_order: step.order,
            action: step.action.clone(),
            expected_outcome: step.expected_outcome.clone(),
            tool: step.tool.clone(),
        };
        let started = Instant::now();
        let mut full_output = String::new();
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<String>();

        let result = {
            let execution = self.executor.execute(&request, chunk_tx);
            tokio::pin!(execution);
            loop {
                tokio::select! {
                    biased;
                    Some(chunk) = chunk_rx.recv() => {
                        full_output.push_str(&chunk);
                        stream.emit(chunk_event(step.order, chunk)).await;
                    }
                    result = &mut execution => break result,
                }
            }
        };
        // Chunks sent just before the executor returned
        while let Ok(chunk) = chunk_rx.try_recv() {
            full_output.push_str(&chunk);
            stream.emit(chunk_event(step.order, chunk)).await;
        }
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                if full_output.is_empty() && !output.output.is_empty() {
                    full_output = output.output.clone();
                    stream.emit(chunk_event(step.order, output.output)).await;
                }
                let mut outcome =
                    StepOutcome::completed(full_output.clone(), output.tool_calls.clone(), duration_ms);
                outcome.model = self.executor.model();
                self.finalize_record(run, step.order, outcome.clone()).await?;

                stream
                    .emit(ExecutionEvent::StepCompleted {
                        timestamp: Utc::now(),
                        step_order: step.order,
                        status: RecordStatus::Completed,
                        source,
                        model: outcome.model,
                        duration_ms,
                        full_output,
                        tool_calls: outcome.tool_calls,
                    })
                    .await;
                tracing::info!(run_id = %run.id, step_order = step.order, duration_ms, "step completed");
                self.activity
                    .publish(
                        "step_completed",
                        format!("Step {} completed", step.order),
                        serde_json::json!({ "run_id": run.id, "step_order": step.order, "duration_ms": duration_ms }),
                    )
                    .await;
                Ok(true)
            }
            Err(err) => {
                let error = err.to_string();
                let mut outcome = StepOutcome::failed(error.clone(), full_output, duration_ms);
                outcome.model = self.executor.model();
                self.finalize_record(run, step.order, outcome).await?;

                stream
                    .emit(ExecutionEvent::StepFailed {
                        timestamp: Utc::now(),
                        step_order: step.order,
                        error: error.clone(),
                    })
                    .await;
                tracing::warn!(run_id = %run.id, step_order = step.order, error = %error, "step failed");
                self.fail_run(run, step.order, format!("Step {} failed: {}", step.order, error), stream)
                    .await?;
                Ok(false)
            }
        }
    }

    /// Park on an approval gate until it is resolved or the stream goes away.
    async fn gate_step(
        &self,
        run: &Run,
        step: &PlanStep,
        stream: &mut StreamSender,
    ) -> Result<GateFlow, ExecutionError> {
        let Some(record) = self.begin_record(run, step, GATE_SOURCE).await? else {
            return Ok(GateFlow::Continue);
        };

        // The gate was decided but its record never written (the previous
        // engine died in between). Settle from the stored decision.
        let run_id = run.id.clone();
        let order = step.order;
        let decided = self
            .db
            .call(move |db| db.gate_for_step(&run_id, order))
            .await
            .map_err(ExecutionError::Storage)?
            .filter(|g| g.status != GateStatus::Waiting);
        if let Some(gate) = decided {
            tracing::info!(run_id = %run.id, gate_id = %gate.id, status = gate.status.as_str(), "settling previously decided gate");
            let resolution = GateResolution {
                status: gate.status,
                resolved_by: gate.resolved_by.unwrap_or_else(|| "unknown".to_string()),
            };
            return self
                .settle_gate(run, step, &record, gate.id, resolution, stream)
                .await;
        }

        let mut wait = self.gates.open_gate(&run.id, step.order).await?;
        let gate_id = wait.gate.id.clone();
        self.set_status(&run.id, RunStatus::PausedGate, Some(step.order)).await?;

        stream
            .emit(ExecutionEvent::GateWaiting {
                timestamp: Utc::now(),
                gate_id: gate_id.clone(),
                step_order: step.order,
                action: step.action.clone(),
            })
            .await;
        stream
            .emit(ExecutionEvent::RunPaused {
                timestamp: Utc::now(),
                next_step_order: Some(step.order),
                gate_id: Some(gate_id.clone()),
                step_order: Some(step.order),
                message: format!("Waiting for approval of step {}", step.order),
            })
            .await;
        self.activity
            .publish(
                "gate_waiting",
                format!("Step {} is waiting for approval", step.order),
                serde_json::json!({ "run_id": run.id, "gate_id": gate_id, "step_order": step.order }),
            )
            .await;

        let decision = tokio::select! {
            decision = &mut wait.decision => decision,
            _ = stream.closed() => {
                if self.gates.withdraw(&gate_id).await {
                    tracing::info!(run_id = %run.id, gate_id = %gate_id, "stream closed while parked at gate; releasing run");
                    self.activity
                        .publish(
                            "run_detached",
                            format!("Run {} released at gate step {}", run.id, step.order),
                            serde_json::json!({ "run_id": run.id, "gate_id": gate_id, "reason": "stream_closed" }),
                        )
                        .await;
                    return Ok(GateFlow::Halt);
                }
                // A decision was handed over before the withdrawal
                (&mut wait.decision).await
            }
        };
        let resolution = decision.map_err(|_| {
            ExecutionError::Other(anyhow::anyhow!("Gate {} waiter dropped without a decision", gate_id))
        })?;
        self.settle_gate(run, step, &record, gate_id, resolution, stream).await
    }

    /// Finalize a gate step's record from its decision, then continue or fail.
    async fn settle_gate(
        &self,
        run: &Run,
        step: &PlanStep,
        record: &StepExecutionRecord,
        gate_id: String,
        resolution: GateResolution,
        stream: &mut StreamSender,
    ) -> Result<GateFlow, ExecutionError> {
        let outcome = gate_outcome(resolution.status, &resolution.resolved_by, record.started_at);
        self.finalize_record(run, step.order, outcome).await?;

        match resolution.status {
            GateStatus::Rejected => {
                stream
                    .emit(ExecutionEvent::GateResolved {
                        timestamp: Utc::now(),
                        gate_id,
                        step_order: step.order,
                        status: GateStatus::Rejected,
                    })
                    .await;
                self.fail_run(
                    run,
                    step.order,
                    format!("Gate at step {} rejected by {}", step.order, resolution.resolved_by),
                    stream,
                )
                .await?;
                Ok(GateFlow::Halt)
            }
            status => {
                self.set_status(&run.id, RunStatus::Running, Some(step.order)).await?;
                stream
                    .emit(ExecutionEvent::GateResolved {
                        timestamp: Utc::now(),
                        gate_id,
                        step_order: step.order,
                        status,
                    })
                    .await;
                Ok(GateFlow::Continue)
            }
        }
    }

    async fn complete_run(&self, run: &Run, stream: &mut StreamSender) -> Result<(), ExecutionError> {
        let run_id = run.id.clone();
        let (records, finished) = self
            .db
            .call(move |db| {
                let records = db.list_step_records(&run_id)?;
                let finished = db.update_run_status(&run_id, RunStatus::Completed, None)?;
                Ok((records, finished))
            })
            .await
            .map_err(ExecutionError::Storage)?;
        let completed_steps = records
            .iter()
            .filter(|r| r.status == RecordStatus::Completed)
            .count();
        let end = finished.completed_at.unwrap_or_else(Utc::now);
        let duration_ms = (end - run.started_at).num_milliseconds().max(0) as u64;

        stream
            .emit(ExecutionEvent::RunCompleted {
                timestamp: Utc::now(),
                completed_steps,
                total_steps: run.total_steps(),
                duration_ms,
            })
            .await;
        tracing::info!(run_id = %run.id, completed_steps, duration_ms, "run completed");
        self.activity
            .publish(
                "run_completed",
                format!("Run {} completed {}/{} steps", run.id, completed_steps, run.total_steps()),
                serde_json::json!({
                    "run_id": run.id,
                    "session_id": run.session_id,
                    "completed_steps": completed_steps,
                    "total_steps": run.total_steps(),
                }),
            )
            .await;
        Ok(())
    }

    async fn fail_run(
        &self,
        run: &Run,
        step_order: u32,
        error: String,
        stream: &mut StreamSender,
    ) -> Result<(), ExecutionError> {
        self.set_status(&run.id, RunStatus::Failed, Some(step_order)).await?;
        stream.emit(ExecutionEvent::run_error(error.clone())).await;
        self.activity
            .publish(
                "run_failed",
                format!("Run {} failed at step {}", run.id, step_order),
                serde_json::json!({ "run_id": run.id, "step_order": step_order, "error": error }),
            )
            .await;
        Ok(())
    }

    async fn begin_record(
        &self,
        run: &Run,
        step: &PlanStep,
        source: &str,
    ) -> Result<Option<StepExecutionRecord>, ExecutionError> {
        let run_id = run.id.clone();
        let order = step.order;
        let source = source.to_string();
        let record = self
            .db
            .call(move |db| {
                db.update_run_status(&run_id, RunStatus::Running, Some(order))?;
                db.begin_step_record(&run_id, order, &source)
            })
            .await
            .map_err(ExecutionError::Storage)?;
        if record.is_none() {
            tracing::debug!(run_id = %run.id, step_order = step.order, "step already has a final record; skipping");
        }
        Ok(record)
    }

    async fn finalize_record(
        &self,
        run: &Run,
        step_order: u32,
        outcome: StepOutcome,
    ) -> Result<StepExecutionRecord, ExecutionError> {
        let run_id = run.id.clone();
        self.db
            .call(move |db| db.finalize_step_record(&run_id, step_order, &outcome))
            .await
            .map_err(ExecutionError::Storage)
    }

    async fn set_status(
        &self,
        run_id: &str,
        status: RunStatus,
        current_step_order: Option<u32>,
    ) -> Result<Run, ExecutionError> {
        let run_id = run_id.to_string();
        self.db
            .call(move |db| db.update_run_status(&run_id, status, current_step_order))
            .await
            .map_err(ExecutionError::Storage)
    }
}

fn chunk_event(step_order: u32, chunk: String) -> ExecutionEvent {
    ExecutionEvent::StepOutputChunk {
        timestamp: Utc::now(),
        step_order,
        chunk,
    }
}
