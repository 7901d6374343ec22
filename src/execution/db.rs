use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;

/// Async-safe handle to the execution store.
///
/// Wraps `ExecutionDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<ExecutionDb>>,
}

impl DbHandle {
    pub fn new(db: ExecutionDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&ExecutionDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

/// Result of attempting to move a gate out of `waiting`.
#[derive(Debug, Clone)]
pub enum GateTransition {
    Resolved(Gate),
    AlreadyResolved(Gate),
    NotFound,
}

pub struct ExecutionDb {
    conn: Connection,
}

fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid timestamp '{}'", value))?
        .with_timezone(&Utc))
}

fn parse_opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_ts).transpose()
}

impl ExecutionDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")
            .context("Failed to configure SQLite")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    session_id TEXT NOT NULL,
                    agent_id TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'running',
                    plan TEXT NOT NULL,
                    current_step_order INTEGER,
                    started_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS step_records (
                    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    step_order INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    source TEXT,
                    model TEXT,
                    duration_ms INTEGER,
                    tool_calls TEXT NOT NULL DEFAULT '[]',
                    full_output TEXT NOT NULL DEFAULT '',
                    error TEXT,
                    started_at TEXT,
                    completed_at TEXT,
                    PRIMARY KEY (run_id, step_order)
                );

                CREATE TABLE IF NOT EXISTS gates (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    step_order INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'waiting',
                    resolved_by TEXT,
                    created_at TEXT NOT NULL,
                    resolved_at TEXT
                );

                CREATE TABLE IF NOT EXISTS activity_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    summary TEXT NOT NULL,
                    metadata TEXT NOT NULL DEFAULT '{}'
                );

                CREATE INDEX IF NOT EXISTS idx_runs_session ON runs(session_id, seq);
                CREATE INDEX IF NOT EXISTS idx_gates_run ON gates(run_id, step_order);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Runs ──────────────────────────────────────────────────────────

    pub fn create_run(
        &self,
        id: &str,
        session_id: &str,
        agent_id: &str,
        plan: &[PlanStep],
    ) -> Result<Run> {
        let plan_json = serde_json::to_string(plan).context("Failed to serialize plan")?;
        self.conn
            .execute(
                "INSERT INTO runs (id, session_id, agent_id, status, plan, started_at)
                 VALUES (?1, ?2, ?3, 'running', ?4, ?5)",
                params![id, session_id, agent_id, plan_json, ts(&Utc::now())],
            )
            .context("Failed to insert run")?;
        self.get_run(id)?.context("Run not found after insert")
    }

    pub fn get_run(&self, id: &str) -> Result<Option<Run>> {
        self.conn
            .query_row(
                "SELECT id, session_id, agent_id, status, plan, current_step_order, started_at, completed_at
                 FROM runs WHERE id = ?1",
                params![id],
                RunRow::from_row,
            )
            .optional()
            .context("Failed to query run")?
            .map(RunRow::into_run)
            .transpose()
    }

    /// Most recently started run for a session, whatever its status.
    pub fn latest_run_for_session(&self, session_id: &str) -> Result<Option<Run>> {
        self.conn
            .query_row(
                "SELECT id, session_id, agent_id, status, plan, current_step_order, started_at, completed_at
                 FROM runs WHERE session_id = ?1 ORDER BY seq DESC LIMIT 1",
                params![session_id],
                RunRow::from_row,
            )
            .optional()
            .context("Failed to query latest run")?
            .map(RunRow::into_run)
            .transpose()
    }

    /// Update a run's status. Terminal statuses stamp `completed_at`.
    pub fn update_run_status(
        &self,
        id: &str,
        status: RunStatus,
        current_step_order: Option<u32>,
    ) -> Result<Run> {
        let completed_at = status.is_terminal().then(|| ts(&Utc::now()));
        self.conn
            .execute(
                "UPDATE runs SET status = ?1,
                    current_step_order = COALESCE(?2, current_step_order),
                    completed_at = COALESCE(?3, completed_at)
                 WHERE id = ?4",
                params![status.as_str(), current_step_order, completed_at, id],
            )
            .context("Failed to update run status")?;
        self.get_run(id)?
            .with_context(|| format!("Run {} not found after status update", id))
    }

    /// Move runs left `running` by a dead process to `paused_detached`.
    /// Returns the ids of the runs that were moved.
    pub fn reconcile_orphaned_runs(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM runs WHERE status = 'running' ORDER BY seq")
            .context("Failed to prepare orphan query")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query orphaned runs")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read orphaned run row")?;
        self.conn
            .execute(
                "UPDATE runs SET status = 'paused_detached' WHERE status = 'running'",
                [],
            )
            .context("Failed to reconcile orphaned runs")?;
        Ok(ids)
    }

    // ── Step execution records ────────────────────────────────────────

    /// Mark a step's record as `running`, creating it if needed.
    ///
    /// A record that already reached `completed` or `failed` is left untouched
    /// and `None` is returned.
    pub fn begin_step_record(
        &self,
        run_id: &str,
        step_order: u32,
        source: &str,
    ) -> Result<Option<StepExecutionRecord>> {
        let changed = self
            .conn
            .execute(
                "INSERT INTO step_records (run_id, step_order, status, source, started_at)
                 VALUES (?1, ?2, 'running', ?3, ?4)
                 ON CONFLICT(run_id, step_order) DO UPDATE SET
                    status = 'running',
                    source = excluded.source,
                    started_at = excluded.started_at,
                    full_output = '',
                    tool_calls = '[]',
                    error = NULL
                 WHERE step_records.status IN ('pending', 'running')",
                params![run_id, step_order, source, ts(&Utc::now())],
            )
            .context("Failed to begin step record")?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_step_record(run_id, step_order)
    }

    /// Finalize a non-terminal record. Terminal records are never rewritten.
    pub fn finalize_step_record(
        &self,
        run_id: &str,
        step_order: u32,
        outcome: &StepOutcome,
    ) -> Result<StepExecutionRecord> {
        anyhow::ensure!(
            outcome.status.is_terminal(),
            "Cannot finalize record with non-terminal status {}",
            outcome.status.as_str()
        );
        let tool_calls =
            serde_json::to_string(&outcome.tool_calls).context("Failed to serialize tool calls")?;
        let changed = self
            .conn
            .execute(
                "UPDATE step_records SET status = ?1, model = ?2, duration_ms = ?3,
                    tool_calls = ?4, full_output = ?5, error = ?6, completed_at = ?7
                 WHERE run_id = ?8 AND step_order = ?9 AND status IN ('pending', 'running')",
                params![
                    outcome.status.as_str(),
                    outcome.model,
                    outcome.duration_ms as i64,
                    tool_calls,
                    outcome.full_output,
                    outcome.error,
                    ts(&Utc::now()),
                    run_id,
                    step_order
                ],
            )
            .context("Failed to finalize step record")?;
        anyhow::ensure!(
            changed == 1,
            "Step record {}/{} is missing or already final",
            run_id,
            step_order
        );
        self.get_step_record(run_id, step_order)?
            .context("Step record not found after finalize")
    }

    pub fn get_step_record(
        &self,
        run_id: &str,
        step_order: u32,
    ) -> Result<Option<StepExecutionRecord>> {
        self.conn
            .query_row(
                "SELECT run_id, step_order, status, source, model, duration_ms, tool_calls,
                        full_output, error, started_at, completed_at
                 FROM step_records WHERE run_id = ?1 AND step_order = ?2",
                params![run_id, step_order],
                RecordRow::from_row,
            )
            .optional()
            .context("Failed to query step record")?
            .map(RecordRow::into_record)
            .transpose()
    }

    /// All records of a run in ascending step order.
    pub fn list_step_records(&self, run_id: &str) -> Result<Vec<StepExecutionRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT run_id, step_order, status, source, model, duration_ms, tool_calls,
                        full_output, error, started_at, completed_at
                 FROM step_records WHERE run_id = ?1 ORDER BY step_order",
            )
            .context("Failed to prepare list_step_records")?;
        let rows = stmt
            .query_map(params![run_id], RecordRow::from_row)
            .context("Failed to query step records")?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("Failed to read step record row")?.into_record()?);
        }
        Ok(records)
    }

    // ── Gates ─────────────────────────────────────────────────────────

    pub fn create_gate(&self, id: &str, run_id: &str, step_order: u32) -> Result<Gate> {
        self.conn
            .execute(
                "INSERT INTO gates (id, run_id, step_order, status, created_at)
                 VALUES (?1, ?2, ?3, 'waiting', ?4)",
                params![id, run_id, step_order, ts(&Utc::now())],
            )
            .context("Failed to insert gate")?;
        self.get_gate(id)?.context("Gate not found after insert")
    }

    pub fn get_gate(&self, id: &str) -> Result<Option<Gate>> {
        self.conn
            .query_row(
                "SELECT id, run_id, step_order, status, resolved_by, created_at, resolved_at
                 FROM gates WHERE id = ?1",
                params![id],
                GateRow::from_row,
            )
            .optional()
            .context("Failed to query gate")?
            .map(GateRow::into_gate)
            .transpose()
    }

    /// The unresolved gate of a run, if any.
    pub fn pending_gate_for_run(&self, run_id: &str) -> Result<Option<Gate>> {
        self.conn
            .query_row(
                "SELECT id, run_id, step_order, status, resolved_by, created_at, resolved_at
                 FROM gates WHERE run_id = ?1 AND status = 'waiting' ORDER BY seq DESC LIMIT 1",
                params![run_id],
                GateRow::from_row,
            )
            .optional()
            .context("Failed to query pending gate")?
            .map(GateRow::into_gate)
            .transpose()
    }

    /// Latest gate created for a given step of a run.
    pub fn gate_for_step(&self, run_id: &str, step_order: u32) -> Result<Option<Gate>> {
        self.conn
            .query_row(
                "SELECT id, run_id, step_order, status, resolved_by, created_at, resolved_at
                 FROM gates WHERE run_id = ?1 AND step_order = ?2 ORDER BY seq DESC LIMIT 1",
                params![run_id, step_order],
                GateRow::from_row,
            )
            .optional()
            .context("Failed to query gate for step")?
            .map(GateRow::into_gate)
            .transpose()
    }

    /// Transition a gate out of `waiting`. Exactly one caller can win.
    pub fn resolve_gate(
        &self,
        id: &str,
        status: GateStatus,
        resolved_by: &str,
    ) -> Result<GateTransition> {
        anyhow::ensure!(
            status != GateStatus::Waiting,
            "A gate cannot be resolved back to waiting"
        );
        let changed = self
            .conn
            .execute(
                "UPDATE gates SET status = ?1, resolved_by = ?2, resolved_at = ?3
                 WHERE id = ?4 AND status = 'waiting'",
                params![status.as_str(), resolved_by, ts(&Utc::now()), id],
            )
            .context("Failed to resolve gate")?;
        let gate = match self.get_gate(id)? {
            Some(gate) => gate,
            None => return Ok(GateTransition::NotFound),
        };
        if changed == 1 {
            Ok(GateTransition::Resolved(gate))
        } else {
            Ok(GateTransition::AlreadyResolved(gate))
        }
    }

    // ── Activity ──────────────────────────────────────────────────────

    pub fn append_activity(&self, event: &ActivityEvent) -> Result<()> {
        let metadata =
            serde_json::to_string(&event.metadata).context("Failed to serialize metadata")?;
        self.conn
            .execute(
                "INSERT INTO activity_events (timestamp, event_type, summary, metadata)
                 VALUES (?1, ?2, ?3, ?4)",
                params![ts(&event.timestamp), event.event_type, event.summary, metadata],
            )
            .context("Failed to insert activity event")?;
        Ok(())
    }

    /// Most recent activity events, newest first.
    pub fn list_activity(&self, limit: i64) -> Result<Vec<ActivityEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT timestamp, event_type, summary, metadata
                 FROM activity_events ORDER BY id DESC LIMIT ?1",
            )
            .context("Failed to prepare list_activity")?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .context("Failed to query activity events")?;
        let mut events = Vec::new();
        for row in rows {
            let (timestamp, event_type, summary, metadata) =
                row.context("Failed to read activity row")?;
            events.push(ActivityEvent {
                timestamp: parse_ts(&timestamp)?,
                event_type,
                summary,
                metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
            });
        }
        Ok(events)
    }
}

// ── Row helpers ──────────────────────────────────────────────────────

struct RunRow {
    id: String,
    session_id: String,
    agent_id: String,
    status: String,
    plan: String,
    current_step_order: Option<u32>,
    started_at: String,
    completed_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            agent_id: row.get(2)?,
            status: row.get(3)?,
            plan: row.get(4)?,
            current_step_order: row.get(5)?,
            started_at: row.get(6)?,
            completed_at: row.get(7)?,
        })
    }

    fn into_run(self) -> Result<Run> {
        Ok(Run {
            status: RunStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            plan: serde_json::from_str(&self.plan).context("Corrupt plan snapshot")?,
            started_at: parse_ts(&self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            id: self.id,
            session_id: self.session_id,
            agent_id: self.agent_id,
            current_step_order: self.current_step_order,
        })
    }
}

struct RecordRow {
    run_id: String,
    step_order: u32,
    status: String,
    source: Option<String>,
    model: Option<String>,
    duration_ms: Option<i64>,
    tool_calls: String,
    full_output: String,
    error: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl RecordRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            step_order: row.get(1)?,
            status: row.get(2)?,
            source: row.get(3)?,
            model: row.get(4)?,
            duration_ms: row.get(5)?,
            tool_calls: row.get(6)?,
            full_output: row.get(7)?,
            error: row.get(8)?,
            started_at: row.get(9)?,
            completed_at: row.get(10)?,
        })
    }

    fn into_record(self) -> Result<StepExecutionRecord> {
        Ok(StepExecutionRecord {
            status: RecordStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            tool_calls: serde_json::from_str(&self.tool_calls).context("Corrupt tool calls")?,
            duration_ms: self.duration_ms.map(|d| d.max(0) as u64),
            started_at: parse_opt_ts(self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            run_id: self.run_id,
            step_order: self.step_order,
            source: self.source,
            model: self.model,
            full_output: self.full_output,
            error: self.error,
        })
    }
}

struct GateRow {
    id: String,
    run_id: String,
    step_order: u32,
    status: String,
    resolved_by: Option<String>,
    created_at: String,
    resolved_at: Option<String>,
}

impl GateRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            step_order: row.get(2)?,
            status: row.get(3)?,
            resolved_by: row.get(4)?,
            created_at: row.get(5)?,
            resolved_at: row.get(6)?,
        })
    }

    fn into_gate(self) -> Result<Gate> {
        Ok(Gate {
            status: GateStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            created_at: parse_ts(&self.created_at)?,
            resolved_at: parse_opt_ts(self.resolved_at)?,
            id: self.id,
            run_id: self.run_id,
            step_order: self.step_order,
            resolved_by: self.resolved_by,
        })
    }
}
