//! Database commands: `plan-runner init-db` and `plan-runner status`.

use anyhow::{Context, Result};
use std::path::Path;

use plan_runner::execution::db::ExecutionDb;
use plan_runner::execution::models::{RecordStatus, next_step_order};

fn ensure_parent(db_path: &Path) -> Result<()> {
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}

pub fn cmd_init_db(db_path: &Path) -> Result<()> {
    ensure_parent(db_path)?;
    ExecutionDb::new(db_path)?;
    println!("Execution database initialized at {}", db_path.display());
    Ok(())
}

/// Print the latest run for a session straight from the store.
pub fn cmd_status(db_path: &Path, session_id: &str) -> Result<()> {
    if !db_path.exists() {
        anyhow::bail!(
            "No database at {}. Run 'plan-runner init-db' first.",
            db_path.display()
        );
    }
    let db = ExecutionDb::new(db_path)?;

    let Some(run) = db.latest_run_for_session(session_id)? else {
        println!("No runs recorded for session {}", session_id);
        return Ok(());
    };
    let records = db.list_step_records(&run.id)?;
    let pending_gate = db.pending_gate_for_run(&run.id)?;

    println!();
    println!("Run {}", run.id);
    println!("  session:  {}", run.session_id);
    println!("  agent:    {}", run.agent_id);
    println!("  status:   {}", run.status.as_str());
    println!("  started:  {}", run.started_at.to_rfc3339());
    if let Some(done) = run.completed_at {
        println!("  finished: {}", done.to_rfc3339());
    }
    println!();

    for step in &run.plan {
        let record = records.iter().find(|r| r.step_order == step.order);
        let status = record.map_or("not started", |r| r.status.as_str());
        println!("  {:>3}. [{:<11}] {}", step.order, status, step.action);
        if let Some(r) = record
            && r.status == RecordStatus::Failed
            && let Some(err) = &r.error
        {
            println!("       error: {}", err);
        }
    }
    println!();

    if let Some(gate) = pending_gate {
        println!("Waiting on gate {} at step {}", gate.id, gate.step_order);
    } else if !run.status.is_terminal()
        && let Some(next) = next_step_order(&run.plan, &records)
    {
        println!("Next step: {}", next);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use plan_runner::execution::models::{PlanStep, StepOutcome};

    #[test]
    fn test_init_db_creates_nested_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("runs.db");
        cmd_init_db(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_status_requires_database() {
        let dir = tempfile::tempdir().unwrap();
        let err = cmd_status(&dir.path().join("missing.db"), "s-1").unwrap_err();
        assert!(err.to_string().contains("init-db"));
    }

    #[test]
    fn test_status_reads_latest_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");
        {
            let db = ExecutionDb::new(&path).unwrap();
            db.create_run("r-1", "s-1", "agent", &[PlanStep::task(1, "a"), PlanStep::task(2, "b")])
                .unwrap();
            db.begin_step_record("r-1", 1, "mock").unwrap();
            db.finalize_step_record("r-1", 1, &StepOutcome::completed("a".into(), vec![], 5))
                .unwrap();
        }
        cmd_status(&path, "s-1").unwrap();
        cmd_status(&path, "unknown").unwrap();
    }
}
