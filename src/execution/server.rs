use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::activity::ActivityPublisher;
use super::api::{self, AppState};
use super::db::{DbHandle, ExecutionDb};
use super::engine::{EngineSettings, ExecutionEngine};
use super::executor::build_executor;
use super::reactivation::ReactivationCoordinator;
use super::sessions::InMemorySessions;
use super::ws;
use crate::config::RunnerConfig;

/// Configuration for the plan runner server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    pub activity_buffer: usize,
    pub keepalive: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3150,
            db_path: PathBuf::from(".plan-runner/runs.db"),
            dev_mode: false,
            activity_buffer: 256,
            keepalive: Duration::from_secs(15),
        }
    }
}

impl From<&RunnerConfig> for ServerConfig {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            db_path: config.storage.db_path.clone(),
            dev_mode: config.server.dev_mode,
            activity_buffer: config.streams.activity_buffer,
            keepalive: Duration::from_secs(config.streams.keepalive_secs),
        }
    }
}

/// Build the full application router with API, SSE and the activity WebSocket.
pub fn build_router(state: Arc<AppState>) -> Router {
    let activity_tx = state.activity_tx.clone();

    api::api_router()
        .route(
            "/ws/activity",
            get(move |ws_upgrade| ws::activity_ws_handler(ws_upgrade, activity_tx)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Open the database, reconcile runs orphaned by a previous process and
/// assemble the shared state.
pub async fn build_state(config: &RunnerConfig) -> Result<Arc<AppState>> {
    let server = ServerConfig::from(config);
    if let Some(parent) = server.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = DbHandle::new(
        ExecutionDb::new(&server.db_path).context("Failed to initialize execution database")?,
    );
    let (activity_tx, _rx) = broadcast::channel::<String>(server.activity_buffer);
    let activity = ActivityPublisher::new(db.clone(), activity_tx.clone());
    let sessions = Arc::new(InMemorySessions::new());
    let executor = build_executor(&config.executor)?;
    tracing::info!(executor = executor.source(), agent_id = %config.executor.agent_id, "executor ready");

    let engine = ExecutionEngine::new(
        db,
        executor,
        sessions.clone(),
        activity,
        EngineSettings {
            agent_id: config.executor.agent_id.clone(),
            event_buffer: config.streams.event_buffer,
        },
    );
    let reconciled = engine.reconcile_orphans().await?;
    if !reconciled.is_empty() {
        tracing::warn!(count = reconciled.len(), "detached runs left running by a previous process");
    }

    Ok(Arc::new(AppState {
        reactivation: ReactivationCoordinator::new(engine.clone()),
        engine,
        sessions,
        activity_tx,
        keepalive: server.keepalive,
    }))
}

/// Start the plan runner server.
pub async fn start_server(config: RunnerConfig) -> Result<()> {
    let server = ServerConfig::from(&config);
    let state = build_state(&config).await?;

    let mut app = build_router(state);
    if server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if server.dev_mode { "0.0.0.0" } else { server.host.as_str() };
    let addr = format!("{}:{}", host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    println!("Plan runner listening on http://{}", local_addr);
    tracing::info!(%local_addr, db = %server.db_path.display(), "server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::api::tests::test_state;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = build_router(test_state());
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let app = build_router(test_state());
        let req = Request::builder()
            .uri("/api/activity")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ws_route_requires_upgrade() {
        let app = build_router(test_state());
        let req = Request::builder()
            .uri("/ws/activity")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        // Plain GET without upgrade headers is rejected by the extractor
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn test_build_state_reconciles_orphaned_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RunnerConfig::default();
        config.storage.db_path = dir.path().join("nested").join("runs.db");
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        {
            let db = ExecutionDb::new(&config.storage.db_path).unwrap();
            db.create_run("r-1", "s-1", "agent", &[crate::execution::models::PlanStep::task(1, "a")])
                .unwrap();
        }
        let state = build_state(&config).await.unwrap();
        let run = state.engine.db().call(|db| db.get_run("r-1")).await.unwrap().unwrap();
        assert_eq!(run.status, crate::execution::models::RunStatus::PausedDetached);
    }

    #[test]
    fn test_server_config_from_runner_config() {
        let mut config = RunnerConfig::default();
        config.server.port = 4321;
        config.streams.keepalive_secs = 3;
        let server = ServerConfig::from(&config);
        assert_eq!(server.port, 4321);
        assert_eq!(server.keepalive, Duration::from_secs(3));
        assert_eq!(ServerConfig::default().port, 3150);
    }
}
