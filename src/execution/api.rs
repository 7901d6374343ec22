use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;

use super::engine::{ExecutionEngine, ExecutionRequest};
use super::models::{GateDecision, PlanStep, Session};
use super::reactivation::ReactivationCoordinator;
use super::sessions::{InMemorySessions, SessionDirectory};
use super::sse::run_stream_sse;
use crate::errors::ExecutionError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub engine: ExecutionEngine,
    pub reactivation: ReactivationCoordinator,
    pub sessions: Arc<InMemorySessions>,
    pub activity_tx: broadcast::Sender<String>,
    pub keepalive: Duration,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    /// Caller-supplied task id; generated when absent
    pub id: Option<String>,
    pub title: String,
    pub agent_id: Option<String>,
}

#[derive(Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub steps: Vec<PlanStep>,
    pub continue_from_step_order: Option<u32>,
}

#[derive(Deserialize)]
pub struct ResolveGateRequest {
    pub approved: Option<Value>,
    pub decision: Option<Value>,
    pub resolved_by: Option<String>,
}

#[derive(Deserialize)]
pub struct ActivityQuery {
    pub limit: Option<i64>,
}

const DEFAULT_ACTIVITY_LIMIT: i64 = 50;
const MAX_ACTIVITY_LIMIT: i64 = 500;

// ── Error handling ────────────────────────────────────────────────────

/// HTTP error with a machine-readable `code` next to the message.
#[derive(Debug)]
pub enum ApiError {
    NotFound { code: &'static str, message: String },
    BadRequest { code: &'static str, message: String },
    Conflict { code: &'static str, message: String },
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound { code, message } => (StatusCode::NOT_FOUND, code, message),
            ApiError::BadRequest { code, message } => (StatusCode::BAD_REQUEST, code, message),
            ApiError::Conflict { code, message } => (StatusCode::CONFLICT, code, message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", message),
        };
        (status, Json(serde_json::json!({"error": message, "code": code}))).into_response()
    }
}

impl From<ExecutionError> for ApiError {
    fn from(err: ExecutionError) -> Self {
        let code = err.code();
        let message = err.to_string();
        if err.is_not_found() {
            ApiError::NotFound { code, message }
        } else if err.is_caller_error() {
            ApiError::BadRequest { code, message }
        } else if err.is_conflict() {
            ApiError::Conflict { code, message }
        } else {
            tracing::error!(error = %message, "request failed");
            ApiError::Internal(message)
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/results", get(get_results))
        .route("/api/sessions/{id}/reactivation", get(get_reactivation))
        .route("/api/sessions/{id}/execute", post(execute))
        .route("/api/sessions/{id}/reactivate", post(reactivate))
        .route("/api/gates/{id}/resolve", post(resolve_gate))
        .route("/api/activity", get(list_activity))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Read a gate decision from either `decision` or `approved`.
fn parse_decision(req: &ResolveGateRequest) -> Result<GateDecision, ExecutionError> {
    let from_decision = match &req.decision {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.parse::<GateDecision>().map_err(ExecutionError::InvalidDecision)?),
        Some(other) => return Err(ExecutionError::InvalidDecision(other.to_string())),
    };
    let from_approved = match &req.approved {
        None | Some(Value::Null) => None,
        Some(Value::Bool(b)) => Some(GateDecision::from_approved(*b)),
        Some(other) => return Err(ExecutionError::InvalidDecision(other.to_string())),
    };
    match (from_decision, from_approved) {
        (Some(a), Some(b)) if a != b => Err(ExecutionError::InvalidDecision(
            "'decision' and 'approved' disagree".to_string(),
        )),
        (Some(d), _) | (None, Some(d)) => Ok(d),
        (None, None) => Err(ExecutionError::InvalidDecision("<missing>".to_string())),
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_session(
    State(state): State<SharedState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.title.trim().is_empty() {
        return Err(ApiError::BadRequest {
            code: "invalid_request",
            message: "Session title must not be empty".into(),
        });
    }
    let session = match req.id {
        Some(id) if id.trim().is_empty() => return Err(ExecutionError::InvalidSessionId.into()),
        Some(id) => state.sessions.register(Session {
            id,
            title: req.title,
            agent_id: req.agent_id,
            created_at: Utc::now(),
        }),
        None => state.sessions.create(&req.title, req.agent_id),
    }
    .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn get_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.engine.require_session(&id)?;
    Ok(Json(session))
}

async fn get_results(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let results = state.engine.results(&id).await?;
    Ok(Json(results))
}

async fn get_reactivation(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.reactivation.status(&id).await?;
    Ok(Json(status))
}

async fn execute(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ExecuteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let stream = state
        .engine
        .start_or_resume(ExecutionRequest {
            session_id: id,
            steps: req.steps,
            continue_from_step_order: req.continue_from_step_order,
        })
        .await?;
    let run_id = stream.run_id.clone();
    Ok(([("x-run-id", run_id)], run_stream_sse(stream, state.keepalive)))
}

async fn reactivate(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let stream = state.reactivation.resume(&id).await?;
    let run_id = stream.run_id.clone();
    Ok(([("x-run-id", run_id)], run_stream_sse(stream, state.keepalive)))
}

async fn resolve_gate(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ResolveGateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let decision = parse_decision(&req)?;
    let resolved_by = req
        .resolved_by
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "anonymous".to_string());
    let gate = state
        .engine
        .gates()
        .resolve(&id, decision, &resolved_by)
        .await?;
    Ok(Json(serde_json::json!({"ok": true, "gate": gate})))
}

async fn list_activity(
    State(state): State<SharedState>,
    Query(query): Query<ActivityQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ACTIVITY_LIMIT)
        .clamp(1, MAX_ACTIVITY_LIMIT);
    let events = state
        .engine
        .db()
        .call(move |db| db.list_activity(limit))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(events))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::execution::activity::ActivityPublisher;
    use crate::execution::db::{DbHandle, ExecutionDb};
    use crate::execution::engine::EngineSettings;
    use crate::execution::events::ExecutionEvent;
    use crate::execution::executor::MockExecutor;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    pub(crate) fn test_state() -> SharedState {
        let db = DbHandle::new(ExecutionDb::new_in_memory().unwrap());
        let (activity_tx, _) = broadcast::channel(64);
        let activity = ActivityPublisher::new(db.clone(), activity_tx.clone());
        let sessions = Arc::new(InMemorySessions::new());
        let engine = ExecutionEngine::new(
            db,
            Arc::new(MockExecutor::new(Duration::ZERO)),
            sessions.clone(),
            activity,
            EngineSettings::default(),
        );
        Arc::new(AppState {
            reactivation: ReactivationCoordinator::new(engine.clone()),
            engine,
            sessions,
            activity_tx,
            keepalive: Duration::ZERO,
        })
    }

    fn test_app() -> (Router, SharedState) {
        let state = test_state();
        (api_router().with_state(state.clone()), state)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn create(app: &Router, title: &str) -> String {
        let response = app
            .clone()
            .oneshot(json_request("POST", "/api/sessions", serde_json::json!({"title": title})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let session: Value = body_json(response.into_body()).await;
        session["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = test_app();
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_create_and_get_session() {
        let (app, _) = test_app();
        let id = create(&app, "Quarterly report").await;
        let response = app.oneshot(get(&format!("/api/sessions/{}", id))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let session: Value = body_json(response.into_body()).await;
        assert_eq!(session["title"], "Quarterly report");
    }

    #[tokio::test]
    async fn test_not_found_kinds_are_distinguishable() {
        let (app, _) = test_app();
        let response = app.clone().oneshot(get("/api/sessions/ghost/results")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["code"], "session_not_found");

        let id = create(&app, "idle").await;
        let response = app.oneshot(get(&format!("/api/sessions/{}/results", id))).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["code"], "no_active_run");
    }

    #[tokio::test]
    async fn test_reactivation_status_for_idle_session() {
        let (app, _) = test_app();
        let id = create(&app, "idle").await;
        let response = app
            .oneshot(get(&format!("/api/sessions/{}/reactivation", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["can_reactivate"], false);
        assert!(body["next_step_order"].is_null());
        assert!(body["pending_gate_id"].is_null());
        assert!(body["pending_gate_step_order"].is_null());
    }

    #[tokio::test]
    async fn test_execute_streams_sse_until_completion() {
        let (app, _) = test_app();
        let id = create(&app, "run").await;
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/api/sessions/{}/execute", id),
                serde_json::json!({"steps": [{"order": 1, "action": "collect data"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-run-id"));
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let order: Vec<usize> = ["event: run_started", "event: step_started", "event: step_completed", "event: run_completed"]
            .iter()
            .map(|needle| text.find(needle).unwrap_or_else(|| panic!("missing {}", needle)))
            .collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]));

        let response = app.oneshot(get(&format!("/api/sessions/{}/results", id))).await.unwrap();
        let results: Value = body_json(response.into_body()).await;
        assert_eq!(results["run_status"], "completed");
        assert_eq!(results["steps"][0]["full_output"], "collect data");
    }

    #[tokio::test]
    async fn test_execute_rejects_invalid_plan() {
        let (app, _) = test_app();
        let id = create(&app, "bad").await;
        let response = app
            .oneshot(json_request(
                "POST",
                &format!("/api/sessions/{}/execute", id),
                serde_json::json!({"steps": []}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["code"], "invalid_plan");
    }

    #[tokio::test]
    async fn test_resolve_gate_over_http() {
        let (app, state) = test_app();
        let id = create(&app, "gated").await;
        let mut stream = state
            .engine
            .start_or_resume(ExecutionRequest {
                session_id: id,
                steps: vec![PlanStep::gate(1, "review")],
                continue_from_step_order: None,
            })
            .await
            .unwrap();
        let gate_id = loop {
            match stream.receiver.recv().await.unwrap() {
                ExecutionEvent::GateWaiting { gate_id, .. } => break gate_id,
                _ => continue,
            }
        };
        let uri = format!("/api/gates/{}/resolve", gate_id);

        let response = app
            .clone()
            .oneshot(json_request("POST", &uri, serde_json::json!({"decision": "maybe"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(json_request("POST", &uri, serde_json::json!({"approved": true, "resolved_by": "alice"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["gate"]["status"], "approved");

        let response = app
            .oneshot(json_request("POST", &uri, serde_json::json!({"decision": "rejected"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body: Value = body_json(response.into_body()).await;
        assert_eq!(body["code"], "gate_already_resolved");
    }

    #[tokio::test]
    async fn test_resolve_unknown_gate() {
        let (app, _) = test_app();
        let response = app
            .oneshot(json_request("POST", "/api/gates/nope/resolve", serde_json::json!({"approved": false})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_activity_lists_recent_events() {
        let (app, state) = test_app();
        state
            .engine
            .activity()
            .publish("run_started", "one", serde_json::json!({}))
            .await;
        state
            .engine
            .activity()
            .publish("run_completed", "two", serde_json::json!({}))
            .await;
        let response = app.oneshot(get("/api/activity?limit=1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let events: Vec<Value> = body_json(response.into_body()).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "run_completed");
    }

    #[test]
    fn test_parse_decision_variants() {
        let req = |approved: Option<Value>, decision: Option<Value>| ResolveGateRequest {
            approved,
            decision,
            resolved_by: None,
        };
        assert_eq!(
            parse_decision(&req(Some(Value::Bool(true)), None)).unwrap(),
            GateDecision::Approved
        );
        assert_eq!(
            parse_decision(&req(None, Some(Value::String("Rejected".into())))).unwrap(),
            GateDecision::Rejected
        );
        assert!(parse_decision(&req(None, None)).is_err());
        assert!(parse_decision(&req(Some(Value::String("yes".into())), None)).is_err());
        assert!(
            parse_decision(&req(Some(Value::Bool(true)), Some(Value::String("rejected".into())))).is_err()
        );
    }

    #[test]
    fn test_execution_errors_map_to_status_classes() {
        let status = |err: ExecutionError| ApiError::from(err).into_response().status();
        assert_eq!(
            status(ExecutionError::GateNotFound { gate_id: "g".into() }),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(ExecutionError::AmbiguousResume { requested: 2, expected: Some(3) }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(ExecutionError::GatePending { gate_id: "g".into(), step_order: 1 }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(ExecutionError::NotReactivatable("done".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(status(ExecutionError::LockPoisoned), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
