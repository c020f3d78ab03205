//! VM-facing registration endpoint.
//!
//! The in-VM runner posts here over the host bridge: once on boot to
//! register, then on every lifecycle transition, and finally to deregister
//! when the task completes.

use std::sync::Arc;
use std::time::Duration;

use axum::error_handling::HandleErrorLayer;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{BoxError, Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower::timeout::TimeoutLayer;
use tower::ServiceBuilder;

use crate::proxy::RouteWriter;
use crate::registry::{AgentRegistration, Registry};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct RegState {
    store: Arc<Registry>,
    routes: Arc<RouteWriter>,
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(rename = "agentID", default)]
    agent_id: String,
    #[serde(rename = "vmName", default)]
    vm_name: String,
    #[serde(rename = "vmIP", default)]
    vm_ip: String,
    #[serde(default)]
    project: String,
    #[serde(default)]
    tool: String,
    #[serde(default)]
    ports: Vec<u16>,
}

#[derive(Debug, Deserialize)]
struct DeregisterRequest {
    #[serde(rename = "agentID")]
    agent_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusReport {
    #[serde(rename = "agentID")]
    agent_id: String,
    state: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    branch: Option<String>,
}

pub fn router(store: Arc<Registry>, routes: Arc<RouteWriter>) -> Router {
    let state = RegState { store, routes };

    Router::new()
        .route("/register", post(handle_register))
        .route("/deregister", post(handle_deregister))
        .route("/status", post(handle_status))
        .route("/agents", get(handle_agents))
        .route("/health", get(handle_health))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(|_: BoxError| async {
                    StatusCode::REQUEST_TIMEOUT
                }))
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT)),
        )
        .with_state(state)
}

async fn handle_register(
    State(state): State<RegState>,
    Json(req): Json<RegisterRequest>,
) -> (StatusCode, Json<Value>) {
    if req.agent_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "agentID is required"})),
        );
    }

    let now = Utc::now();
    let reg = AgentRegistration {
        agent_id: req.agent_id.clone(),
        vm_name: req.vm_name,
        vm_ip: req.vm_ip,
        project: req.project,
        tool: req.tool,
        branch: None,
        message: None,
        ports: req.ports,
        state: "registered".to_string(),
        registered_at: now,
        last_heartbeat: now,
    };

    state.store.register(reg.clone());
    tracing::info!(
        agent = %reg.agent_id,
        ip = %reg.vm_ip,
        project = %reg.project,
        tool = %reg.tool,
        "agent registered"
    );

    if let Err(error) = state.routes.write_route(&reg) {
        tracing::warn!(agent = %reg.agent_id, %error, "failed to write proxy route");
    }

    (StatusCode::OK, Json(json!({"ok": true})))
}

async fn handle_deregister(
    State(state): State<RegState>,
    Json(req): Json<DeregisterRequest>,
) -> (StatusCode, Json<Value>) {
    state.store.deregister(&req.agent_id);
    tracing::info!(agent = %req.agent_id, "agent deregistered");
    (StatusCode::OK, Json(json!({"ok": true})))
}

async fn handle_status(
    State(state): State<RegState>,
    Json(report): Json<StatusReport>,
) -> (StatusCode, Json<Value>) {
    match state
        .store
        .update_state(&report.agent_id, &report.state, report.message, report.branch)
    {
        Ok(()) => {
            tracing::info!(agent = %report.agent_id, state = %report.state, "agent status");
            (StatusCode::OK, Json(json!({"ok": true})))
        }
        Err(error) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": error.to_string()})),
        ),
    }
}

async fn handle_agents(State(state): State<RegState>) -> Json<Vec<AgentRegistration>> {
    Json(state.store.list())
}

async fn handle_health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_router(tmp: &tempfile::TempDir) -> (Router, Arc<Registry>) {
        let store = Arc::new(Registry::new(tmp.path()).unwrap());
        let routes = Arc::new(RouteWriter::new(tmp.path(), "agents.test"));
        (router(store.clone(), routes), store)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request should build")
    }

    async fn response_json(response: axum::response::Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn register_stores_agent_and_writes_route() {
        let tmp = tempfile::tempdir().unwrap();
        let (router, store) = test_router(&tmp);

        let response = router
            .oneshot(post_json(
                "/register",
                json!({
                    "agentID": "agent-1",
                    "vmName": "warm-1",
                    "vmIP": "192.168.64.5",
                    "project": "proj",
                    "tool": "claude-code",
                    "ports": [8080],
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let reg = store.get("agent-1").expect("agent stored");
        assert_eq!(reg.state, "registered");
        assert_eq!(reg.vm_name, "warm-1");
        assert!(tmp.path().join("routes/agent-1.json").exists());
    }

    #[tokio::test]
    async fn register_without_agent_id_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (router, store) = test_router(&tmp);

        let response = router
            .oneshot(post_json("/register", json!({"vmName": "warm-1"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(store.list().is_empty());
    }

    #[tokio::test]
    async fn status_for_unknown_agent_is_404() {
        let tmp = tempfile::tempdir().unwrap();
        let (router, _store) = test_router(&tmp);

        let response = router
            .oneshot(post_json(
                "/status",
                json!({"agentID": "ghost", "state": "executing"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = response_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn status_updates_known_agent() {
        let tmp = tempfile::tempdir().unwrap();
        let (router, store) = test_router(&tmp);

        router
            .clone()
            .oneshot(post_json(
                "/register",
                json!({"agentID": "agent-1", "vmName": "warm-1"}),
            ))
            .await
            .unwrap();

        let response = router
            .oneshot(post_json(
                "/status",
                json!({"agentID": "agent-1", "state": "executing", "message": "cloning"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let reg = store.get("agent-1").unwrap();
        assert_eq!(reg.state, "executing");
        assert_eq!(reg.message.as_deref(), Some("cloning"));
    }

    #[tokio::test]
    async fn deregister_then_agents_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let (router, _store) = test_router(&tmp);

        router
            .clone()
            .oneshot(post_json(
                "/register",
                json!({"agentID": "agent-1", "vmName": "warm-1"}),
            ))
            .await
            .unwrap();
        router
            .clone()
            .oneshot(post_json("/deregister", json!({"agentID": "agent-1"})))
            .await
            .unwrap();

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/agents")
                    .method("GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = response_json(response).await;
        assert!(body.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let (router, _store) = test_router(&tmp);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .method("GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["status"], "ok");
    }
}
