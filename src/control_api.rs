//! Operator REST API and the `/ws` monitor endpoint.
//!
//! Bound to loopback: the deployment is a trusted single host, front-ends
//! (CLI, TUI, dashboard) talk to this surface.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::dispatch::{DispatchError, DispatchRequest, Dispatcher};
use crate::driver::{ShellOpts, VmDriver};
use crate::hub::{build_status, Hub, MAX_MESSAGE_SIZE};
use crate::pool::PoolManager;
use crate::proxy::RouteWriter;
use crate::registry::Registry;

const DISPATCH_DEADLINE: Duration = Duration::from_secs(120);
const LOGS_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct ControlState {
    pub hub: Arc<Hub>,
    pub pool: Arc<PoolManager>,
    pub store: Arc<Registry>,
    pub dispatcher: Arc<Dispatcher>,
    pub driver: Arc<dyn VmDriver>,
    pub routes: Arc<RouteWriter>,
    pub runner_service: String,
}

#[derive(Debug, Deserialize)]
struct ResizeRequest {
    #[serde(rename = "warmSize")]
    warm_size: usize,
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/dispatch", post(handle_dispatch))
        .route("/status", get(handle_status))
        .route("/agents/{id}/kill", post(handle_kill))
        .route("/agents/{id}/logs", get(handle_logs))
        .route("/pool/replenish", post(handle_replenish))
        .route("/pool/drain", post(handle_drain))
        .route("/pool/resize", post(handle_resize))
        .route("/health", get(handle_health))
        .route("/ws", get(handle_ws))
        .with_state(state)
}

async fn handle_dispatch(
    State(state): State<ControlState>,
    Json(req): Json<DispatchRequest>,
) -> (StatusCode, Json<Value>) {
    let project = req.project.clone();
    let result = match tokio::time::timeout(DISPATCH_DEADLINE, state.dispatcher.dispatch(req)).await
    {
        Err(_) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "dispatch timed out"})),
            )
        }
        Ok(Err(error)) => {
            let status = match error {
                DispatchError::Invalid(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            return (status, Json(json!({"error": error.to_string()})));
        }
        Ok(Ok(result)) => result,
    };

    let subdomain = state.routes.subdomain_for(&result.agent_id, &project);
    (
        StatusCode::OK,
        Json(json!({
            "agentID": result.agent_id,
            "vmName": result.vm_name,
            "vmIP": result.vm_ip,
            "subdomain": subdomain,
        })),
    )
}

async fn handle_status(State(state): State<ControlState>) -> Json<Value> {
    let status = build_status(&state.pool, &state.store, &state.routes);
    Json(serde_json::to_value(status).unwrap_or_else(|_| json!({})))
}

async fn handle_kill(
    State(state): State<ControlState>,
    Path(agent_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    let Some(slot) = state.pool.get_slot(&agent_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "agent not found"})),
        );
    };

    if let Err(error) = state.pool.release(&slot.name) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": error.to_string()})),
        );
    }
    if let Err(error) = state.routes.remove_route(&agent_id) {
        tracing::warn!(agent = %agent_id, %error, "failed to remove proxy route");
    }
    state.store.deregister(&agent_id);

    (StatusCode::OK, Json(json!({"ok": true})))
}

/// One-shot journal dump, as opposed to the live `logs:<id>` WS channel.
async fn handle_logs(State(state): State<ControlState>, Path(agent_id): Path<String>) -> Response {
    let Some(slot) = state.pool.get_slot(&agent_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "agent not found"})),
        )
            .into_response();
    };

    let result = state
        .driver
        .shell(ShellOpts {
            instance: slot.name.clone(),
            command: "sudo".to_string(),
            args: vec![
                "journalctl".to_string(),
                "-u".to_string(),
                state.runner_service.clone(),
                "--no-pager".to_string(),
                "-n".to_string(),
                "200".to_string(),
            ],
            timeout: LOGS_TIMEOUT,
        })
        .await;

    match result {
        Ok(output) => (StatusCode::OK, output).into_response(),
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": error.to_string()})),
        )
            .into_response(),
    }
}

async fn handle_replenish(State(state): State<ControlState>) -> Json<Value> {
    let pool = state.pool.clone();
    tokio::spawn(async move { pool.replenish().await });
    Json(json!({"ok": true}))
}

async fn handle_drain(State(state): State<ControlState>) -> Json<Value> {
    let pool = state.pool.clone();
    tokio::spawn(async move { pool.drain().await });
    Json(json!({"ok": true}))
}

async fn handle_resize(
    State(state): State<ControlState>,
    Json(req): Json<ResizeRequest>,
) -> Json<Value> {
    state.pool.resize(req.warm_size);
    let pool = state.pool.clone();
    tokio::spawn(async move { pool.replenish().await });
    Json(json!({"ok": true}))
}

async fn handle_health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn handle_ws(ws: WebSocketUpgrade, State(state): State<ControlState>) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| state.hub.clone().handle_socket(socket))
}
