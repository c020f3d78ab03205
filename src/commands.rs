//! Operator command routing.
//!
//! Commands arrive over the WebSocket with a client-chosen correlation id;
//! every command produces exactly one `command.result` carrying that id, so
//! the client never waits forever.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::dispatch::{DispatchRequest, Dispatcher};
use crate::mounts::MountManager;
use crate::pool::PoolManager;
use crate::protocol::{CommandPayload, CommandResultPayload};
use crate::proxy::RouteWriter;
use crate::registry::Registry;

const DISPATCH_DEADLINE: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
struct AgentArgs {
    #[serde(rename = "agentID")]
    agent_id: String,
}

#[derive(Debug, Deserialize)]
struct MountArgs {
    #[serde(rename = "agentID")]
    agent_id: String,
    #[serde(rename = "mountPath", default)]
    mount_path: Option<String>,
}

pub struct CommandHandler {
    dispatcher: Arc<Dispatcher>,
    pool: Arc<PoolManager>,
    store: Arc<Registry>,
    routes: Arc<RouteWriter>,
    mounts: Arc<MountManager>,
}

impl CommandHandler {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        pool: Arc<PoolManager>,
        store: Arc<Registry>,
        routes: Arc<RouteWriter>,
        mounts: Arc<MountManager>,
    ) -> Self {
        Self {
            dispatcher,
            pool,
            store,
            routes,
            mounts,
        }
    }

    pub async fn handle(&self, cmd: CommandPayload) -> CommandResultPayload {
        let id = cmd.id.clone();
        let result = match cmd.action.as_str() {
            "kill" => self.handle_kill(cmd.args).await,
            "dispatch" => self.handle_dispatch(cmd.args).await,
            "mount" => self.handle_mount(cmd.args).await,
            "unmount" => self.handle_unmount(cmd.args).await,
            "shell" => self.handle_shell(cmd.args).await,
            other => Err(format!("unknown action: {other}")),
        };

        match result {
            Ok(message) => CommandResultPayload {
                id,
                success: true,
                message: Some(message),
                error: None,
            },
            Err(error) => CommandResultPayload {
                id,
                success: false,
                message: None,
                error: Some(error),
            },
        }
    }

    async fn handle_kill(&self, args: Value) -> Result<String, String> {
        let args: AgentArgs =
            serde_json::from_value(args).map_err(|e| format!("invalid args: {e}"))?;

        let slot = self
            .pool
            .get_slot(&args.agent_id)
            .ok_or_else(|| "agent not found".to_string())?;

        self.pool.release(&slot.name).map_err(|e| e.to_string())?;
        if let Err(error) = self.routes.remove_route(&args.agent_id) {
            tracing::warn!(agent = %args.agent_id, %error, "failed to remove proxy route");
        }
        self.store.deregister(&args.agent_id);

        Ok("agent killed".to_string())
    }

    async fn handle_dispatch(&self, args: Value) -> Result<String, String> {
        let req: DispatchRequest =
            serde_json::from_value(args).map_err(|e| format!("invalid args: {e}"))?;

        let result = tokio::time::timeout(DISPATCH_DEADLINE, self.dispatcher.dispatch(req))
            .await
            .map_err(|_| "dispatch timed out".to_string())?
            .map_err(|e| e.to_string())?;

        Ok(format!(
            "dispatched {} to {}",
            result.agent_id, result.vm_name
        ))
    }

    async fn handle_mount(&self, args: Value) -> Result<String, String> {
        let args: MountArgs =
            serde_json::from_value(args).map_err(|e| format!("invalid args: {e}"))?;

        let slot = self
            .pool
            .get_slot(&args.agent_id)
            .ok_or_else(|| "agent not found".to_string())?;
        let project = slot.project.clone().unwrap_or_default();

        let mount_point = self
            .mounts
            .mount(&slot.name, &args.agent_id, &project, args.mount_path)
            .await
            .map_err(|e| e.to_string())?;

        Ok(format!("mounted at {}", mount_point.display()))
    }

    async fn handle_unmount(&self, args: Value) -> Result<String, String> {
        let args: AgentArgs =
            serde_json::from_value(args).map_err(|e| format!("invalid args: {e}"))?;

        self.mounts
            .unmount(&args.agent_id)
            .await
            .map_err(|e| e.to_string())?;
        Ok("unmounted".to_string())
    }

    /// The PTY is attached client-side; the client only needs the VM name.
    async fn handle_shell(&self, args: Value) -> Result<String, String> {
        let args: AgentArgs =
            serde_json::from_value(args).map_err(|e| format!("invalid args: {e}"))?;

        let slot = self
            .pool
            .get_slot(&args.agent_id)
            .ok_or_else(|| "agent not found".to_string())?;
        Ok(slot.name)
    }
}
