//! WebSocket wire format.
//!
//! Every frame carries one envelope, or several joined by `\n` when the
//! writer coalesces a backlog. Clients split on newlines and parse each
//! segment independently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pool::PoolCounts;
use crate::pool_state::Slot;
use crate::proxy::RouteWriter;
use crate::registry::AgentRegistration;

// Client -> server
pub const TYPE_SUBSCRIBE: &str = "subscribe";
pub const TYPE_UNSUBSCRIBE: &str = "unsubscribe";
pub const TYPE_COMMAND: &str = "command";

// Server -> client
pub const TYPE_STATUS_SNAPSHOT: &str = "status.snapshot";
pub const TYPE_STATUS_UPDATE: &str = "status.update";
pub const TYPE_AGENT_REGISTERED: &str = "agent.registered";
pub const TYPE_AGENT_DEREGISTERED: &str = "agent.deregistered";
pub const TYPE_LOGS_DATA: &str = "logs.data";
pub const TYPE_COMMAND_RESULT: &str = "command.result";

pub const CHANNEL_STATUS: &str = "status";

/// Top-level wrapper of every WebSocket message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribePayload {
    /// "status" or "logs:<agentID>".
    pub channel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribePayload {
    pub channel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPayload {
    /// Client-chosen correlation id, echoed verbatim in the result.
    pub id: String,
    /// kill, dispatch, mount, unmount, shell.
    pub action: String,
    #[serde(default)]
    pub args: Value,
}

/// Full state of a single agent as shown on the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    #[serde(rename = "agentID")]
    pub agent_id: String,
    #[serde(rename = "vmName")]
    pub vm_name: String,
    #[serde(rename = "vmIP", default)]
    pub vm_ip: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<String>,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    pub elapsed: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
}

impl AgentSnapshot {
    /// Pool view of an active slot, enriched with registry data when the
    /// runner has reported in.
    pub fn from_slot(slot: &Slot, reg: Option<&AgentRegistration>, routes: &RouteWriter) -> Self {
        let started_at = slot.claimed_at.unwrap_or(slot.created_at);
        let project = slot.project.clone().unwrap_or_default();
        let subdomain = slot
            .agent_id
            .as_deref()
            .map(|agent_id| routes.subdomain_for(agent_id, &project));
        let mut snap = Self {
            agent_id: slot.agent_id.clone().unwrap_or_default(),
            vm_name: slot.name.clone(),
            vm_ip: slot.vm_ip.clone().unwrap_or_default(),
            project,
            tool: slot.tool.clone().unwrap_or_default(),
            branch: slot.branch.clone(),
            issue: slot.issue.clone(),
            state: "active".to_string(),
            message: None,
            started_at,
            elapsed: format_elapsed(started_at),
            subdomain,
        };
        if let Some(reg) = reg {
            snap.state = reg.state.clone();
            snap.message = reg.message.clone();
            if reg.branch.is_some() {
                snap.branch = reg.branch.clone();
            }
        }
        snap
    }

    pub fn from_registration(reg: &AgentRegistration) -> Self {
        Self {
            agent_id: reg.agent_id.clone(),
            vm_name: reg.vm_name.clone(),
            vm_ip: reg.vm_ip.clone(),
            project: reg.project.clone(),
            tool: reg.tool.clone(),
            branch: reg.branch.clone(),
            issue: None,
            state: reg.state.clone(),
            message: reg.message.clone(),
            started_at: reg.registered_at,
            elapsed: format_elapsed(reg.registered_at),
            subdomain: None,
        }
    }
}

/// Sent to new status subscribers and on every snapshot tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshotPayload {
    pub pool: PoolCountsPayload,
    pub agents: Vec<AgentSnapshot>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolCountsPayload {
    pub warm: usize,
    pub active: usize,
    pub cold: usize,
}

impl From<PoolCounts> for PoolCountsPayload {
    fn from(counts: PoolCounts) -> Self {
        Self {
            warm: counts.warm,
            active: counts.active,
            cold: counts.cold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdatePayload {
    #[serde(rename = "agentID")]
    pub agent_id: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEventPayload {
    #[serde(rename = "agentID")]
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogDataPayload {
    #[serde(rename = "agentID")]
    pub agent_id: String,
    pub line: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandResultPayload {
    pub id: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn make_envelope<T: Serialize>(kind: &str, payload: &T) -> anyhow::Result<String> {
    let envelope = Envelope {
        kind: kind.to_string(),
        payload: serde_json::to_value(payload)?,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Extracts the agent id from "logs:<agentID>" channel names.
pub fn parse_log_channel(channel: &str) -> Option<&str> {
    channel
        .strip_prefix("logs:")
        .filter(|agent_id| !agent_id.is_empty())
}

fn format_elapsed(since: DateTime<Utc>) -> String {
    let secs = (Utc::now() - since).num_seconds().max(0);
    let (hours, rem) = (secs / 3600, secs % 3600);
    let (minutes, seconds) = (rem / 60, rem % 60);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn envelope_round_trip() {
        let msg = make_envelope(
            TYPE_SUBSCRIBE,
            &SubscribePayload {
                channel: "status".to_string(),
            },
        )
        .unwrap();

        let decoded: Envelope = serde_json::from_str(&msg).unwrap();
        assert_eq!(decoded.kind, "subscribe");
        let payload: SubscribePayload = serde_json::from_value(decoded.payload).unwrap();
        assert_eq!(payload.channel, "status");
    }

    #[test]
    fn command_payload_round_trip() {
        let raw = r#"{"type":"command","payload":{"id":"cmd-7","action":"dispatch","args":{"project":"p"}}}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.kind, TYPE_COMMAND);

        let cmd: CommandPayload = serde_json::from_value(envelope.payload).unwrap();
        assert_eq!(cmd.id, "cmd-7");
        assert_eq!(cmd.action, "dispatch");
        assert_eq!(cmd.args["project"], "p");
    }

    #[test]
    fn command_result_echoes_id_field_names() {
        let result = CommandResultPayload {
            id: "cmd-7".to_string(),
            success: false,
            message: None,
            error: Some("no warm VMs available".to_string()),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["id"], "cmd-7");
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "no warm VMs available");
        assert!(json.get("message").is_none());
    }

    #[test]
    fn parse_log_channel_extracts_agent_id() {
        assert_eq!(parse_log_channel("logs:agent-42"), Some("agent-42"));
        assert_eq!(parse_log_channel("logs:"), None);
        assert_eq!(parse_log_channel("status"), None);
    }

    #[test]
    fn snapshot_payload_wire_names() {
        let payload = StatusSnapshotPayload {
            pool: PoolCountsPayload {
                warm: 1,
                active: 2,
                cold: 3,
            },
            agents: vec![],
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["pool"]["warm"], 1);
        assert_eq!(json["pool"]["active"], 2);
        assert_eq!(json["pool"]["cold"], 3);
        assert!(json["agents"].as_array().unwrap().is_empty());
    }

    #[test]
    fn agent_snapshot_prefers_registry_state() {
        let tmp = tempfile::tempdir().unwrap();
        let routes = RouteWriter::new(tmp.path(), "agents.test");

        let mut slot = crate::pool_state::Slot::creating("warm-1".to_string());
        slot.state = crate::pool_state::SlotState::Active;
        slot.agent_id = Some("agent-1".to_string());
        slot.project = Some("proj".to_string());
        slot.claimed_at = Some(Utc::now());

        let reg = AgentRegistration {
            agent_id: "agent-1".to_string(),
            vm_name: "warm-1".to_string(),
            vm_ip: "192.168.64.5".to_string(),
            project: "proj".to_string(),
            tool: "claude-code".to_string(),
            branch: Some("agent/proj/agent-1".to_string()),
            message: Some("cloning repo".to_string()),
            ports: vec![],
            state: "cloning".to_string(),
            registered_at: Utc::now(),
            last_heartbeat: Utc::now(),
        };

        let snap = AgentSnapshot::from_slot(&slot, Some(&reg), &routes);
        assert_eq!(snap.state, "cloning");
        assert_eq!(snap.message.as_deref(), Some("cloning repo"));
        assert_eq!(snap.branch.as_deref(), Some("agent/proj/agent-1"));
        assert_eq!(snap.subdomain.as_deref(), Some("proj-agent-1.agents.test"));

        let bare = AgentSnapshot::from_slot(&slot, None, &routes);
        assert_eq!(bare.state, "active");
        assert_eq!(bare.subdomain.as_deref(), Some("proj-agent-1.agents.test"));
    }

    #[test]
    fn snapshot_without_agent_has_no_subdomain() {
        let tmp = tempfile::tempdir().unwrap();
        let routes = RouteWriter::new(tmp.path(), "agents.test");

        let slot = crate::pool_state::Slot::creating("warm-1".to_string());
        let snap = AgentSnapshot::from_slot(&slot, None, &routes);
        assert!(snap.subdomain.is_none());

        let json = serde_json::to_value(&snap).unwrap();
        assert!(json.get("subdomain").is_none());
    }

    #[test]
    fn elapsed_formats_by_magnitude() {
        let now = Utc::now();
        assert_eq!(format_elapsed(now - Duration::seconds(42)), "42s");
        assert_eq!(format_elapsed(now - Duration::seconds(90)), "1m30s");
        assert_eq!(format_elapsed(now - Duration::seconds(3700)), "1h1m40s");
    }
}
