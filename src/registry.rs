//! Live registry of dispatched agents.
//!
//! The in-VM runner reports its lifecycle here; every mutation is persisted
//! as one JSON document and multicast to subscribers over bounded channels.
//! Fan-out never blocks: a subscriber whose queue is full loses the event
//! and catches up from the next periodic status snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

const SUBSCRIBER_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    #[serde(rename = "agentID")]
    pub agent_id: String,
    #[serde(rename = "vmName")]
    pub vm_name: String,
    #[serde(rename = "vmIP")]
    pub vm_ip: String,
    pub project: String,
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,
    /// One of: starting, cloning, executing, pushing, serving, completed,
    /// failed, killed, registered.
    pub state: String,
    #[serde(rename = "registeredAt")]
    pub registered_at: DateTime<Utc>,
    #[serde(rename = "lastHeartbeat")]
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreEventKind {
    Registered,
    Deregistered,
    Updated,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreEvent {
    pub kind: StoreEventKind,
    #[serde(rename = "agentID")]
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentRegistration>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("agent {0:?} not registered")]
    UnknownAgent(String),
}

pub struct Registry {
    agents: RwLock<HashMap<String, AgentRegistration>>,
    path: PathBuf,
    subscribers: Mutex<Vec<mpsc::Sender<StoreEvent>>>,
}

impl Registry {
    pub fn new(base_dir: &Path) -> anyhow::Result<Self> {
        let path = base_dir.join("registry.json");
        let agents = match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            agents: RwLock::new(agents),
            path,
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Events arrive in mutation order; a full queue drops the event for
    /// that subscriber only. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> mpsc::Receiver<StoreEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn register(&self, reg: AgentRegistration) {
        let agent_id = reg.agent_id.clone();
        {
            let mut agents = self.agents.write();
            agents.insert(agent_id.clone(), reg.clone());
            self.persist_locked(&agents);
        }
        self.notify(StoreEvent {
            kind: StoreEventKind::Registered,
            agent_id,
            agent: Some(reg),
        });
    }

    pub fn deregister(&self, agent_id: &str) {
        let agent = {
            let mut agents = self.agents.write();
            let agent = agents.remove(agent_id);
            self.persist_locked(&agents);
            agent
        };
        self.notify(StoreEvent {
            kind: StoreEventKind::Deregistered,
            agent_id: agent_id.to_string(),
            agent,
        });
    }

    pub fn update_state(
        &self,
        agent_id: &str,
        state: &str,
        message: Option<String>,
        branch: Option<String>,
    ) -> Result<(), RegistryError> {
        let updated = {
            let mut agents = self.agents.write();
            let reg = agents
                .get_mut(agent_id)
                .ok_or_else(|| RegistryError::UnknownAgent(agent_id.to_string()))?;
            reg.state = state.to_string();
            reg.last_heartbeat = Utc::now();
            if let Some(message) = message {
                reg.message = Some(message);
            }
            if let Some(branch) = branch {
                reg.branch = Some(branch);
            }
            let updated = reg.clone();
            self.persist_locked(&agents);
            updated
        };

        self.notify(StoreEvent {
            kind: StoreEventKind::Updated,
            agent_id: agent_id.to_string(),
            agent: Some(updated),
        });
        Ok(())
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRegistration> {
        self.agents.read().get(agent_id).cloned()
    }

    pub fn list(&self) -> Vec<AgentRegistration> {
        self.agents.read().values().cloned().collect()
    }

    fn notify(&self, event: StoreEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            // Slow subscriber: the event is lost, the snapshot tick catches
            // it up.
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Persistence failures are logged, not surfaced: the in-memory map is
    /// authoritative and reconciliation converges on the next start.
    fn persist_locked(&self, agents: &HashMap<String, AgentRegistration>) {
        let result = serde_json::to_vec_pretty(agents)
            .map_err(anyhow::Error::from)
            .and_then(|data| std::fs::write(&self.path, data).map_err(anyhow::Error::from));
        if let Err(error) = result {
            tracing::warn!(%error, "failed to persist registry");
        }
    }
}
