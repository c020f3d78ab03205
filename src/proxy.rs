//! Per-agent reverse-proxy route records.
//!
//! The proxy itself is an external collaborator; this writer only maintains
//! one JSON route file per agent under `<base_dir>/routes/`, created when
//! the runner registers and removed when the agent is killed.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::json;

use crate::registry::AgentRegistration;

const DEFAULT_SERVICE_PORT: u16 = 3000;

pub struct RouteWriter {
    dir: PathBuf,
    domain: String,
}

impl RouteWriter {
    pub fn new(base_dir: &std::path::Path, domain: impl Into<String>) -> Self {
        Self {
            dir: base_dir.join("routes"),
            domain: domain.into(),
        }
    }

    pub fn subdomain_for(&self, agent_id: &str, project: &str) -> String {
        format!("{project}-{agent_id}.{}", self.domain)
    }

    pub fn write_route(&self, reg: &AgentRegistration) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let port = reg.ports.first().copied().unwrap_or(DEFAULT_SERVICE_PORT);
        let route = json!({
            "agentID": reg.agent_id,
            "host": self.subdomain_for(&reg.agent_id, &reg.project),
            "upstream": format!("http://{}:{}", reg.vm_ip, port),
        });
        let path = self.dir.join(format!("{}.json", reg.agent_id));
        std::fs::write(&path, serde_json::to_vec_pretty(&route)?)
            .with_context(|| format!("writing route for {}", reg.agent_id))
    }

    /// Removing a route that was never written is a no-op, not an error.
    pub fn remove_route(&self, agent_id: &str) -> Result<()> {
        let path = self.dir.join(format!("{agent_id}.json"));
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing route for {agent_id}")),
        }
    }
}
