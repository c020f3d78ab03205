//! Task dispatch pipeline.
//!
//! A dispatch claims a warm slot, ships the task config and env file into
//! the VM, and restarts the in-VM runner. Any failure after the claim
//! releases the slot back to Cold so operators can inspect the VM; nothing
//! is ever left stuck Active.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::driver::{CopyDirection, CopyOpts, DriverError, ShellOpts, VmDriver};
use crate::pool::{PoolError, PoolManager};
use crate::pool_state::Slot;

pub const VALID_TOOLS: [&str; 4] = ["claude-code", "opencode", "amp", "cline"];
pub const TASK_CONFIG_VM_PATH: &str = "/etc/agent-config/task.json";
pub const ENV_FILE_VM_PATH: &str = "/etc/agent-config/env";

const DEFAULT_MAX_TIME_MINUTES: u64 = 30;
const RESTART_TIMEOUT: Duration = Duration::from_secs(30);

/// The contract shipped into the VM at `/etc/agent-config/task.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(rename = "agentID")]
    pub agent_id: String,
    pub project: String,
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<String>,
    pub tool: String,
    pub prompt: String,
    pub branch: String,
    /// Minutes; defaults to 30.
    #[serde(rename = "maxTime")]
    pub max_time: u64,
    #[serde(rename = "envVars", default, skip_serializing_if = "HashMap::is_empty")]
    pub env_vars: HashMap<String, String>,
    #[serde(rename = "hostAddr")]
    pub host_addr: String,
    #[serde(rename = "dispatchedAt")]
    pub dispatched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DispatchRequest {
    #[serde(default)]
    pub project: String,
    #[serde(rename = "repoURL", default)]
    pub repo_url: String,
    #[serde(default)]
    pub issue: Option<String>,
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(rename = "maxTime", default)]
    pub max_time: Option<u64>,
    #[serde(rename = "envVars", default)]
    pub env_vars: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchResult {
    #[serde(rename = "agentID")]
    pub agent_id: String,
    #[serde(rename = "vmName")]
    pub vm_name: String,
    #[serde(rename = "vmIP")]
    pub vm_ip: String,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid task: {0}")]
    Invalid(String),

    #[error("claiming VM: {0}")]
    Claim(#[from] PoolError),

    #[error("{stage}: {source}")]
    Driver {
        stage: &'static str,
        #[source]
        source: DriverError,
    },

    #[error("{stage}: {source}")]
    Staging {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("encoding task config: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Checks required fields and fills in the defaulted ones.
pub fn validate_task(task: &mut TaskConfig) -> Result<(), DispatchError> {
    if task.project.is_empty() {
        return Err(DispatchError::Invalid("project is required".to_string()));
    }
    if task.repo_url.is_empty() {
        return Err(DispatchError::Invalid("repoURL is required".to_string()));
    }
    if task.prompt.is_empty() {
        return Err(DispatchError::Invalid("prompt is required".to_string()));
    }
    if !VALID_TOOLS.contains(&task.tool.as_str()) {
        return Err(DispatchError::Invalid(format!(
            "invalid tool {:?} (valid: {})",
            task.tool,
            VALID_TOOLS.join(", ")
        )));
    }
    if task.max_time == 0 {
        task.max_time = DEFAULT_MAX_TIME_MINUTES;
    }
    if task.branch.is_empty() {
        task.branch = format!("agent/{}/{}", task.project, task.agent_id);
    }
    Ok(())
}

fn generate_agent_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("agent-{}", nanos % 100_000)
}

pub struct Dispatcher {
    pool: Arc<PoolManager>,
    driver: Arc<dyn VmDriver>,
    host_addr: String,
    runner_service: String,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<PoolManager>,
        driver: Arc<dyn VmDriver>,
        host_addr: impl Into<String>,
        runner_service: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            driver,
            host_addr: host_addr.into(),
            runner_service: runner_service.into(),
        }
    }

    pub async fn dispatch(&self, req: DispatchRequest) -> Result<DispatchResult, DispatchError> {
        let agent_id = generate_agent_id();

        let mut task = TaskConfig {
            agent_id: agent_id.clone(),
            project: req.project.clone(),
            repo_url: req.repo_url,
            issue: req.issue,
            tool: req.tool,
            prompt: req.prompt,
            branch: req.branch.unwrap_or_default(),
            max_time: req.max_time.unwrap_or(0),
            env_vars: req.env_vars,
            host_addr: self.host_addr.clone(),
            dispatched_at: Utc::now(),
        };
        validate_task(&mut task)?;

        let slot = self.pool.claim(&agent_id, &req.project).await?;
        tracing::info!(agent = %agent_id, vm = %slot.name, "dispatching task");

        if let Err(error) = self.inject_and_start(&task, &slot).await {
            if let Err(release_error) = self.pool.release(&slot.name) {
                tracing::warn!(vm = %slot.name, error = %release_error, "rollback release failed");
            }
            return Err(error);
        }

        Ok(DispatchResult {
            agent_id,
            vm_name: slot.name,
            vm_ip: slot.vm_ip.unwrap_or_default(),
        })
    }

    async fn inject_and_start(&self, task: &TaskConfig, slot: &Slot) -> Result<(), DispatchError> {
        let staged = NamedTempFile::new().map_err(|source| DispatchError::Staging {
            stage: "staging task config",
            source,
        })?;
        std::fs::write(staged.path(), serde_json::to_vec_pretty(task)?).map_err(|source| {
            DispatchError::Staging {
                stage: "writing task config",
                source,
            }
        })?;
        self.driver
            .copy(CopyOpts {
                instance: slot.name.clone(),
                direction: CopyDirection::ToVm,
                local_path: staged.path().to_path_buf(),
                vm_path: TASK_CONFIG_VM_PATH.to_string(),
            })
            .await
            .map_err(|source| DispatchError::Driver {
                stage: "injecting task config",
                source,
            })?;

        let mut env = format!(
            "AGENT_ID={}\nAGENT_PROJECT={}\nAGENT_HOST={}\n",
            task.agent_id, task.project, task.host_addr
        );
        for (key, value) in &task.env_vars {
            env.push_str(&format!("{key}={value}\n"));
        }
        let env_staged = NamedTempFile::new().map_err(|source| DispatchError::Staging {
            stage: "staging env file",
            source,
        })?;
        std::fs::write(env_staged.path(), env).map_err(|source| DispatchError::Staging {
            stage: "writing env file",
            source,
        })?;
        self.driver
            .copy(CopyOpts {
                instance: slot.name.clone(),
                direction: CopyDirection::ToVm,
                local_path: env_staged.path().to_path_buf(),
                vm_path: ENV_FILE_VM_PATH.to_string(),
            })
            .await
            .map_err(|source| DispatchError::Driver {
                stage: "injecting env file",
                source,
            })?;

        self.driver
            .shell(ShellOpts {
                instance: slot.name.clone(),
                command: "sudo".to_string(),
                args: vec![
                    "systemctl".to_string(),
                    "restart".to_string(),
                    self.runner_service.clone(),
                ],
                timeout: RESTART_TIMEOUT,
            })
            .await
            .map_err(|source| DispatchError::Driver {
                stage: "restarting runner",
                source,
            })?;

        Ok(())
    }
}
