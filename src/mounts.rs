//! SSHFS mounts of agent workspaces.
//!
//! Lets an operator browse a running agent's working tree locally. One
//! mount point per agent under `<base_dir>/mounts/`; mounting twice returns
//! the existing mount point.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tokio::process::Command;
use tokio::time::timeout;

const MOUNT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct MountManager {
    mount_dir: PathBuf,
    mounts: Mutex<HashMap<String, PathBuf>>,
}

impl MountManager {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            mount_dir: base_dir.join("mounts"),
            mounts: Mutex::new(HashMap::new()),
        }
    }

    pub async fn mount(
        &self,
        vm_name: &str,
        agent_id: &str,
        project: &str,
        remote_path: Option<String>,
    ) -> Result<PathBuf> {
        if let Some(existing) = self.mounts.lock().get(agent_id) {
            return Ok(existing.clone());
        }

        let remote = remote_path.unwrap_or_else(|| default_remote_path(project));
        let mount_point = self.mount_dir.join(agent_id);
        std::fs::create_dir_all(&mount_point).context("creating mount point")?;

        let args = sshfs_args(vm_name, &remote, &mount_point);
        let output = timeout(
            MOUNT_TIMEOUT,
            Command::new("sshfs")
                .args(&args)
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .context("sshfs timed out")?
        .context("spawning sshfs")?;

        if !output.status.success() {
            bail!(
                "sshfs failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        self.mounts
            .lock()
            .insert(agent_id.to_string(), mount_point.clone());
        tracing::info!(agent = %agent_id, mount = %mount_point.display(), "workspace mounted");
        Ok(mount_point)
    }

    pub async fn unmount(&self, agent_id: &str) -> Result<()> {
        let mount_point = match self.mounts.lock().remove(agent_id) {
            Some(mp) => mp,
            None => bail!("agent {agent_id:?} is not mounted"),
        };

        // fusermount on Linux, plain umount elsewhere.
        let attempts: [(&str, Vec<String>); 2] = [
            (
                "fusermount",
                vec!["-u".to_string(), mount_point.display().to_string()],
            ),
            ("umount", vec![mount_point.display().to_string()]),
        ];
        for (cmd, args) in attempts {
            if let Ok(output) = Command::new(cmd).args(&args).output().await {
                if output.status.success() {
                    tracing::info!(agent = %agent_id, "workspace unmounted");
                    return Ok(());
                }
            }
        }

        // Put the record back so a retry is possible.
        self.mounts.lock().insert(agent_id.to_string(), mount_point);
        bail!("could not unmount workspace for {agent_id:?}")
    }

    pub async fn unmount_all(&self) {
        let agents: Vec<String> = self.mounts.lock().keys().cloned().collect();
        for agent_id in agents {
            if let Err(error) = self.unmount(&agent_id).await {
                tracing::warn!(agent = %agent_id, %error, "unmount during shutdown failed");
            }
        }
    }
}

fn default_remote_path(project: &str) -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "agent".to_string());
    format!("/home/{user}.linux/workspace/{project}")
}

fn sshfs_args(vm_name: &str, remote: &str, mount_point: &Path) -> Vec<String> {
    let lima_dir = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(".lima")
        .join(vm_name);

    vec![
        "-F".to_string(),
        lima_dir.join("ssh.config").display().to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        "LogLevel=ERROR".to_string(),
        format!("lima-{vm_name}:{remote}"),
        mount_point.display().to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unmount_unknown_agent_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let mounts = MountManager::new(tmp.path());

        let err = mounts.unmount("ghost").await.unwrap_err();
        assert!(err.to_string().contains("not mounted"));
    }

    #[test]
    fn sshfs_args_target_lima_host() {
        let args = sshfs_args("warm-3", "/home/agent.linux/workspace/proj", Path::new("/mnt/a"));
        assert!(args.contains(&"lima-warm-3:/home/agent.linux/workspace/proj".to_string()));
        assert_eq!(args.last().unwrap(), "/mnt/a");
        assert!(args.iter().any(|a| a.ends_with("ssh.config")));
    }

    #[test]
    fn default_remote_path_uses_project() {
        let path = default_remote_path("proj");
        assert!(path.ends_with("/workspace/proj"));
    }
}
