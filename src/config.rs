use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser, Clone)]
#[command(name = "fleetd")]
#[command(about = "Control-plane daemon for a warm pool of agent VMs")]
pub struct Config {
    /// State directory (pool snapshot, registry, routes, mounts).
    /// Defaults to ~/.fleetd.
    #[arg(long)]
    pub base_dir: Option<PathBuf>,

    /// Number of idle VMs to keep ready for claiming.
    #[arg(long, default_value_t = 3)]
    pub warm_size: usize,

    /// Hard cap on total pool slots (idle + active + cold + creating).
    #[arg(long, default_value_t = 15)]
    pub max_vms: usize,

    /// Golden master VM that warm slots are cloned from.
    #[arg(long, default_value = "agent-master")]
    pub master: String,

    /// Port the in-VM runners post registrations and status reports to.
    #[arg(long, default_value_t = 8090)]
    pub registry_port: u16,

    /// Operator API port (REST + /ws), bound to loopback.
    #[arg(long, default_value_t = 8091)]
    pub api_port: u16,

    /// Hostname VMs use to reach this daemon.
    #[arg(long, default_value = "host.lima.internal")]
    pub host: String,

    /// systemd unit of the in-VM runner; restarted on dispatch, tailed for logs.
    #[arg(long, default_value = "agent-runner.service")]
    pub runner_service: String,

    /// Domain suffix for per-agent proxy routes.
    #[arg(long, default_value = "agents.test")]
    pub domain: String,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn base_dir(&self) -> PathBuf {
        match &self.base_dir {
            Some(dir) => dir.clone(),
            None => std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".fleetd"),
        }
    }

    /// Address the in-VM runner reports back to, injected into task configs.
    pub fn host_addr(&self) -> String {
        format!("{}:{}", self.host, self.registry_port)
    }

    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        let base = self.base_dir();
        for dir in [base.clone(), base.join("routes"), base.join("mounts")] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}
