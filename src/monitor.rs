//! Liveness sweep over active slots.
//!
//! The only recovery path for a VM that dies without its runner
//! deregistering: if the hypervisor no longer reports the VM as running,
//! the slot is released back to Cold.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::driver::{ShellOpts, VmDriver, VmStatus};
use crate::pool::PoolManager;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

pub struct Monitor {
    pool: Arc<PoolManager>,
    driver: Arc<dyn VmDriver>,
    interval: Duration,
    runner_service: String,
    shutdown: CancellationToken,
}

impl Monitor {
    pub fn new(
        pool: Arc<PoolManager>,
        driver: Arc<dyn VmDriver>,
        interval: Duration,
        runner_service: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            driver,
            interval,
            runner_service: runner_service.into(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn start(&self) {
        let pool = self.pool.clone();
        let driver = self.driver.clone();
        let runner_service = self.runner_service.clone();
        let shutdown = self.shutdown.clone();
        let period = self.interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = interval.tick() => {
                        sweep_active(&pool, driver.as_ref(), &runner_service).await;
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub async fn sweep(&self) {
        sweep_active(&self.pool, self.driver.as_ref(), &self.runner_service).await;
    }
}

async fn sweep_active(pool: &PoolManager, driver: &dyn VmDriver, runner_service: &str) {
    for slot in pool.active_slots() {
        let inst = match driver.get(&slot.name).await {
            Ok(inst) => inst,
            Err(error) => {
                tracing::warn!(vm = %slot.name, %error, "VM gone, releasing slot");
                if let Err(error) = pool.release(&slot.name) {
                    tracing::warn!(vm = %slot.name, %error, "release failed");
                }
                continue;
            }
        };

        if inst.status != VmStatus::Running {
            tracing::warn!(vm = %slot.name, status = ?inst.status, "VM not running, releasing slot");
            if let Err(error) = pool.release(&slot.name) {
                tracing::warn!(vm = %slot.name, %error, "release failed");
            }
            continue;
        }

        // The runner going inactive usually just means the task finished;
        // observe it, the runner's own deregister does the cleanup.
        let probe = driver
            .shell(ShellOpts {
                instance: slot.name.clone(),
                command: "systemctl".to_string(),
                args: vec!["is-active".to_string(), runner_service.to_string()],
                timeout: Duration::from_secs(10),
            })
            .await;
        match probe {
            Ok(output) if matches!(output.trim(), "active" | "activating") => {}
            Ok(output) => {
                tracing::debug!(vm = %slot.name, output = %output.trim(), "runner not active, agent may have completed");
            }
            Err(error) => {
                tracing::debug!(vm = %slot.name, %error, "runner probe failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;
    use crate::pool::PoolConfig;
    use crate::pool_state::SlotState;

    async fn active_fixture() -> (Monitor, Arc<PoolManager>, Arc<MockDriver>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockDriver::new());
        mock.add_instance("agent-master", VmStatus::Running);

        let pool = PoolManager::new(
            PoolConfig {
                warm_size: 1,
                max_vms: 1,
                master_name: "agent-master".to_string(),
            },
            mock.clone(),
            tmp.path(),
        )
        .unwrap();
        pool.replenish().await;
        pool.claim("agent-1", "proj").await.unwrap();

        let monitor = Monitor::new(
            pool.clone(),
            mock.clone(),
            DEFAULT_SWEEP_INTERVAL,
            "agent-runner.service",
        );
        (monitor, pool, mock, tmp)
    }

    #[tokio::test]
    async fn sweep_releases_slot_when_vm_vanishes() {
        let (monitor, pool, mock, _tmp) = active_fixture().await;
        mock.remove_instance("warm-1");

        monitor.sweep().await;

        assert_eq!(pool.get_slot("warm-1").unwrap().state, SlotState::Cold);
    }

    #[tokio::test]
    async fn sweep_releases_slot_when_vm_stopped() {
        let (monitor, pool, mock, _tmp) = active_fixture().await;
        mock.stop("warm-1").await.unwrap();

        monitor.sweep().await;

        assert_eq!(pool.get_slot("warm-1").unwrap().state, SlotState::Cold);
    }

    #[tokio::test]
    async fn sweep_keeps_running_vm_active() {
        let (monitor, pool, mock, _tmp) = active_fixture().await;
        mock.on_shell(|opts| {
            if opts.command == "systemctl" {
                Ok("active\n".to_string())
            } else {
                Ok(String::new())
            }
        });

        monitor.sweep().await;

        assert_eq!(pool.get_slot("warm-1").unwrap().state, SlotState::Active);
    }
}
