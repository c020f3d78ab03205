//! Warm-pool scheduler.
//!
//! Keeps a configurable number of idle VMs cloned from the golden master and
//! ready to claim. The slot table and naming counter live behind one mutex;
//! hypervisor calls always happen outside it so that a slow clone never
//! blocks a claim. Reconciliation against the hypervisor listing runs on
//! startup and is the sole authority for pruning orphaned records.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::driver::{lookup_ip, CloneOpts, DriverError, VmDriver, DEFAULT_CLONE_TIMEOUT};
use crate::pool_state::{PoolSnapshot, PoolStore, Slot, SlotState};

const REPLENISH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub warm_size: usize,
    pub max_vms: usize,
    pub master_name: String,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no warm VMs available; retry after the next replenish tick")]
    NoIdleSlot,

    #[error("VM {0:?} not found in pool")]
    UnknownSlot(String),

    #[error("deleting VM {name}: {source}")]
    Driver {
        name: String,
        #[source]
        source: DriverError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolCounts {
    pub warm: usize,
    pub active: usize,
    pub cold: usize,
}

struct PoolInner {
    slots: Vec<Slot>,
    counter: u64,
    warm_size: usize,
}

pub struct PoolManager {
    master: String,
    max_vms: usize,
    driver: Arc<dyn VmDriver>,
    store: PoolStore,
    inner: Mutex<PoolInner>,
    shutdown: CancellationToken,
    weak_self: Weak<PoolManager>,
}

impl PoolManager {
    pub fn new(
        cfg: PoolConfig,
        driver: Arc<dyn VmDriver>,
        base_dir: &Path,
    ) -> anyhow::Result<Arc<Self>> {
        let store = PoolStore::new(base_dir);
        let state = store.load()?;

        Ok(Arc::new_cyclic(|weak| Self {
            master: cfg.master_name,
            max_vms: cfg.max_vms,
            driver,
            store,
            inner: Mutex::new(PoolInner {
                slots: state.slots,
                counter: state.counter,
                warm_size: cfg.warm_size,
            }),
            shutdown: CancellationToken::new(),
            weak_self: weak.clone(),
        }))
    }

    /// Reconcile persisted state against the hypervisor, then run the
    /// background replenish loop until [`PoolManager::stop`].
    pub async fn start(&self) {
        self.reconcile().await;

        let Some(mgr) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            mgr.replenish().await;
            let mut interval = tokio::time::interval(REPLENISH_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = mgr.shutdown.cancelled() => return,
                    _ = interval.tick() => mgr.replenish().await,
                }
            }
        });
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Claim the first idle slot for an agent. Never blocks waiting for a
    /// VM: an empty pool is a capacity error the caller may retry.
    pub async fn claim(&self, agent_id: &str, project: &str) -> Result<Slot, PoolError> {
        let mut claimed = {
            let mut inner = self.inner.lock();
            let idx = inner
                .slots
                .iter()
                .position(|s| s.state == SlotState::Idle)
                .ok_or(PoolError::NoIdleSlot)?;
            {
                let slot = &mut inner.slots[idx];
                slot.state = SlotState::Active;
                slot.agent_id = Some(agent_id.to_string());
                slot.project = Some(project.to_string());
                slot.claimed_at = Some(Utc::now());
            }
            let slot = inner.slots[idx].clone();
            self.persist_locked(&inner);
            slot
        };

        // IP probe outside the lock; claims would otherwise serialize behind
        // one guest shell call. Written back only if the claim still stands.
        match lookup_ip(self.driver.as_ref(), &claimed.name).await {
            Ok(ip) => {
                let mut inner = self.inner.lock();
                if let Some(slot) = inner.slots.iter_mut().find(|s| {
                    s.name == claimed.name
                        && s.state == SlotState::Active
                        && s.agent_id.as_deref() == Some(agent_id)
                }) {
                    slot.vm_ip = Some(ip.clone());
                    claimed.vm_ip = Some(ip);
                    self.persist_locked(&inner);
                }
            }
            Err(error) => {
                tracing::warn!(vm = %claimed.name, %error, "could not resolve VM IP");
            }
        }

        if let Some(mgr) = self.weak_self.upgrade() {
            tokio::spawn(async move { mgr.replenish().await });
        }

        Ok(claimed)
    }

    /// Active → Cold. The record is kept so operators can inspect the VM;
    /// cold slots linger until destroyed or reconciled away.
    pub fn release(&self, name: &str) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| PoolError::UnknownSlot(name.to_string()))?;
        slot.state = SlotState::Cold;
        slot.agent_id = None;
        slot.project = None;
        self.persist_locked(&inner);
        Ok(())
    }

    /// Remove the record first, then delete the VM: a crash in between
    /// leaves a dangling VM (visible in the hypervisor) rather than a
    /// dangling record.
    pub async fn destroy(&self, name: &str) -> Result<(), PoolError> {
        {
            let mut inner = self.inner.lock();
            let idx = inner
                .slots
                .iter()
                .position(|s| s.name == name)
                .ok_or_else(|| PoolError::UnknownSlot(name.to_string()))?;
            inner.slots.remove(idx);
            self.persist_locked(&inner);
        }

        self.driver
            .delete(name, true)
            .await
            .map_err(|source| PoolError::Driver {
                name: name.to_string(),
                source,
            })
    }

    /// Bring the idle count back up to `warm_size`, bounded by `max_vms`.
    /// Safe to call concurrently: each reservation re-checks the cap under
    /// the lock, so racing replenishers never overshoot the total.
    pub async fn replenish(&self) {
        let needed = {
            let inner = self.inner.lock();
            let idle = inner
                .slots
                .iter()
                .filter(|s| s.state == SlotState::Idle)
                .count();
            inner
                .warm_size
                .saturating_sub(idle)
                .min(self.max_vms.saturating_sub(inner.slots.len()))
        };
        if needed == 0 {
            return;
        }

        tracing::info!(needed, "replenishing warm pool");

        for _ in 0..needed {
            if self.shutdown.is_cancelled() {
                return;
            }

            let name = {
                let mut inner = self.inner.lock();
                if inner.slots.len() >= self.max_vms {
                    break;
                }
                inner.counter += 1;
                let name = format!("warm-{}", inner.counter);
                inner.slots.push(Slot::creating(name.clone()));
                self.persist_locked(&inner);
                name
            };

            tracing::info!(vm = %name, master = %self.master, "cloning warm VM");
            let result = self
                .driver
                .clone_vm(CloneOpts {
                    source: self.master.clone(),
                    target: name.clone(),
                    start: true,
                    timeout: DEFAULT_CLONE_TIMEOUT,
                })
                .await;

            let mut inner = self.inner.lock();
            match result {
                Ok(()) => {
                    if let Some(slot) = inner.slots.iter_mut().find(|s| s.name == name) {
                        slot.state = SlotState::Idle;
                    }
                    tracing::info!(vm = %name, "warm VM ready");
                }
                Err(error) => {
                    tracing::warn!(vm = %name, %error, "failed to clone warm VM");
                    inner.slots.retain(|s| s.name != name);
                }
            }
            self.persist_locked(&inner);
        }
    }

    /// Drop every slot whose VM no longer exists in the hypervisor.
    pub async fn reconcile(&self) {
        let instances = match self.driver.list().await {
            Ok(instances) => instances,
            Err(error) => {
                tracing::warn!(%error, "could not list VMs for reconciliation");
                return;
            }
        };
        let live: HashSet<String> = instances.into_iter().map(|i| i.name).collect();

        let mut inner = self.inner.lock();
        inner.slots.retain(|slot| {
            let keep = live.contains(&slot.name);
            if !keep {
                tracing::info!(slot = %slot.name, "reconcile: removing stale slot");
            }
            keep
        });
        self.persist_locked(&inner);
    }

    /// Destroy every currently idle slot.
    pub async fn drain(&self) {
        let idle: Vec<String> = {
            let inner = self.inner.lock();
            inner
                .slots
                .iter()
                .filter(|s| s.state == SlotState::Idle)
                .map(|s| s.name.clone())
                .collect()
        };

        for name in idle {
            if let Err(error) = self.destroy(&name).await {
                tracing::warn!(vm = %name, %error, "failed to destroy idle VM during drain");
            }
        }
    }

    /// Takes effect on the next replenish tick.
    pub fn resize(&self, warm_size: usize) {
        self.inner.lock().warm_size = warm_size;
    }

    pub fn status(&self) -> PoolCounts {
        let inner = self.inner.lock();
        let mut counts = PoolCounts::default();
        for slot in &inner.slots {
            match slot.state {
                SlotState::Idle => counts.warm += 1,
                SlotState::Active => counts.active += 1,
                SlotState::Cold => counts.cold += 1,
                SlotState::Creating => {}
            }
        }
        counts
    }

    pub fn active_slots(&self) -> Vec<Slot> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .filter(|s| s.state == SlotState::Active)
            .cloned()
            .collect()
    }

    /// Look up a slot by VM name or by the agent bound to it.
    pub fn get_slot(&self, key: &str) -> Option<Slot> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .find(|s| s.name == key || s.agent_id.as_deref() == Some(key))
            .cloned()
    }

    fn persist_locked(&self, inner: &PoolInner) {
        let snapshot = PoolSnapshot {
            slots: inner.slots.clone(),
            counter: inner.counter,
        };
        if let Err(error) = self.store.save(&snapshot) {
            tracing::warn!(%error, "failed to persist pool state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MockDriver, VmStatus};

    fn test_pool(warm_size: usize, max_vms: usize) -> (Arc<PoolManager>, Arc<MockDriver>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockDriver::new());
        mock.add_instance("agent-master", VmStatus::Running);

        let mgr = PoolManager::new(
            PoolConfig {
                warm_size,
                max_vms,
                master_name: "agent-master".to_string(),
            },
            mock.clone(),
            tmp.path(),
        )
        .unwrap();

        (mgr, mock, tmp)
    }

    fn seed_idle(mgr: &PoolManager, name: &str) {
        let mut inner = mgr.inner.lock();
        let mut slot = Slot::creating(name.to_string());
        slot.state = SlotState::Idle;
        inner.slots.push(slot);
    }

    #[tokio::test]
    async fn claim_from_empty_pool_is_capacity_error() {
        let (mgr, _, _tmp) = test_pool(0, 10);

        let err = mgr.claim("agent-1", "proj").await.unwrap_err();
        assert!(matches!(err, PoolError::NoIdleSlot));
        assert_eq!(mgr.status(), PoolCounts::default());
    }

    #[tokio::test]
    async fn claim_and_release_walk_the_state_machine() {
        let (mgr, mock, _tmp) = test_pool(0, 10);
        mock.add_instance("warm-1", VmStatus::Running);
        mock.on_shell(|_| Ok("192.168.64.5\n".to_string()));
        seed_idle(&mgr, "warm-1");

        let slot = mgr.claim("agent-1", "proj").await.unwrap();
        assert_eq!(slot.state, SlotState::Active);
        assert_eq!(slot.agent_id.as_deref(), Some("agent-1"));
        assert_eq!(slot.vm_ip.as_deref(), Some("192.168.64.5"));
        assert!(slot.claimed_at.is_some());
        assert_eq!(
            mgr.status(),
            PoolCounts {
                warm: 0,
                active: 1,
                cold: 0
            }
        );

        mgr.release("warm-1").unwrap();
        let cold = mgr.get_slot("warm-1").unwrap();
        assert_eq!(cold.state, SlotState::Cold);
        assert!(cold.agent_id.is_none());
        assert!(cold.project.is_none());
        assert_eq!(
            mgr.status(),
            PoolCounts {
                warm: 0,
                active: 0,
                cold: 1
            }
        );
    }

    #[tokio::test]
    async fn claim_tolerates_ip_probe_failure() {
        let (mgr, mock, _tmp) = test_pool(0, 10);
        mock.add_instance("warm-1", VmStatus::Running);
        mock.on_shell(|opts| {
            Err(DriverError::CommandFailed {
                op: "shell",
                instance: opts.instance.clone(),
                stderr: "ssh unreachable".to_string(),
            })
        });
        seed_idle(&mgr, "warm-1");

        let slot = mgr.claim("agent-1", "proj").await.unwrap();
        assert_eq!(slot.state, SlotState::Active);
        assert!(slot.vm_ip.is_none());
    }

    #[tokio::test]
    async fn release_unknown_slot_errors() {
        let (mgr, _, _tmp) = test_pool(0, 10);
        assert!(matches!(
            mgr.release("nope"),
            Err(PoolError::UnknownSlot(_))
        ));
    }

    #[tokio::test]
    async fn destroy_removes_record_and_vm() {
        let (mgr, mock, _tmp) = test_pool(0, 10);
        mock.add_instance("warm-1", VmStatus::Running);
        seed_idle(&mgr, "warm-1");

        mgr.destroy("warm-1").await.unwrap();
        assert_eq!(mgr.status(), PoolCounts::default());
        assert!(!mock.has_instance("warm-1"));
    }

    #[tokio::test]
    async fn get_slot_matches_name_or_agent() {
        let (mgr, _, _tmp) = test_pool(0, 10);
        {
            let mut inner = mgr.inner.lock();
            let mut slot = Slot::creating("warm-1".to_string());
            slot.state = SlotState::Active;
            slot.agent_id = Some("agent-42".to_string());
            inner.slots.push(slot);
        }

        assert!(mgr.get_slot("warm-1").is_some());
        assert_eq!(
            mgr.get_slot("agent-42").unwrap().name,
            "warm-1".to_string()
        );
        assert!(mgr.get_slot("nonexistent").is_none());
    }

    #[tokio::test]
    async fn replenish_fills_to_warm_size() {
        let (mgr, _, _tmp) = test_pool(3, 10);

        mgr.replenish().await;

        assert_eq!(
            mgr.status(),
            PoolCounts {
                warm: 3,
                active: 0,
                cold: 0
            }
        );
        assert!(mgr.get_slot("warm-1").is_some());
        assert!(mgr.get_slot("warm-3").is_some());
        assert_eq!(mgr.inner.lock().counter, 3);
    }

    #[tokio::test]
    async fn replenish_never_exceeds_max_vms() {
        let (mgr, _, _tmp) = test_pool(3, 2);

        mgr.replenish().await;
        assert_eq!(mgr.inner.lock().slots.len(), 2);

        // Already at capacity: a second pass creates nothing.
        mgr.replenish().await;
        assert_eq!(mgr.inner.lock().slots.len(), 2);
    }

    #[tokio::test]
    async fn replenish_removes_slot_on_clone_failure() {
        let (mgr, mock, _tmp) = test_pool(2, 10);
        mock.fail_clone("disk full");

        mgr.replenish().await;

        assert!(mgr.inner.lock().slots.is_empty());
        // Counter still advanced: names are never reused.
        assert_eq!(mgr.inner.lock().counter, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_replenish_holds_the_cap() {
        let (mgr, _, _tmp) = test_pool(4, 5);

        let a = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.replenish().await })
        };
        let b = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.replenish().await })
        };
        let (ra, rb) = tokio::join!(a, b);
        ra.unwrap();
        rb.unwrap();

        let inner = mgr.inner.lock();
        assert!(inner.slots.len() <= 5, "pool overshot: {}", inner.slots.len());
        let names: HashSet<&str> = inner.slots.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names.len(), inner.slots.len(), "duplicate VM names");
    }

    #[tokio::test]
    async fn reconcile_drops_slots_missing_from_hypervisor() {
        let (mgr, mock, _tmp) = test_pool(0, 10);
        mock.add_instance("warm-1", VmStatus::Running);
        {
            let mut inner = mgr.inner.lock();
            inner.counter = 2;
            let mut idle = Slot::creating("warm-1".to_string());
            idle.state = SlotState::Idle;
            inner.slots.push(idle);
            let mut active = Slot::creating("warm-2".to_string());
            active.state = SlotState::Active;
            active.agent_id = Some("agent-a".to_string());
            inner.slots.push(active);
        }

        mgr.reconcile().await;

        let inner = mgr.inner.lock();
        assert_eq!(inner.slots.len(), 1);
        assert_eq!(inner.slots[0].name, "warm-1");
        assert_eq!(inner.counter, 2, "counter must survive reconciliation");
    }

    #[tokio::test]
    async fn drain_destroys_only_idle_slots() {
        let (mgr, mock, _tmp) = test_pool(0, 10);
        mock.add_instance("warm-1", VmStatus::Running);
        mock.add_instance("warm-2", VmStatus::Running);
        seed_idle(&mgr, "warm-1");
        {
            let mut inner = mgr.inner.lock();
            let mut active = Slot::creating("warm-2".to_string());
            active.state = SlotState::Active;
            active.agent_id = Some("agent-a".to_string());
            inner.slots.push(active);
        }

        mgr.drain().await;

        assert!(mgr.get_slot("warm-1").is_none());
        assert!(!mock.has_instance("warm-1"));
        assert!(mgr.get_slot("warm-2").is_some());
        assert!(mock.has_instance("warm-2"));
    }

    #[tokio::test]
    async fn resize_takes_effect_on_next_replenish() {
        let (mgr, _, _tmp) = test_pool(1, 10);

        mgr.replenish().await;
        assert_eq!(mgr.status().warm, 1);

        mgr.resize(3);
        mgr.replenish().await;
        assert_eq!(mgr.status().warm, 3);
    }

    #[tokio::test]
    async fn pool_state_survives_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockDriver::new());
        mock.add_instance("agent-master", VmStatus::Running);

        let cfg = PoolConfig {
            warm_size: 2,
            max_vms: 10,
            master_name: "agent-master".to_string(),
        };
        {
            let mgr = PoolManager::new(cfg.clone(), mock.clone(), tmp.path()).unwrap();
            mgr.replenish().await;
        }

        let reborn = PoolManager::new(cfg, mock, tmp.path()).unwrap();
        let inner = reborn.inner.lock();
        assert_eq!(inner.slots.len(), 2);
        assert_eq!(inner.counter, 2);
    }
}
