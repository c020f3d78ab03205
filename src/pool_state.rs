//! Durable snapshot of the pool's slot table.
//!
//! The snapshot is a single JSON document rewritten in full on every change.
//! A torn write on crash is tolerable: reconciliation against the hypervisor
//! listing repairs the table on the next start.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Creating,
    Idle,
    Active,
    Cold,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    pub name: String,
    pub state: SlotState,
    #[serde(rename = "agentID", default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<String>,
    #[serde(rename = "vmIP", default, skip_serializing_if = "Option::is_none")]
    pub vm_ip: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "claimedAt", default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
}

impl Slot {
    pub fn creating(name: String) -> Self {
        Self {
            name,
            state: SlotState::Creating,
            agent_id: None,
            project: None,
            tool: None,
            branch: None,
            issue: None,
            vm_ip: None,
            created_at: Utc::now(),
            claimed_at: None,
        }
    }
}

/// Serialized pool state. The counter is strictly increasing across the
/// process lifetime and seeds `warm-<counter>` VM names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolSnapshot {
    #[serde(default)]
    pub slots: Vec<Slot>,
    #[serde(default)]
    pub counter: u64,
}

pub struct PoolStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl PoolStore {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            path: base_dir.join("pool-state.json"),
            write_lock: Mutex::new(()),
        }
    }

    /// Returns the empty snapshot when the file does not exist (first boot).
    pub fn load(&self) -> Result<PoolSnapshot> {
        let _guard = self.write_lock.lock();
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PoolSnapshot::default())
            }
            Err(err) => return Err(err).context("reading pool state"),
        };
        serde_json::from_slice(&data).context("parsing pool state")
    }

    pub fn save(&self, snapshot: &PoolSnapshot) -> Result<()> {
        let _guard = self.write_lock.lock();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(snapshot)?;
        std::fs::write(&self.path, data).context("writing pool state")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PoolStore::new(tmp.path());

        let mut active = Slot::creating("warm-2".to_string());
        active.state = SlotState::Active;
        active.agent_id = Some("agent-1".to_string());
        active.claimed_at = Some(Utc::now());

        let snapshot = PoolSnapshot {
            slots: vec![
                Slot {
                    state: SlotState::Idle,
                    ..Slot::creating("warm-1".to_string())
                },
                active,
            ],
            counter: 5,
        };

        store.save(&snapshot).unwrap();
        assert!(tmp.path().join("pool-state.json").exists());

        let loaded = store.load().unwrap();
        assert_eq!(loaded.counter, 5);
        assert_eq!(loaded.slots.len(), 2);
        assert_eq!(loaded.slots[0].state, SlotState::Idle);
        assert_eq!(loaded.slots[1].agent_id.as_deref(), Some("agent-1"));
    }

    #[test]
    fn load_missing_file_returns_empty_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PoolStore::new(tmp.path());

        let snapshot = store.load().unwrap();
        assert!(snapshot.slots.is_empty());
        assert_eq!(snapshot.counter, 0);
    }

    #[test]
    fn slot_wire_format_uses_original_field_names() {
        let mut slot = Slot::creating("warm-7".to_string());
        slot.state = SlotState::Active;
        slot.agent_id = Some("agent-9".to_string());
        slot.vm_ip = Some("192.168.64.9".to_string());

        let json = serde_json::to_value(&slot).unwrap();
        assert_eq!(json["agentID"], "agent-9");
        assert_eq!(json["vmIP"], "192.168.64.9");
        assert_eq!(json["state"], "active");
        assert!(json.get("claimedAt").is_none());
    }
}
