//! Durable install state.
//!
//! The state file is the single source of truth for what is currently
//! bootable. It is read at action start, mutated in memory, and flushed to
//! disk exactly once, at the point the new slot is confirmed bootable; any
//! earlier failure leaves the on-disk file untouched. The write itself is a
//! minimal atomic unit: temp file, fsync, rename.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::LifecycleError;

pub const STATE_FILE: &str = "state.yaml";
pub const STATE_LOCK_FILE: &str = ".state.lock";

/// Record for one A/B snapshot. Exactly one snapshot is active at steady
/// state; the previous active one is kept as the passive fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotState {
    pub from_action: String,
    pub source: String,
    pub digest: Option<String>,
    pub label: String,
    #[serde(default)]
    pub active: bool,
}

/// Record for the recovery image, outside the A/B rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryState {
    pub from_action: String,
    pub source: String,
    pub digest: Option<String>,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRecord {
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Top-level persisted record. YAML keys (`date`, `state`, `recovery`,
/// `oem`, `persistent`) are an external contract read by the `state`
/// subcommand and by the installed OS.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstallState {
    #[serde(default)]
    pub date: String,
    #[serde(rename = "state", default)]
    pub snapshots: BTreeMap<u32, SnapshotState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oem: Option<PartitionRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent: Option<PartitionRecord>,
}

impl InstallState {
    pub fn active_snapshot(&self) -> Option<(u32, &SnapshotState)> {
        self.snapshots.iter().find(|(_, s)| s.active).map(|(id, s)| (*id, s))
    }

    pub fn next_snapshot_id(&self) -> u32 {
        self.snapshots.keys().max().copied().unwrap_or(0) + 1
    }

    /// Record a new active snapshot, demoting the previous one to passive.
    /// No other snapshot's flag changes.
    pub fn record_snapshot(&mut self, id: u32, mut snapshot: SnapshotState) {
        snapshot.active = true;
        if let Some((old_id, _)) = self.active_snapshot() {
            if old_id != id {
                if let Some(old) = self.snapshots.get_mut(&old_id) {
                    old.active = false;
                }
            }
        }
        self.snapshots.insert(id, snapshot);
    }

    /// Drop records for snapshots that no longer exist on disk.
    pub fn retain_snapshots(&mut self, existing: &[u32]) {
        self.snapshots.retain(|id, _| existing.contains(id));
    }

    pub fn touch_date(&mut self) {
        self.date = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
    }
}

/// Load the state file from a state-partition mount, if present.
pub fn load(state_mount: &Path) -> Result<Option<InstallState>> {
    let path = state_mount.join(STATE_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("reading '{}'", path.display()))?;
    let state: InstallState =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing '{}'", path.display()))?;
    Ok(Some(state))
}

/// Atomically write the state file under one or more roots (state partition
/// always, recovery partition as a secondary copy when mounted).
pub fn persist(state: &InstallState, roots: &[&Path]) -> Result<(), LifecycleError> {
    for root in roots {
        write_one(state, root).map_err(LifecycleError::StatePersistFailed)?;
    }
    Ok(())
}

fn write_one(state: &InstallState, root: &Path) -> Result<()> {
    let path = root.join(STATE_FILE);
    let tmp = root.join(format!("{STATE_FILE}.tmp"));
    let yaml = serde_yaml::to_string(state).context("serializing install state")?;

    {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("creating '{}'", tmp.display()))?;
        file.write_all(yaml.as_bytes())
            .with_context(|| format!("writing '{}'", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("syncing '{}'", tmp.display()))?;
    }
    fs::rename(&tmp, &path)
        .with_context(|| format!("renaming '{}' into place", tmp.display()))?;
    if let Ok(dir) = fs::File::open(root) {
        // Make the rename itself durable.
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Exclusive lock guarding the state file for the duration of an action.
/// Concurrent invocations against the same target are documented misuse;
/// the lock turns the likely accidents into a clean failure.
pub struct StateLock {
    file: fs::File,
    _path: PathBuf,
}

impl StateLock {
    pub fn acquire(state_mount: &Path) -> Result<Self> {
        let path = state_mount.join(STATE_LOCK_FILE);
        let file = fs::File::create(&path)
            .with_context(|| format!("creating lock file '{}'", path.display()))?;
        file.try_lock_exclusive()
            .with_context(|| format!("locking '{}' (another action in flight?)", path.display()))?;
        Ok(Self { file, _path: path })
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(action: &str) -> SnapshotState {
        SnapshotState {
            from_action: action.to_string(),
            source: "dir:/rootfs".to_string(),
            digest: Some("sha256:abc".to_string()),
            label: "SLOT_A".to_string(),
            active: false,
        }
    }

    #[test]
    fn record_snapshot_keeps_exactly_one_active() {
        let mut state = InstallState::default();
        state.record_snapshot(1, snapshot("install"));
        state.record_snapshot(2, snapshot("upgrade"));
        state.record_snapshot(3, snapshot("upgrade"));

        let active: Vec<u32> = state
            .snapshots
            .iter()
            .filter(|(_, s)| s.active)
            .map(|(id, _)| *id)
            .collect();
        assert_eq!(active, vec![3]);
        // Previous snapshots remain present as fallback history.
        assert_eq!(state.snapshots.len(), 3);
        assert!(!state.snapshots[&1].active);
        assert!(!state.snapshots[&2].active);
    }

    #[test]
    fn next_snapshot_id_is_monotonic() {
        let mut state = InstallState::default();
        assert_eq!(state.next_snapshot_id(), 1);
        state.record_snapshot(1, snapshot("install"));
        assert_eq!(state.next_snapshot_id(), 2);
        state.record_snapshot(7, snapshot("upgrade"));
        assert_eq!(state.next_snapshot_id(), 8);
    }

    #[test]
    fn yaml_round_trip_uses_contract_keys() {
        let mut state = InstallState::default();
        state.touch_date();
        state.record_snapshot(1, snapshot("install"));
        state.recovery = Some(RecoveryState {
            from_action: "install".into(),
            source: "dir:/rootfs".into(),
            digest: None,
            label: "SLOT_RECOVERY".into(),
        });
        state.oem = Some(PartitionRecord {
            label: "SLOT_OEM".into(),
            digest: None,
        });

        let yaml = serde_yaml::to_string(&state).unwrap();
        assert!(yaml.contains("state:"));
        assert!(yaml.contains("recovery:"));
        assert!(yaml.contains("oem:"));
        assert!(yaml.contains("from_action: install"));

        let parsed: InstallState = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn persist_and_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut state = InstallState::default();
        state.record_snapshot(1, snapshot("install"));
        persist(&state, &[tmp.path()]).unwrap();

        let loaded = load(tmp.path()).unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(!tmp.path().join(format!("{STATE_FILE}.tmp")).exists());
    }

    #[test]
    fn load_missing_file_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(load(tmp.path()).unwrap().is_none());
    }

    #[test]
    fn state_lock_is_exclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let first = StateLock::acquire(tmp.path()).unwrap();
        assert!(StateLock::acquire(tmp.path()).is_err());
        drop(first);
        StateLock::acquire(tmp.path()).unwrap();
    }

    #[test]
    fn retain_snapshots_drops_missing_ids() {
        let mut state = InstallState::default();
        state.record_snapshot(1, snapshot("install"));
        state.record_snapshot(2, snapshot("upgrade"));
        state.retain_snapshots(&[2]);
        assert_eq!(state.snapshots.len(), 1);
        assert!(state.snapshots.contains_key(&2));
    }
}
