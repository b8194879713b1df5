//! A/B snapshot bookkeeping on the state partition.
//!
//! On-disk layout under the state mount:
//!
//! ```text
//! <state>/snapshots/<id>/   committed, immutable root trees
//! <state>/.transition/<id>/ building workdirs, invisible to the bootloader
//! <state>/active            symlink to the active snapshot
//! <state>/passive           symlink to the fallback snapshot
//! ```
//!
//! A snapshot moves `Building -> Committed -> Active`. Building failures
//! need no rollback beyond deleting the workdir; nothing references it yet.
//! Committed is the last safe point before the bootloader switch. Promotion
//! of a staged tree is a rename, never a copy.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

pub const SNAPSHOTS_DIR: &str = "snapshots";
pub const TRANSITION_DIR: &str = ".transition";
pub const ACTIVE_LINK: &str = "active";
pub const PASSIVE_LINK: &str = "passive";

/// Active + passive. Older snapshots are pruned after a switch.
pub const DEFAULT_MAX_SNAPSHOTS: usize = 2;

/// An in-flight snapshot: its tree exists but no bootloader entry or state
/// record points at it.
#[derive(Debug)]
pub struct Transaction {
    pub id: u32,
    pub work_dir: PathBuf,
}

pub struct Snapshotter {
    state_mount: PathBuf,
    max_snapshots: usize,
}

impl Snapshotter {
    pub fn new(state_mount: &Path) -> Self {
        Self {
            state_mount: state_mount.to_path_buf(),
            max_snapshots: DEFAULT_MAX_SNAPSHOTS,
        }
    }

    pub fn with_max_snapshots(mut self, max: usize) -> Self {
        self.max_snapshots = max.max(1);
        self
    }

    pub fn snapshot_path(&self, id: u32) -> PathBuf {
        self.state_mount.join(SNAPSHOTS_DIR).join(id.to_string())
    }

    /// Committed snapshot ids, ascending.
    pub fn list(&self) -> Result<Vec<u32>> {
        let dir = self.state_mount.join(SNAPSHOTS_DIR);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("reading '{}'", dir.display()))? {
            let entry = entry?;
            if let Ok(id) = entry.file_name().to_string_lossy().parse::<u32>() {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Begin building a new snapshot. The workdir lives under
    /// `.transition/` so a crash leaves nothing the bootloader can see.
    pub fn start_transaction(&self, id: u32) -> Result<Transaction> {
        let work_dir = self.state_mount.join(TRANSITION_DIR).join(id.to_string());
        if work_dir.exists() {
            // Leftover from an interrupted run; its content is unknown.
            fs::remove_dir_all(&work_dir)
                .with_context(|| format!("clearing stale workdir '{}'", work_dir.display()))?;
        }
        fs::create_dir_all(&work_dir)
            .with_context(|| format!("creating workdir '{}'", work_dir.display()))?;
        Ok(Transaction { id, work_dir })
    }

    /// Commit: rename the workdir into `snapshots/<id>`. Near-atomic at the
    /// filesystem level; the tree is finalized from here on.
    pub fn close_transaction(&self, tx: &Transaction) -> Result<PathBuf> {
        let dest = self.snapshot_path(tx.id);
        if dest.exists() {
            bail!("snapshot {} already exists at '{}'", tx.id, dest.display());
        }
        fs::create_dir_all(self.state_mount.join(SNAPSHOTS_DIR))
            .context("creating snapshots dir")?;
        fs::rename(&tx.work_dir, &dest).with_context(|| {
            format!(
                "promoting '{}' to '{}'",
                tx.work_dir.display(),
                dest.display()
            )
        })?;
        Ok(dest)
    }

    /// Abort: garbage-collect the partial tree.
    pub fn close_transaction_on_error(&self, tx: &Transaction) -> Result<()> {
        if tx.work_dir.exists() {
            fs::remove_dir_all(&tx.work_dir).with_context(|| {
                format!("removing aborted workdir '{}'", tx.work_dir.display())
            })?;
        }
        Ok(())
    }

    /// Point `active` at `id`, demoting the previous active snapshot to
    /// `passive`. The caller flushes the state file and bootloader env
    /// around this; the symlink flip itself is the slot switch.
    pub fn activate(&self, id: u32) -> Result<()> {
        let active = self.state_mount.join(ACTIVE_LINK);
        let passive = self.state_mount.join(PASSIVE_LINK);
        let target = Path::new(SNAPSHOTS_DIR).join(id.to_string());

        if let Ok(previous) = fs::read_link(&active) {
            replace_link(&passive, &previous)?;
        }
        replace_link(&active, &target)
    }

    /// Id the `active` link currently points at, if any.
    pub fn active_id(&self) -> Option<u32> {
        let link = fs::read_link(self.state_mount.join(ACTIVE_LINK)).ok()?;
        link.file_name()?.to_string_lossy().parse().ok()
    }

    /// Remove the oldest non-active, non-passive snapshots beyond the
    /// retention limit. Returns the ids still present.
    pub fn prune(&self) -> Result<Vec<u32>> {
        let ids = self.list()?;
        if ids.len() <= self.max_snapshots {
            return Ok(ids);
        }
        let active = self.active_id();
        let passive = fs::read_link(self.state_mount.join(PASSIVE_LINK))
            .ok()
            .and_then(|l| l.file_name()?.to_string_lossy().parse::<u32>().ok());

        let mut kept = Vec::new();
        let mut removable: Vec<u32> = ids
            .iter()
            .copied()
            .filter(|id| Some(*id) != active && Some(*id) != passive)
            .collect();
        removable.sort_unstable();

        let excess = ids.len() - self.max_snapshots;
        for id in removable.into_iter().take(excess) {
            fs::remove_dir_all(self.snapshot_path(id))
                .with_context(|| format!("pruning snapshot {id}"))?;
        }
        for id in self.list()? {
            kept.push(id);
        }
        Ok(kept)
    }
}

fn replace_link(link: &Path, target: &Path) -> Result<()> {
    // Build the new link next to the old one, then rename over it so a
    // crash never leaves the link missing.
    let staged = link.with_extension("new");
    if staged.exists() || fs::symlink_metadata(&staged).is_ok() {
        fs::remove_file(&staged).ok();
    }
    symlink(target, &staged)
        .with_context(|| format!("creating symlink '{}'", staged.display()))?;
    fs::rename(&staged, link)
        .with_context(|| format!("replacing link '{}'", link.display()))?;
    Ok(())
}
