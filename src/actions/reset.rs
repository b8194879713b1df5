//! Factory reset from the recovery image.
//!
//! Reset rebuilds the state partition from scratch: every existing
//! snapshot is discarded and the source is deployed as a fresh snapshot 1.
//! Because it destroys the trees the running system would be executing
//! from, it refuses to run unless the current boot came from the recovery
//! entry, and that check happens before any mutation.

use std::fs;
use std::path::Path;

use anyhow::Context;

use crate::actions::{
    after_chroot_hook, after_hook, before_hook, copy_cloud_config, post_hook, power_action,
    record_fixed_partitions, wipe_state_tree, Collaborators, MountPoints,
};
use crate::error::LifecycleError;
use crate::hooks::{chroot_hook, hook};
use crate::interrupt;
use crate::snapshot::Snapshotter;
use crate::source;
use crate::spec::ResetSpec;
use crate::state::{self, InstallState, SnapshotState, StateLock};
use crate::verify;

const ACTION: &str = "reset";

/// Run a reset. `booted_from_recovery` is decided by the caller (the CLI
/// checks the runtime marker) so the guard is testable.
pub fn run(
    spec: &ResetSpec,
    collab: &Collaborators<'_>,
    booted_from_recovery: bool,
) -> Result<(), LifecycleError> {
    spec.sanitize()?;
    verify::precheck(&spec.verify)?;
    if !booted_from_recovery {
        return Err(LifecycleError::NotBootedFromRecovery);
    }

    let points = MountPoints {
        efi: spec.efi_mount.clone(),
        state: spec.state_mount.clone(),
        recovery: spec.recovery_mount.clone(),
        oem: spec.oem_mount.clone(),
        persistent: spec.persistent_mount.clone(),
    };

    println!("=== Resetting from {} ===\n", spec.source);

    let _lock = StateLock::acquire(&points.state).map_err(LifecycleError::StatePersistFailed)?;
    let previous = state::load(&points.state).map_err(LifecycleError::Other)?;

    hook(
        collab.stage_runner,
        &before_hook(ACTION),
        &points.state,
        &spec.cloud_init_paths,
        spec.strict_hooks,
    )?;

    interrupt::checkpoint("wipe-state")?;
    wipe_state_tree(&points.state)?;
    if spec.reset_oem {
        if let Some(oem) = &points.oem {
            clear_dir(oem)?;
        }
    }
    if spec.reset_persistent {
        if let Some(persistent) = &points.persistent {
            clear_dir(persistent)?;
        }
    }

    let snapshotter = Snapshotter::new(&points.state);
    let tx = snapshotter.start_transaction(1)?;

    let staged = (|| -> Result<String, LifecycleError> {
        let digest = source::resolve(&spec.source, &tx.work_dir, &collab.resolve)?;
        verify::check(&spec.verify, &digest)?;

        collab
            .bootloader
            .install(&tx.work_dir, &points.efi)
            .map_err(LifecycleError::BootloaderUpdateFailed)?;

        chroot_hook(
            collab.stage_runner,
            collab.mounter,
            &after_chroot_hook(ACTION),
            &tx.work_dir,
            &points.chroot_binds(),
            &spec.cloud_init_paths,
            spec.strict_hooks,
        )?;
        Ok(digest)
    })();

    let digest = match staged {
        Ok(digest) => digest,
        Err(e) => {
            if let Err(gc) = snapshotter.close_transaction_on_error(&tx) {
                log::warn!("failed cleaning aborted snapshot: {gc:#}");
            }
            return Err(e);
        }
    };

    copy_cloud_config(spec.cloud_init.as_deref(), points.oem.as_deref())?;

    interrupt::checkpoint("promote")?;
    let committed = snapshotter.close_transaction(&tx)?;

    hook(
        collab.stage_runner,
        &after_hook(ACTION),
        &committed,
        &spec.cloud_init_paths,
        spec.strict_hooks,
    )?;

    // Fresh record; only the recovery provenance survives the reset, the
    // recovery partition itself was never touched.
    let mut install_state = InstallState::default();
    install_state.recovery = previous.and_then(|p| p.recovery);
    install_state.touch_date();
    install_state.record_snapshot(
        tx.id,
        SnapshotState {
            from_action: ACTION.to_string(),
            source: spec.source.to_string(),
            digest: Some(digest),
            label: crate::spec::STATE_LABEL.to_string(),
            active: true,
        },
    );
    record_fixed_partitions(&mut install_state, &points);

    snapshotter.activate(tx.id)?;
    state::persist(&install_state, &[&points.state, &points.recovery])?;
    collab
        .bootloader
        .set_persistent_vars(&points.efi, &crate::bootloader::slot_vars(tx.id, None))
        .map_err(LifecycleError::BootloaderUpdateFailed)?;

    hook(
        collab.stage_runner,
        &post_hook(ACTION),
        &points.state,
        &spec.cloud_init_paths,
        spec.strict_hooks,
    )?;

    power_action(spec.power)?;
    println!("\n=== Reset completed ===");
    Ok(())
}

/// Empty a partition mount without removing the mount point itself.
fn clear_dir(dir: &Path) -> Result<(), LifecycleError> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir).with_context(|| format!("reading '{}'", dir.display()))? {
        let entry = entry.with_context(|| format!("reading '{}'", dir.display()))?;
        let path = entry.path();
        let meta = fs::symlink_metadata(&path)
            .with_context(|| format!("inspecting '{}'", path.display()))?;
        if meta.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        }
        .with_context(|| format!("removing '{}'", path.display()))?;
    }
    Ok(())
}
