//! Upgrade of a running system into a fresh snapshot.
//!
//! The previously active snapshot stays on disk as the passive fallback;
//! the bootloader keeps an entry for it, so a bad upgrade is one reboot
//! away from a working system.

use crate::actions::{
    after_chroot_hook, after_hook, before_hook, deploy_recovery, post_hook, power_action,
    Collaborators, MountPoints,
};
use crate::error::LifecycleError;
use crate::hooks::{chroot_hook, hook};
use crate::interrupt;
use crate::snapshot::Snapshotter;
use crate::source;
use crate::state::{self, InstallState, RecoveryState, SnapshotState, StateLock};
use crate::verify;

const ACTION: &str = "upgrade";

/// Run an upgrade. The state, recovery and efi partitions are expected to
/// be mounted already (the running OS keeps them mounted); no partitions
/// are created or formatted.
pub fn run(spec: &crate::spec::UpgradeSpec, collab: &Collaborators<'_>) -> Result<(), LifecycleError> {
    spec.sanitize()?;
    verify::precheck(&spec.verify)?;

    let points = MountPoints {
        efi: spec.efi_mount.clone(),
        state: spec.state_mount.clone(),
        recovery: spec.recovery_mount.clone(),
        oem: spec.oem_mount.clone(),
        persistent: spec.persistent_mount.clone(),
    };

    println!("=== Upgrading from {} ===\n", spec.source);

    let _lock = StateLock::acquire(&points.state).map_err(LifecycleError::StatePersistFailed)?;
    let mut install_state = state::load(&points.state)
        .map_err(LifecycleError::Other)?
        .unwrap_or_default();

    hook(
        collab.stage_runner,
        &before_hook(ACTION),
        &points.state,
        &spec.cloud_init_paths,
        spec.strict_hooks,
    )?;

    let snapshotter = Snapshotter::new(&points.state);
    let previous_active = snapshotter.active_id();
    let next_id = next_snapshot_id(&install_state, &snapshotter)?;

    interrupt::checkpoint("resolve-source")?;
    let tx = snapshotter.start_transaction(next_id)?;

    let staged = (|| -> Result<String, LifecycleError> {
        let digest = source::resolve(&spec.source, &tx.work_dir, &collab.resolve)?;
        verify::check(&spec.verify, &digest)?;

        if spec.bootloader_upgrade {
            collab
                .bootloader
                .install(&tx.work_dir, &points.efi)
                .map_err(LifecycleError::BootloaderUpdateFailed)?;
        }

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

    if spec.recovery_upgrade {
        println!("Refreshing recovery image...");
        deploy_recovery(&tx.work_dir, &points.recovery)?;
        install_state.recovery = Some(RecoveryState {
            from_action: ACTION.to_string(),
            source: spec.source.to_string(),
            digest: Some(digest.clone()),
            label: crate::spec::RECOVERY_LABEL.to_string(),
        });
    }

    interrupt::checkpoint("promote")?;
    let committed = snapshotter.close_transaction(&tx)?;

    hook(
        collab.stage_runner,
        &after_hook(ACTION),
        &committed,
        &spec.cloud_init_paths,
        spec.strict_hooks,
    )?;

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

    snapshotter.activate(tx.id)?;
    let kept = snapshotter.prune()?;
    install_state.retain_snapshots(&kept);

    state::persist(&install_state, &[&points.state, &points.recovery])?;
    collab
        .bootloader
        .set_persistent_vars(
            &points.efi,
            &crate::bootloader::slot_vars(tx.id, previous_active),
        )
        .map_err(LifecycleError::BootloaderUpdateFailed)?;

    hook(
        collab.stage_runner,
        &post_hook(ACTION),
        &points.state,
        &spec.cloud_init_paths,
        spec.strict_hooks,
    )?;

    power_action(spec.power)?;
    println!("\n=== Upgrade completed ===");
    Ok(())
}

/// Next snapshot id: one past the highest id known to either the state
/// record or the snapshot tree, so a record/tree mismatch never reuses an
/// id that still exists on disk.
fn next_snapshot_id(
    install_state: &InstallState,
    snapshotter: &Snapshotter,
) -> Result<u32, LifecycleError> {
    let on_disk = snapshotter.list()?.last().copied().unwrap_or(0);
    Ok(install_state.next_snapshot_id().max(on_disk + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::{Path, PathBuf};

    use crate::bootloader::{MemoryBootloader, GRUB_ENV_FILE};
    use crate::hooks::RecordingStageRunner;
    use crate::mounts::FakeMounter;
    use crate::source::{ImageSource, ResolveOpts};
    use crate::spec::{PowerAction, UpgradeSpec, VerifyConfig, VerifyPolicy};

    fn seed_installed_system(root: &Path) -> (PathBuf, PathBuf, PathBuf) {
        let state = root.join("state");
        let recovery = root.join("recovery");
        let efi = root.join("efi");
        for p in [&state, &recovery, &efi] {
            fs::create_dir_all(p).unwrap();
        }

        let snapshotter = Snapshotter::new(&state);
        let tx = snapshotter.start_transaction(1).unwrap();
        fs::create_dir_all(tx.work_dir.join("etc")).unwrap();
        fs::write(tx.work_dir.join("etc/os-release"), "ID=slotos\nVERSION=1\n").unwrap();
        snapshotter.close_transaction(&tx).unwrap();
        snapshotter.activate(1).unwrap();

        let mut st = InstallState::default();
        st.record_snapshot(
            1,
            SnapshotState {
                from_action: "install".into(),
                source: "dir:/seed".into(),
                digest: Some("sha256:seed".into()),
                label: crate::spec::STATE_LABEL.into(),
                active: true,
            },
        );
        state::persist(&st, &[&state, &recovery]).unwrap();
        (state, recovery, efi)
    }

    fn rootfs(dir: &Path, version: &str) -> PathBuf {
        let root = dir.join(format!("rootfs-{version}"));
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(
            root.join("etc/os-release"),
            format!("ID=slotos\nVERSION={version}\n"),
        )
        .unwrap();
        root
    }

    fn spec_for(
        mounts: &(PathBuf, PathBuf, PathBuf),
        source_root: &Path,
    ) -> UpgradeSpec {
        UpgradeSpec {
            state_mount: mounts.0.clone(),
            recovery_mount: mounts.1.clone(),
            efi_mount: mounts.2.clone(),
            oem_mount: None,
            persistent_mount: None,
            source: ImageSource::Dir(source_root.to_path_buf()),
            recovery_upgrade: false,
            bootloader_upgrade: false,
            verify: VerifyConfig::default(),
            cloud_init_paths: vec![],
            strict_hooks: false,
            power: PowerAction::None,
        }
    }

    fn collab<'a>(
        mounter: &'a FakeMounter,
        bootloader: &'a MemoryBootloader,
        runner: &'a RecordingStageRunner,
    ) -> Collaborators<'a> {
        Collaborators {
            mounter,
            bootloader,
            stage_runner: runner,
            resolve: ResolveOpts::default(),
        }
    }

    #[test]
    fn upgrade_keeps_previous_snapshot_as_fallback() {
        let tmp = tempfile::tempdir().unwrap();
        let mounts = seed_installed_system(tmp.path());
        let root = rootfs(tmp.path(), "2");

        let mounter = FakeMounter::new();
        let bootloader = MemoryBootloader::new();
        let runner = RecordingStageRunner::new();
        run(&spec_for(&mounts, &root), &collab(&mounter, &bootloader, &runner)).unwrap();

        let st = state::load(&mounts.0).unwrap().unwrap();
        let (id, snap) = st.active_snapshot().unwrap();
        assert_eq!(id, 2);
        assert_eq!(snap.from_action, "upgrade");
        assert!(!st.snapshots[&1].active);
        assert_eq!(st.snapshots.len(), 2);

        // Both trees exist; the new one carries the new content.
        assert!(mounts.0.join("snapshots/1/etc/os-release").exists());
        let new_release =
            fs::read_to_string(mounts.0.join("snapshots/2/etc/os-release")).unwrap();
        assert!(new_release.contains("VERSION=2"));

        // Bootloader switched with the old snapshot as fallback.
        let env = fs::read_to_string(mounts.2.join(GRUB_ENV_FILE)).unwrap();
        assert!(env.contains("active_snapshot=snapshots/2"));
        assert!(env.contains("passive_snapshot=snapshots/1"));

        assert_eq!(
            runner.ran(),
            vec!["before-upgrade", "after-upgrade-chroot", "after-upgrade", "post-upgrade"]
        );
    }

    #[test]
    fn upgrade_chroot_hook_binds_oem_and_persistent() {
        let tmp = tempfile::tempdir().unwrap();
        let mounts = seed_installed_system(tmp.path());
        let oem = tmp.path().join("oem");
        let persistent = tmp.path().join("persistent");
        fs::create_dir_all(&oem).unwrap();
        fs::create_dir_all(&persistent).unwrap();
        let root = rootfs(tmp.path(), "2");

        let mounter = FakeMounter::new();
        let bootloader = MemoryBootloader::new();
        let runner = RecordingStageRunner::new();
        let mut spec = spec_for(&mounts, &root);
        spec.oem_mount = Some(oem);
        spec.persistent_mount = Some(persistent);
        run(&spec, &collab(&mounter, &bootloader, &runner)).unwrap();

        // Both partitions were bound into the staged tree for the chroot
        // hook and released again.
        let calls = mounter.calls();
        let binds: Vec<_> = calls.iter().filter(|c| c.starts_with("mount ")).collect();
        let releases: Vec<_> = calls.iter().filter(|c| c.starts_with("umount ")).collect();
        assert_eq!(binds.len(), 2);
        assert_eq!(releases.len(), 2);
        assert!(binds.iter().any(|c| c.ends_with("/oem")));
        assert!(binds.iter().any(|c| c.ends_with("/usr/local")));
    }

    #[test]
    fn repeated_upgrades_prune_to_active_plus_passive() {
        let tmp = tempfile::tempdir().unwrap();
        let mounts = seed_installed_system(tmp.path());

        let mounter = FakeMounter::new();
        let bootloader = MemoryBootloader::new();
        let runner = RecordingStageRunner::new();
        for version in ["2", "3", "4"] {
            let root = rootfs(tmp.path(), version);
            run(&spec_for(&mounts, &root), &collab(&mounter, &bootloader, &runner)).unwrap();
        }

        let st = state::load(&mounts.0).unwrap().unwrap();
        let ids: Vec<u32> = st.snapshots.keys().copied().collect();
        assert_eq!(ids, vec![3, 4]);
        assert_eq!(st.active_snapshot().unwrap().0, 4);
        assert!(!mounts.0.join("snapshots/1").exists());
        assert!(!mounts.0.join("snapshots/2").exists());
        assert!(mounts.0.join("snapshots/3").exists());
    }

    #[test]
    fn failed_staging_leaves_previous_state_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let mounts = seed_installed_system(tmp.path());
        let before = state::load(&mounts.0).unwrap().unwrap();

        let mounter = FakeMounter::new();
        let bootloader = MemoryBootloader::new();
        let runner = RecordingStageRunner::new();
        let mut spec = spec_for(&mounts, &tmp.path().join("missing"));
        spec.source = ImageSource::Dir(tmp.path().join("missing"));

        let err = run(&spec, &collab(&mounter, &bootloader, &runner)).unwrap_err();
        assert_eq!(err.exit_code(), 20);

        // On-disk record and snapshot 1 are untouched; no transition left.
        assert_eq!(state::load(&mounts.0).unwrap().unwrap(), before);
        assert!(mounts.0.join("snapshots/1").exists());
        assert!(!mounts.0.join(".transition/2").exists());
        assert!(!mounts.2.join(GRUB_ENV_FILE).exists());
    }

    #[test]
    fn strict_verify_mismatch_aborts_before_promotion() {
        let tmp = tempfile::tempdir().unwrap();
        let mounts = seed_installed_system(tmp.path());
        let root = rootfs(tmp.path(), "2");

        let mounter = FakeMounter::new();
        let bootloader = MemoryBootloader::new();
        let runner = RecordingStageRunner::new();
        let mut spec = spec_for(&mounts, &root);
        spec.verify = VerifyConfig {
            policy: VerifyPolicy::Strict,
            expected_digest: Some("sha256:not-this".into()),
        };

        let err = run(&spec, &collab(&mounter, &bootloader, &runner)).unwrap_err();
        assert_eq!(err.exit_code(), 31);
        assert!(!mounts.0.join("snapshots/2").exists());
        assert_eq!(state::load(&mounts.0).unwrap().unwrap().active_snapshot().unwrap().0, 1);
    }

    #[test]
    fn bootloader_env_failure_after_state_flush_reports_71() {
        let tmp = tempfile::tempdir().unwrap();
        let mounts = seed_installed_system(tmp.path());
        let root = rootfs(tmp.path(), "2");

        let mounter = FakeMounter::new();
        let mut bootloader = MemoryBootloader::new();
        bootloader.fail_vars = true;
        let runner = RecordingStageRunner::new();

        let err = run(&spec_for(&mounts, &root), &collab(&mounter, &bootloader, &runner))
            .unwrap_err();
        assert_eq!(err.exit_code(), 71);

        // The state file was flushed first: it already names snapshot 2,
        // which exists and is bootable even though the env switch failed.
        let st = state::load(&mounts.0).unwrap().unwrap();
        assert_eq!(st.active_snapshot().unwrap().0, 2);
        assert!(mounts.0.join("snapshots/2").exists());
    }

    #[test]
    fn recovery_upgrade_refreshes_recovery_record() {
        let tmp = tempfile::tempdir().unwrap();
        let mounts = seed_installed_system(tmp.path());
        let root = rootfs(tmp.path(), "2");

        let mounter = FakeMounter::new();
        let bootloader = MemoryBootloader::new();
        let runner = RecordingStageRunner::new();
        let mut spec = spec_for(&mounts, &root);
        spec.recovery_upgrade = true;

        run(&spec, &collab(&mounter, &bootloader, &runner)).unwrap();

        let st = state::load(&mounts.0).unwrap().unwrap();
        let recovery = st.recovery.unwrap();
        assert_eq!(recovery.from_action, "upgrade");
        assert!(
            mounts.1.join("rootfs").exists() || mounts.1.join("recovery.squashfs").exists()
        );
    }
}
