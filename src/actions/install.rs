//! Fresh installation onto an empty (or forced) target.

use std::fs;
use std::path::{Path, PathBuf};

use crate::actions::{
    after_chroot_hook, after_hook, before_hook, copy_cloud_config, deploy_recovery,
    mount_device_partitions, post_hook, power_action, record_fixed_partitions,
    release_after_success, wipe_state_tree, Collaborators, MountPoints,
};
use crate::error::LifecycleError;
use crate::hooks::{chroot_hook, hook};
use crate::interrupt;
use crate::layout;
use crate::mounts::{MountRequest, MountStack};
use crate::snapshot::Snapshotter;
use crate::source;
use crate::spec::{InstallSpec, PartitionRole};
use crate::state::{self, InstallState, RecoveryState, SnapshotState, StateLock};
use crate::verify;

const ACTION: &str = "install";

const ROLES: [PartitionRole; 5] = [
    PartitionRole::State,
    PartitionRole::Efi,
    PartitionRole::Recovery,
    PartitionRole::Oem,
    PartitionRole::Persistent,
];

/// Run a full install. The target may be a block device (privileged) or a
/// directory (unprivileged/container builds, tests).
pub fn run(spec: &InstallSpec, collab: &Collaborators<'_>) -> Result<(), LifecycleError> {
    // Phase 1: validation, before any mutating operation.
    spec.sanitize()?;
    verify::precheck(&spec.verify)?;

    let dir_mode = spec.target.is_dir();
    let existing = if dir_mode {
        Vec::new()
    } else {
        // An unprobeable target could hide an existing install, which
        // would silently bypass the already-installed guard. Only a forced
        // install may proceed past it.
        match layout::probe_existing(&spec.target) {
            Ok(parts) => parts,
            Err(e) if spec.force => {
                log::warn!(
                    "cannot probe partitions on '{}', proceeding under force: {e:#}",
                    spec.target.display()
                );
                Vec::new()
            }
            Err(e) => {
                return Err(LifecycleError::Other(e.context(format!(
                    "probing existing partitions on '{}'",
                    spec.target.display()
                ))));
            }
        }
    };

    if is_installed(&spec.target, &existing, dir_mode) && !spec.force {
        return Err(LifecycleError::AlreadyInstalled);
    }

    let plan = layout::plan(&spec.partitions, &existing, spec.no_format)?;

    println!("=== Installing {} to {} ===\n", spec.source, spec.target.display());

    // Phase 2: partitioning and mounts.
    if !dir_mode && !spec.no_format {
        println!("Partitioning target...");
        layout::apply(&spec.target, &plan)?;
    }

    let points = if dir_mode {
        MountPoints::for_directory(&spec.target)
    } else {
        MountPoints::for_device()
    };

    let mut stack;
    if dir_mode {
        // The directory-target equivalent of formatting: role directories
        // start empty.
        if !spec.no_format {
            clear_role_dirs(&points)?;
        }
        stack = MountStack::new(collab.mounter);
        for role in ROLES {
            if !spec.partitions.iter().any(|p| p.role == role) {
                continue;
            }
            if let Some(point) = points.for_role(role) {
                stack.push(&MountRequest::device(point, point))?;
            }
        }
    } else if spec.no_format {
        stack = mount_by_label(collab, spec, &points)?;
    } else {
        let roles = planned_roles(&plan);
        stack = mount_device_partitions(collab.mounter, &spec.target, &roles, &points)?;
    }

    match stage_and_promote(spec, collab, &points) {
        Ok(()) => {
            release_after_success(stack);
            power_action(spec.power)?;
            println!("\n=== Install completed ===");
            Ok(())
        }
        Err(e) => {
            // Staging errors leave the target unbootable only insofar as it
            // already was; everything mounted still gets released.
            drop(stack);
            Err(e)
        }
    }
}

fn stage_and_promote(
    spec: &InstallSpec,
    collab: &Collaborators<'_>,
    points: &MountPoints,
) -> Result<(), LifecycleError> {
    let _lock = StateLock::acquire(&points.state).map_err(LifecycleError::StatePersistFailed)?;

    hook(
        collab.stage_runner,
        &before_hook(ACTION),
        &points.state,
        &spec.cloud_init_paths,
        spec.strict_hooks,
    )?;

    // Phase 3: stage the source into a building snapshot. A forced
    // reinstall over a preserved state partition (`--no-format`) still
    // starts at snapshot 1, so any previous install's bookkeeping goes
    // first.
    interrupt::checkpoint("wipe-state")?;
    wipe_state_tree(&points.state)?;

    interrupt::checkpoint("resolve-source")?;
    let snapshotter = Snapshotter::new(&points.state);
    let tx = snapshotter.start_transaction(1)?;

    let staged = (|| -> Result<String, LifecycleError> {
        let digest = source::resolve(&spec.source, &tx.work_dir, &collab.resolve)?;
        verify::check(&spec.verify, &digest)?;

        interrupt::checkpoint("refine-tree")?;
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
            // Building failures are invisible to the bootloader; GC the
            // partial tree and leave everything else untouched.
            if let Err(gc) = snapshotter.close_transaction_on_error(&tx) {
                log::warn!("failed cleaning aborted snapshot: {gc:#}");
            }
            return Err(e);
        }
    };

    // Recovery image and cloud config are written before the slot switch.
    println!("Deploying recovery image...");
    deploy_recovery(&tx.work_dir, &points.recovery)?;
    copy_cloud_config(spec.cloud_init.as_deref(), points.oem.as_deref())?;

    // Phase 4: commit and promote.
    interrupt::checkpoint("promote")?;
    let committed = snapshotter.close_transaction(&tx)?;

    hook(
        collab.stage_runner,
        &after_hook(ACTION),
        &committed,
        &spec.cloud_init_paths,
        spec.strict_hooks,
    )?;

    let mut install_state = InstallState::default();
    install_state.touch_date();
    install_state.record_snapshot(
        tx.id,
        SnapshotState {
            from_action: ACTION.to_string(),
            source: spec.source.to_string(),
            digest: Some(digest.clone()),
            label: crate::spec::STATE_LABEL.to_string(),
            active: true,
        },
    );
    install_state.recovery = Some(RecoveryState {
        from_action: ACTION.to_string(),
        source: spec.source.to_string(),
        digest: Some(digest),
        label: crate::spec::RECOVERY_LABEL.to_string(),
    });
    record_fixed_partitions(&mut install_state, points);

    snapshotter.activate(tx.id)?;

    // State file first, bootloader env second: a crash between the two
    // leaves the bootloader on the old (still bootable) view.
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

    Ok(())
}

fn is_installed(target: &Path, existing: &[layout::Partition], dir_mode: bool) -> bool {
    if dir_mode {
        return target.join("state").join(state::STATE_FILE).exists();
    }
    existing
        .iter()
        .any(|p| p.label == crate::spec::STATE_LABEL)
}

fn planned_roles(plan: &[layout::PlannedOp]) -> Vec<(PartitionRole, u32)> {
    plan.iter()
        .filter_map(|op| match op {
            layout::PlannedOp::CreatePartition { index, role, .. } => Some((*role, *index)),
            _ => None,
        })
        .collect()
}

fn clear_role_dirs(points: &MountPoints) -> Result<(), LifecycleError> {
    use anyhow::Context;
    for role in ROLES {
        if let Some(point) = points.for_role(role) {
            if point.exists() {
                fs::remove_dir_all(point)
                    .with_context(|| format!("clearing '{}'", point.display()))?;
            }
        }
    }
    Ok(())
}

fn mount_by_label<'a>(
    collab: &Collaborators<'a>,
    spec: &InstallSpec,
    points: &MountPoints,
) -> Result<MountStack<'a>, LifecycleError> {
    let mut stack = MountStack::new(collab.mounter);
    for role in ROLES {
        let Some(req) = spec.partitions.iter().find(|p| p.role == role) else {
            continue;
        };
        if let Some(point) = points.for_role(role) {
            let device = PathBuf::from(format!("/dev/disk/by-label/{}", req.label));
            stack.push(&MountRequest::device(&device, point))?;
        }
    }
    Ok(stack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootloader::MemoryBootloader;
    use crate::hooks::RecordingStageRunner;
    use crate::mounts::FakeMounter;
    use crate::source::{ImageSource, ResolveOpts};
    use crate::spec::{default_layout, Firmware, PowerAction, VerifyConfig, VerifyPolicy};

    fn rootfs(dir: &Path) -> PathBuf {
        let root = dir.join("rootfs");
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("etc/os-release"), "ID=slotos\n").unwrap();
        root
    }

    fn spec_for(target: &Path, source_root: &Path) -> InstallSpec {
        InstallSpec {
            target: target.to_path_buf(),
            source: ImageSource::Dir(source_root.to_path_buf()),
            partitions: default_layout(),
            firmware: Firmware::Efi,
            no_format: false,
            force: false,
            verify: VerifyConfig::default(),
            cloud_init: None,
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
    fn fresh_install_into_directory_target() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("disk");
        fs::create_dir_all(&target).unwrap();
        let root = rootfs(tmp.path());

        let mounter = FakeMounter::new();
        let bootloader = MemoryBootloader::new();
        let runner = RecordingStageRunner::new();
        run(&spec_for(&target, &root), &collab(&mounter, &bootloader, &runner)).unwrap();

        // Snapshot 1 is committed, active, and provenance-tagged.
        let st = state::load(&target.join("state")).unwrap().unwrap();
        assert_eq!(st.snapshots.len(), 1);
        let (id, snap) = st.active_snapshot().unwrap();
        assert_eq!(id, 1);
        assert_eq!(snap.from_action, "install");
        assert!(snap.digest.as_deref().unwrap().starts_with("sha256:"));
        assert_eq!(st.recovery.as_ref().unwrap().from_action, "install");

        // The staged tree was promoted by rename, not copy.
        assert!(target.join("state/snapshots/1/etc/os-release").exists());
        assert!(!target.join("state/.transition/1").exists());

        // Recovery fallback exists in one of its two forms.
        let recovery_tree = target.join("recovery/rootfs");
        let recovery_img = target.join("recovery/recovery.squashfs");
        assert!(recovery_tree.exists() || recovery_img.exists());

        // State copy also lands on the recovery partition.
        assert!(state::load(&target.join("recovery")).unwrap().is_some());

        // Hooks ran in order.
        assert_eq!(
            runner.ran(),
            vec!["before-install", "after-install-chroot", "after-install", "post-install"]
        );

        // Bootloader env was written after the state flush.
        let vars = bootloader.vars.lock().unwrap();
        assert!(vars.contains(&("active_snapshot".into(), "snapshots/1".into())));
    }

    #[test]
    fn second_install_requires_force() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("disk");
        fs::create_dir_all(&target).unwrap();
        let root = rootfs(tmp.path());

        let mounter = FakeMounter::new();
        let bootloader = MemoryBootloader::new();
        let runner = RecordingStageRunner::new();
        let spec = spec_for(&target, &root);
        run(&spec, &collab(&mounter, &bootloader, &runner)).unwrap();

        let err = run(&spec, &collab(&mounter, &bootloader, &runner)).unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyInstalled));
        assert_eq!(err.exit_code(), 40);

        let mut forced = spec.clone();
        forced.force = true;
        run(&forced, &collab(&mounter, &bootloader, &runner)).unwrap();
    }

    #[test]
    fn forced_reinstall_without_reformat_starts_again_at_snapshot_one() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("disk");
        fs::create_dir_all(&target).unwrap();
        let root = rootfs(tmp.path());

        let mounter = FakeMounter::new();
        let bootloader = MemoryBootloader::new();
        let runner = RecordingStageRunner::new();
        let spec = spec_for(&target, &root);
        run(&spec, &collab(&mounter, &bootloader, &runner)).unwrap();

        // Data written to the persistent partition since the first install.
        fs::write(target.join("persistent/keep.txt"), "user data\n").unwrap();

        // Reinstall over the existing layout without reformatting: the old
        // snapshot tree must not block the new snapshot 1.
        let mut again = spec.clone();
        again.force = true;
        again.no_format = true;
        run(&again, &collab(&mounter, &bootloader, &runner)).unwrap();

        let st = state::load(&target.join("state")).unwrap().unwrap();
        assert_eq!(st.snapshots.len(), 1);
        assert_eq!(st.active_snapshot().unwrap().0, 1);
        assert!(target.join("state/snapshots/1/etc/os-release").exists());

        // Unformatted partitions keep their contents.
        assert!(target.join("persistent/keep.txt").exists());
    }

    #[test]
    fn strict_verify_without_digest_aborts_before_any_mount() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("disk");
        fs::create_dir_all(&target).unwrap();
        let root = rootfs(tmp.path());

        let mounter = FakeMounter::new();
        let bootloader = MemoryBootloader::new();
        let runner = RecordingStageRunner::new();
        let mut spec = spec_for(&target, &root);
        spec.verify = VerifyConfig {
            policy: VerifyPolicy::Strict,
            expected_digest: None,
        };

        let err = run(&spec, &collab(&mounter, &bootloader, &runner)).unwrap_err();
        assert_eq!(err.exit_code(), 30);
        assert!(mounter.calls().is_empty());
        assert!(runner.ran().is_empty());
        assert!(!target.join("state").join(state::STATE_FILE).exists());
    }

    #[test]
    fn failing_stage_hook_releases_every_mount_in_reverse_order() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("disk");
        fs::create_dir_all(&target).unwrap();
        let root = rootfs(tmp.path());

        let mounter = FakeMounter::new();
        let bootloader = MemoryBootloader::new();
        let runner = RecordingStageRunner::failing(&["after-install-chroot"]);
        let mut spec = spec_for(&target, &root);
        spec.strict_hooks = true;

        let err = run(&spec, &collab(&mounter, &bootloader, &runner)).unwrap_err();
        assert_eq!(err.exit_code(), 60);

        // Partition mounts: 5 acquired (state, efi, recovery, oem,
        // persistent) + 2 chroot binds, each released exactly once, partition
        // mounts in reverse acquisition order.
        let calls = mounter.calls();
        let mounts: Vec<_> = calls.iter().filter(|c| c.starts_with("mount ")).collect();
        let umounts: Vec<_> = calls.iter().filter(|c| c.starts_with("umount ")).collect();
        assert_eq!(mounts.len(), 7);
        assert_eq!(umounts.len(), 7);
        let partition_mounts: Vec<String> = mounts[..5]
            .iter()
            .map(|c| c.replace("mount ", ""))
            .collect();
        let partition_umounts: Vec<String> = umounts[2..]
            .iter()
            .map(|c| c.replace("umount ", ""))
            .collect();
        let reversed: Vec<String> = partition_mounts.into_iter().rev().collect();
        assert_eq!(partition_umounts, reversed);

        // The partial snapshot was garbage-collected and no state written.
        assert!(!target.join("state/.transition/1").exists());
        assert!(!target.join("state/snapshots/1").exists());
        assert!(!target.join("state").join(state::STATE_FILE).exists());
    }

    #[test]
    fn unprobeable_block_target_is_fatal_without_force() {
        let tmp = tempfile::tempdir().unwrap();
        // A regular file is not a directory target and cannot be probed by
        // lsblk; the already-installed guard cannot run, so neither may the
        // install.
        let target = tmp.path().join("not-a-device");
        fs::write(&target, "").unwrap();
        let root = rootfs(tmp.path());

        let mounter = FakeMounter::new();
        let bootloader = MemoryBootloader::new();
        let runner = RecordingStageRunner::new();
        let err = run(&spec_for(&target, &root), &collab(&mounter, &bootloader, &runner))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Other(_)));
        assert!(mounter.calls().is_empty());
        assert!(runner.ran().is_empty());
    }

    #[test]
    fn missing_source_leaves_no_state() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("disk");
        fs::create_dir_all(&target).unwrap();

        let mounter = FakeMounter::new();
        let bootloader = MemoryBootloader::new();
        let runner = RecordingStageRunner::new();
        let mut spec = spec_for(&target, &tmp.path().join("rootfs"));
        spec.source = ImageSource::Dir(tmp.path().join("nope"));

        let err = run(&spec, &collab(&mounter, &bootloader, &runner)).unwrap_err();
        assert_eq!(err.exit_code(), 20);
        assert!(!target.join("state").join(state::STATE_FILE).exists());
    }
}
