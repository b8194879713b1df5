//! Action orchestrators.
//!
//! Each action shares one shape: validate, acquire resources, resolve the
//! source, stage the tree, run hooks, promote, update the bootloader,
//! release resources, apply the power policy. Failure policy lives here:
//! validation errors abort before any mutation, staging errors leave the
//! previously active slot untouched, and the state file is flushed before
//! the bootloader env is rewritten so a crash in between under-reports.

pub mod build_disk;
pub mod build_iso;
pub mod install;
pub mod reset;
pub mod upgrade;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::bootloader::Bootloader;
use crate::error::LifecycleError;
use crate::hooks::StageRunner;
use crate::mounts::{MountRequest, MountStack, Mounter};
use crate::process::Cmd;
use crate::source::{ImageSource, ResolveOpts};
use crate::spec::{PartitionRole, PowerAction};
use crate::state::InstallState;

/// Runtime mount root for device actions.
pub const RUN_DIR: &str = "/run/slotkit";
/// Marker created by the init layer when the recovery entry was booted.
pub const RECOVERY_MODE_FILE: &str = "/run/slotkit/recovery_mode";
/// Recovery root tree location on the recovery partition.
pub const RECOVERY_TREE_DIR: &str = "rootfs";
/// Recovery squashfs image name on the recovery partition.
pub const RECOVERY_IMAGE_FILE: &str = "recovery.squashfs";
/// Transition name used while a new recovery image is being written.
pub const RECOVERY_TRANSITION_FILE: &str = "recovery.transition.squashfs";

/// Injected collaborators, real for the CLI and fakes for tests and
/// unprivileged builds.
pub struct Collaborators<'a> {
    pub mounter: &'a dyn Mounter,
    pub bootloader: &'a dyn Bootloader,
    pub stage_runner: &'a dyn StageRunner,
    pub resolve: ResolveOpts,
}

/// Where each partition ends up mounted for the duration of an action.
#[derive(Debug, Clone)]
pub struct MountPoints {
    pub efi: PathBuf,
    pub state: PathBuf,
    pub recovery: PathBuf,
    pub oem: Option<PathBuf>,
    pub persistent: Option<PathBuf>,
}

impl MountPoints {
    /// Mount points for a device action, under `/run/slotkit/<role>`.
    pub fn for_device() -> Self {
        let run = Path::new(RUN_DIR);
        Self {
            efi: run.join("efi"),
            state: run.join("state"),
            recovery: run.join("recovery"),
            oem: Some(run.join("oem")),
            persistent: Some(run.join("persistent")),
        }
    }

    /// Mount points for a directory target: partitions are plain
    /// subdirectories named by role, no kernel mounts involved.
    pub fn for_directory(target: &Path) -> Self {
        Self {
            efi: target.join("efi"),
            state: target.join("state"),
            recovery: target.join("recovery"),
            oem: Some(target.join("oem")),
            persistent: Some(target.join("persistent")),
        }
    }

    pub fn for_role(&self, role: PartitionRole) -> Option<&Path> {
        match role {
            PartitionRole::Efi => Some(&self.efi),
            PartitionRole::State => Some(&self.state),
            PartitionRole::Recovery => Some(&self.recovery),
            PartitionRole::Oem => self.oem.as_deref(),
            PartitionRole::Persistent => self.persistent.as_deref(),
        }
    }

    /// Bind map for chroot hooks: oem and persistent appear inside the
    /// target root at their conventional paths.
    pub fn chroot_binds(&self) -> BTreeMap<PathBuf, PathBuf> {
        let mut binds = BTreeMap::new();
        if let Some(oem) = &self.oem {
            binds.insert(oem.clone(), PathBuf::from("/oem"));
        }
        if let Some(persistent) = &self.persistent {
            binds.insert(persistent.clone(), PathBuf::from("/usr/local"));
        }
        binds
    }
}

/// Mount every planned partition of a device target, state first so nested
/// snapshot paths resolve, oem/persistent after.
pub fn mount_device_partitions<'a>(
    mounter: &'a dyn Mounter,
    device: &Path,
    roles: &[(PartitionRole, u32)],
    points: &MountPoints,
) -> Result<MountStack<'a>, LifecycleError> {
    let mut stack = MountStack::new(mounter);
    let order = [
        PartitionRole::State,
        PartitionRole::Efi,
        PartitionRole::Recovery,
        PartitionRole::Oem,
        PartitionRole::Persistent,
    ];
    for role in order {
        let Some((_, index)) = roles.iter().find(|(r, _)| *r == role) else {
            continue;
        };
        let Some(point) = points.for_role(role) else {
            continue;
        };
        let part_dev = crate::layout::partition_device(device, *index);
        stack.push(&MountRequest::device(&part_dev, point))?;
    }
    Ok(stack)
}

/// Release acquired mounts after a successful action. Unmount failures are
/// surfaced to the operator but do not fail the completed work.
pub fn release_after_success(stack: MountStack<'_>) {
    if let Err(e) = stack.release() {
        log::warn!("{e}");
        eprintln!("warning: some mounts could not be released; manual cleanup needed:\n{e}");
    }
}

/// Whether the current boot came from the recovery entry.
pub fn booted_from_recovery() -> bool {
    Path::new(RECOVERY_MODE_FILE).exists()
}

pub fn before_hook(action: &str) -> String {
    format!("before-{action}")
}

pub fn after_chroot_hook(action: &str) -> String {
    format!("after-{action}-chroot")
}

pub fn after_hook(action: &str) -> String {
    format!("after-{action}")
}

pub fn post_hook(action: &str) -> String {
    format!("post-{action}")
}

/// Copy a tree preserving permissions, ownership and xattrs.
pub fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)
        .with_context(|| format!("creating '{}'", dest.display()))?;
    Cmd::new("rsync")
        .arg("-aHAX")
        .arg(&format!("{}/", source.display()))
        .arg(&format!("{}/", dest.display()))
        .error_msg("failed copying tree")
        .run()
}

/// Copy the user-supplied cloud-init config into the config partition.
pub fn copy_cloud_config(cloud_init: Option<&Path>, oem_mount: Option<&Path>) -> Result<()> {
    let (Some(source), Some(oem)) = (cloud_init, oem_mount) else {
        return Ok(());
    };
    let name = source
        .file_name()
        .context("cloud-init path has no file name")?;
    fs::create_dir_all(oem).with_context(|| format!("creating '{}'", oem.display()))?;
    fs::copy(source, oem.join(name))
        .with_context(|| format!("copying cloud-init config '{}'", source.display()))?;
    Ok(())
}

/// Record the oem/persistent partition labels into the state record.
pub fn record_fixed_partitions(state: &mut InstallState, points: &MountPoints) {
    if points.oem.is_some() {
        state.oem = Some(crate::state::PartitionRecord {
            label: crate::spec::OEM_LABEL.to_string(),
            digest: None,
        });
    }
    if points.persistent.is_some() {
        state.persistent = Some(crate::state::PartitionRecord {
            label: crate::spec::PERSISTENT_LABEL.to_string(),
            digest: None,
        });
    }
}

/// Source a reset consumes when none is given explicitly: the squashfs
/// image `deploy_recovery` wrote on hosts with squashfs tooling, otherwise
/// the plain tree form.
pub fn default_reset_source(recovery_mount: &Path) -> ImageSource {
    let image = recovery_mount.join(RECOVERY_IMAGE_FILE);
    if image.is_file() {
        ImageSource::File(image)
    } else {
        ImageSource::Dir(recovery_mount.join(RECOVERY_TREE_DIR))
    }
}

/// Remove all snapshot bookkeeping from a state partition: snapshot trees,
/// transition workdirs, slot links and the state file. The lock file is
/// left alone; it is held by the calling action.
pub fn wipe_state_tree(state_mount: &Path) -> Result<()> {
    for dir in [crate::snapshot::SNAPSHOTS_DIR, crate::snapshot::TRANSITION_DIR] {
        let path = state_mount.join(dir);
        if path.exists() {
            fs::remove_dir_all(&path)
                .with_context(|| format!("clearing '{}'", path.display()))?;
        }
    }
    for file in [
        crate::snapshot::ACTIVE_LINK,
        crate::snapshot::PASSIVE_LINK,
        crate::state::STATE_FILE,
    ] {
        let path = state_mount.join(file);
        if fs::symlink_metadata(&path).is_ok() {
            fs::remove_file(&path)
                .with_context(|| format!("removing '{}'", path.display()))?;
        }
    }
    Ok(())
}

/// Deploy the staged tree as the recovery image.
///
/// With squashfs tooling available the image is written to a transition
/// file and renamed over the old one, so the previous recovery image stays
/// intact until the new one is complete. Without it (unprivileged or
/// minimal hosts) the tree is copied as a plain directory.
pub fn deploy_recovery(tree: &Path, recovery_mount: &Path) -> Result<()> {
    fs::create_dir_all(recovery_mount)
        .with_context(|| format!("creating '{}'", recovery_mount.display()))?;

    if crate::preflight::command_exists("mksquashfs") {
        let transition = recovery_mount.join(RECOVERY_TRANSITION_FILE);
        if transition.exists() {
            fs::remove_file(&transition).context("removing stale transition image")?;
        }
        Cmd::new("mksquashfs")
            .arg_path(tree)
            .arg_path(&transition)
            .args(["-comp", "zstd", "-no-progress", "-quiet"])
            .error_msg("mksquashfs failed for recovery image")
            .run()?;
        let image = recovery_mount.join(RECOVERY_IMAGE_FILE);
        fs::rename(&transition, &image)
            .context("renaming transition recovery image into place")?;
    } else {
        let staged = recovery_mount.join(format!("{RECOVERY_TREE_DIR}.transition"));
        if staged.exists() {
            fs::remove_dir_all(&staged).context("removing stale transition tree")?;
        }
        copy_tree(tree, &staged)?;
        let dest = recovery_mount.join(RECOVERY_TREE_DIR);
        if dest.exists() {
            fs::remove_dir_all(&dest).context("removing previous recovery tree")?;
        }
        fs::rename(&staged, &dest).context("renaming recovery tree into place")?;
    }
    Ok(())
}

/// Apply the configured power policy after a completed action.
pub fn power_action(power: PowerAction) -> Result<()> {
    match power {
        PowerAction::None => Ok(()),
        PowerAction::Reboot => {
            println!("Rebooting in 5 seconds");
            Cmd::new("shutdown")
                .args(["-r", "+0"])
                .error_msg("failed to reboot")
                .run()
        }
        PowerAction::PowerOff => {
            println!("Shutting down in 5 seconds");
            Cmd::new("shutdown")
                .args(["-h", "+0"])
                .error_msg("failed to power off")
                .run()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_names_follow_action() {
        assert_eq!(before_hook("install"), "before-install");
        assert_eq!(after_chroot_hook("upgrade"), "after-upgrade-chroot");
        assert_eq!(after_hook("reset"), "after-reset");
        assert_eq!(post_hook("disk"), "post-disk");
    }

    #[test]
    fn directory_mount_points_sit_under_target() {
        let points = MountPoints::for_directory(Path::new("/tmp/t"));
        assert_eq!(points.state, PathBuf::from("/tmp/t/state"));
        assert_eq!(points.for_role(PartitionRole::Oem), Some(Path::new("/tmp/t/oem")));
    }

    #[test]
    fn chroot_binds_cover_oem_and_persistent() {
        let points = MountPoints::for_directory(Path::new("/t"));
        let binds = points.chroot_binds();
        assert_eq!(binds.get(Path::new("/t/oem")), Some(&PathBuf::from("/oem")));
        assert_eq!(
            binds.get(Path::new("/t/persistent")),
            Some(&PathBuf::from("/usr/local"))
        );
    }

    #[test]
    fn default_reset_source_prefers_the_deployed_squashfs() {
        let tmp = tempfile::tempdir().unwrap();
        let recovery = tmp.path();

        // Tree form only.
        fs::create_dir_all(recovery.join(RECOVERY_TREE_DIR)).unwrap();
        assert_eq!(
            default_reset_source(recovery),
            ImageSource::Dir(recovery.join(RECOVERY_TREE_DIR))
        );

        // Squashfs form wins once deployed.
        fs::write(recovery.join(RECOVERY_IMAGE_FILE), b"sqsh").unwrap();
        assert_eq!(
            default_reset_source(recovery),
            ImageSource::File(recovery.join(RECOVERY_IMAGE_FILE))
        );
    }

    #[test]
    fn cloud_config_copy_is_a_no_op_without_inputs() {
        copy_cloud_config(None, None).unwrap();
        copy_cloud_config(Some(Path::new("/x")), None).unwrap();
    }
}
