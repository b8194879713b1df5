//! Unprivileged bootable disk image builds.
//!
//! No loop devices, no root: each partition is built as a standalone
//! filesystem image (`mkfs.ext4 -d` populates ext4 from a directory,
//! mtools populates vfat), then a sparse disk file gets a GPT from an
//! sfdisk script and the partition images are spliced in with `dd
//! conv=notrunc` at their computed offsets.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};

use crate::actions::{after_hook, before_hook, deploy_recovery, Collaborators};
use crate::error::LifecycleError;
use crate::hooks::hook;
use crate::interrupt;
use crate::preflight;
use crate::process::Cmd;
use crate::snapshot::Snapshotter;
use crate::source;
use crate::spec::{DiskSpec, FsKind, PartSize, PartitionRole};
use crate::state::{self, InstallState, RecoveryState, SnapshotState};
use crate::verify;

const ACTION: &str = "build-disk";

const SECTOR_SIZE: u64 = 512;
/// First partition starts at 1 MiB for GPT headers plus alignment.
const FIRST_PARTITION_OFFSET_MIB: u64 = 1;
/// Slack at the end of the disk for the GPT backup table.
const GPT_BACKUP_SLACK_MIB: u64 = 1;

/// One partition's place in the assembled image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionImage {
    pub role: PartitionRole,
    pub label: String,
    pub fs: FsKind,
    pub start_mib: u64,
    pub size_mib: u64,
}

/// Build a bootable raw disk image from an image source.
pub fn run(spec: &DiskSpec, collab: &Collaborators<'_>) -> Result<(), LifecycleError> {
    spec.sanitize()?;
    verify::precheck(&spec.verify)?;
    preflight::check_required_tools(preflight::BUILD_DISK_TOOLS)?;

    let geometry = plan_geometry(&spec.partitions, spec.disk_size_mib)?;

    println!(
        "=== Building {} MiB disk image from {} ===\n",
        spec.disk_size_mib, spec.source
    );

    fs::create_dir_all(&spec.work_dir)
        .with_context(|| format!("creating '{}'", spec.work_dir.display()))?;

    hook(
        collab.stage_runner,
        &before_hook(ACTION),
        &spec.work_dir,
        &spec.cloud_init_paths,
        spec.strict_hooks,
    )?;

    // Stage the source through the same snapshot layout an installed
    // system carries, so the state partition image is bit-for-bit what a
    // fresh install would have produced.
    interrupt::checkpoint("resolve-source")?;
    let state_tree = spec.work_dir.join("state-tree");
    if state_tree.exists() {
        fs::remove_dir_all(&state_tree).context("clearing previous state tree")?;
    }
    fs::create_dir_all(&state_tree).context("creating state tree")?;

    let snapshotter = Snapshotter::new(&state_tree);
    let tx = snapshotter.start_transaction(1)?;
    let digest = source::resolve(&spec.source, &tx.work_dir, &collab.resolve)?;
    verify::check(&spec.verify, &digest)?;
    let root_tree = snapshotter.close_transaction(&tx)?;
    snapshotter.activate(1)?;

    hook(
        collab.stage_runner,
        &after_hook(ACTION),
        &root_tree,
        &spec.cloud_init_paths,
        spec.strict_hooks,
    )?;

    let recovery_tree = spec.work_dir.join("recovery-tree");
    if recovery_tree.exists() {
        fs::remove_dir_all(&recovery_tree).context("clearing previous recovery tree")?;
    }
    println!("Building recovery payload...");
    deploy_recovery(&root_tree, &recovery_tree)?;

    let mut install_state = InstallState::default();
    install_state.touch_date();
    install_state.record_snapshot(
        1,
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
    state::persist(&install_state, &[&state_tree, &recovery_tree])?;

    // EFI payload is assembled as a plain tree, then mtools moves it into
    // the vfat image without mounting anything.
    let efi_tree = spec.work_dir.join("efi-tree");
    if efi_tree.exists() {
        fs::remove_dir_all(&efi_tree).context("clearing previous efi tree")?;
    }
    fs::create_dir_all(&efi_tree).context("creating efi tree")?;
    collab
        .bootloader
        .install(&root_tree, &efi_tree)
        .map_err(LifecycleError::BootloaderUpdateFailed)?;
    collab
        .bootloader
        .set_persistent_vars(&efi_tree, &crate::bootloader::slot_vars(1, None))
        .map_err(LifecycleError::BootloaderUpdateFailed)?;

    interrupt::checkpoint("assemble")?;
    println!("Creating partition images...");
    let empty = spec.work_dir.join("empty-tree");
    fs::create_dir_all(&empty).context("creating empty tree")?;

    let mut images = Vec::new();
    for part in &geometry {
        let tree = match part.role {
            PartitionRole::Efi => &efi_tree,
            PartitionRole::State => &state_tree,
            PartitionRole::Recovery => &recovery_tree,
            PartitionRole::Oem | PartitionRole::Persistent => &empty,
        };
        let image = spec.work_dir.join(format!("part-{}.img", part.label));
        create_partition_image(&image, part, tree)?;
        images.push(image);
    }

    println!("Assembling disk image...");
    assemble_disk(&spec.output, spec.disk_size_mib, &geometry, &images)?;

    println!("\n=== Disk image written to {} ===", spec.output.display());
    Ok(())
}

/// Lay the requested partitions out in planning order. The grow partition
/// (if any) takes everything left between the fixed partitions and the GPT
/// backup slack.
pub fn plan_geometry(
    partitions: &[crate::spec::PartitionRequest],
    disk_size_mib: u64,
) -> Result<Vec<PartitionImage>, LifecycleError> {
    let ops = crate::layout::plan(partitions, &[], false)?;

    let fixed: u64 = partitions
        .iter()
        .filter_map(|p| match p.size {
            PartSize::MiB(m) => Some(m),
            PartSize::Grow => None,
        })
        .sum();
    let grow_size = disk_size_mib
        .saturating_sub(fixed)
        .saturating_sub(FIRST_PARTITION_OFFSET_MIB + GPT_BACKUP_SLACK_MIB);
    if grow_size == 0 && partitions.iter().any(|p| p.size == PartSize::Grow) {
        return Err(LifecycleError::InvalidLayout(format!(
            "no space left for the grow-to-fill partition in {disk_size_mib} MiB"
        )));
    }

    let mut start = FIRST_PARTITION_OFFSET_MIB;
    let mut geometry = Vec::new();
    for op in &ops {
        let crate::layout::PlannedOp::CreatePartition {
            role, label, size, ..
        } = op
        else {
            continue;
        };
        let req = partitions
            .iter()
            .find(|p| &p.label == label)
            .ok_or_else(|| LifecycleError::InvalidLayout(format!("unknown label '{label}'")))?;
        let size_mib = match size {
            PartSize::MiB(m) => *m,
            PartSize::Grow => grow_size,
        };
        geometry.push(PartitionImage {
            role: *role,
            label: label.clone(),
            fs: req.fs,
            start_mib: start,
            size_mib,
        });
        start += size_mib;
    }
    Ok(geometry)
}

/// sfdisk input describing the GPT for a geometry.
pub fn sfdisk_script(geometry: &[PartitionImage]) -> String {
    let mut script = String::from("label: gpt\n");
    for part in geometry {
        let type_code = match part.role {
            PartitionRole::Efi => "U",
            _ => "L",
        };
        script.push_str(&format!(
            "start={}, size={}, type={}, name=\"{}\"\n",
            part.start_mib * 1024 * 1024 / SECTOR_SIZE,
            part.size_mib * 1024 * 1024 / SECTOR_SIZE,
            type_code,
            part.label,
        ));
    }
    script
}

fn create_partition_image(image: &Path, part: &PartitionImage, tree: &Path) -> Result<()> {
    let file = fs::File::create(image)
        .with_context(|| format!("creating '{}'", image.display()))?;
    file.set_len(part.size_mib * 1024 * 1024)
        .with_context(|| format!("sizing '{}'", image.display()))?;
    drop(file);

    match part.fs {
        FsKind::Vfat => {
            Cmd::new("mkfs.vfat")
                .args(["-F", "32", "-n", &part.label])
                .arg_path(image)
                .error_msg("mkfs.vfat failed")
                .run()?;
            mcopy_tree(image, tree)
        }
        FsKind::Ext4 | FsKind::Ext2 => Cmd::new(part.fs.mkfs_tool())
            .args(["-q", "-L", &part.label, "-d"])
            .arg_path(tree)
            .arg_path(image)
            .error_msg("mkfs -d failed; check that e2fsprogs supports the -d flag")
            .run(),
    }
}

/// Copy a directory tree into a FAT image with mtools, no mount needed.
fn mcopy_tree(image: &Path, tree: &Path) -> Result<()> {
    for entry in fs::read_dir(tree).with_context(|| format!("reading '{}'", tree.display()))? {
        let entry = entry?;
        Cmd::new("mcopy")
            .arg("-i")
            .arg_path(image)
            .arg("-s")
            .arg_path(&entry.path())
            .arg("::/")
            .error_msg("mcopy failed populating EFI image")
            .run()?;
    }
    Ok(())
}

/// Sparse disk file + sfdisk GPT + dd splice of each partition image.
fn assemble_disk(
    output: &Path,
    disk_size_mib: u64,
    geometry: &[PartitionImage],
    images: &[PathBuf],
) -> Result<()> {
    {
        let file = fs::File::create(output)
            .with_context(|| format!("creating '{}'", output.display()))?;
        file.set_len(disk_size_mib * 1024 * 1024)
            .with_context(|| format!("sizing '{}'", output.display()))?;
    }

    let script = sfdisk_script(geometry);
    let mut child = Command::new("sfdisk")
        .arg(output)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to run sfdisk")?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(script.as_bytes())
            .context("writing sfdisk script")?;
    }
    let status = child.wait().context("waiting for sfdisk")?;
    if !status.success() {
        bail!("sfdisk failed to create the partition table");
    }

    for (part, image) in geometry.iter().zip(images) {
        println!("  Splicing {} at {} MiB...", part.label, part.start_mib);
        Cmd::new("dd")
            .arg(&format!("if={}", image.display()))
            .arg(&format!("of={}", output.display()))
            .args(["bs=1M", "conv=notrunc"])
            .arg(&format!("seek={}", part.start_mib))
            .error_msg("dd failed splicing a partition image")
            .run()?;
    }
    Ok(())
}
