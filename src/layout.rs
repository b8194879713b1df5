//! Partition layout planning and application.
//!
//! `plan()` is pure: it turns partition requests plus the observed on-disk
//! state into an ordered list of idempotent operations, without touching any
//! device. `apply()` hands those operations to sgdisk/mkfs. Keeping the two
//! apart lets layouts be validated in tests and dry runs against nothing but
//! data.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::LifecycleError;
use crate::process::Cmd;
use crate::spec::{FsKind, PartSize, PartitionRequest, PartitionRole};

/// A partition as discovered on (or planned for) a target device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub role: PartitionRole,
    pub label: String,
    pub device: PathBuf,
    pub fs: FsKind,
    pub size_mib: Option<u64>,
    pub mount_point: Option<PathBuf>,
}

/// One idempotent step of a layout plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedOp {
    /// Write a fresh GPT, destroying whatever table exists.
    CreateTable,
    CreatePartition {
        index: u32,
        role: PartitionRole,
        label: String,
        size: PartSize,
    },
    FormatPartition {
        index: u32,
        label: String,
        fs: FsKind,
    },
    /// Grow the partition and its filesystem into the free space after it.
    ExpandPartition { index: u32, label: String },
}

/// Fixed planning order. Later partitions may depend on remaining free
/// space, so grow-to-fill is only legal at the end.
const ROLE_ORDER: [PartitionRole; 5] = [
    PartitionRole::Efi,
    PartitionRole::State,
    PartitionRole::Recovery,
    PartitionRole::Oem,
    PartitionRole::Persistent,
];

/// Structural validation shared by spec `sanitize()` and `plan()`.
pub fn validate_requests(requested: &[PartitionRequest]) -> Result<(), LifecycleError> {
    let grow_count = requested
        .iter()
        .filter(|p| p.size == PartSize::Grow)
        .count();
    if grow_count > 1 {
        return Err(LifecycleError::InvalidLayout(format!(
            "{grow_count} partitions request grow-to-fill, at most one is allowed"
        )));
    }

    for req in requested {
        if req.label.is_empty() {
            return Err(LifecycleError::InvalidLayout(format!(
                "{} partition has an empty label",
                req.role
            )));
        }
        if req.size == PartSize::MiB(0) {
            return Err(LifecycleError::InvalidLayout(format!(
                "partition '{}' requests zero size",
                req.label
            )));
        }
    }

    let mut seen = Vec::new();
    for req in requested {
        if seen.contains(&req.role) {
            return Err(LifecycleError::InvalidLayout(format!(
                "duplicate {} partition request",
                req.role
            )));
        }
        seen.push(req.role);
    }

    // A grow request anywhere but the final planned slot cannot be honored.
    let ordered = order_requests(requested);
    if let Some(pos) = ordered.iter().position(|p| p.size == PartSize::Grow) {
        if pos != ordered.len() - 1 {
            return Err(LifecycleError::InvalidLayout(format!(
                "grow-to-fill partition '{}' must be the last partition",
                ordered[pos].label
            )));
        }
    }

    Ok(())
}

fn order_requests(requested: &[PartitionRequest]) -> Vec<&PartitionRequest> {
    let mut ordered = Vec::with_capacity(requested.len());
    for role in ROLE_ORDER {
        if let Some(req) = requested.iter().find(|p| p.role == role) {
            ordered.push(req);
        }
    }
    ordered
}

/// Compute the operations needed to realize `requested` on a device that
/// currently carries `existing`.
///
/// With `no_format` set nothing may be created or formatted: every requested
/// label must already exist, and the plan is empty. A missing label is fatal,
/// never skipped; proceeding on a table we cannot verify risks the installed
/// system's mount units.
pub fn plan(
    requested: &[PartitionRequest],
    existing: &[Partition],
    no_format: bool,
) -> Result<Vec<PlannedOp>, LifecycleError> {
    validate_requests(requested)?;

    if no_format {
        for req in requested {
            if !existing.iter().any(|p| p.label == req.label) {
                return Err(LifecycleError::InvalidLayout(format!(
                    "no-format requested but partition labeled '{}' was not found on the target",
                    req.label
                )));
            }
        }
        return Ok(Vec::new());
    }

    let ordered = order_requests(requested);
    let mut ops = vec![PlannedOp::CreateTable];
    for (i, req) in ordered.iter().enumerate() {
        let index = (i + 1) as u32;
        ops.push(PlannedOp::CreatePartition {
            index,
            role: req.role,
            label: req.label.clone(),
            size: req.size,
        });
        ops.push(PlannedOp::FormatPartition {
            index,
            label: req.label.clone(),
            fs: req.fs,
        });
    }
    Ok(ops)
}

/// Device node for partition `index` of `device` (`/dev/sda3`,
/// `/dev/loop0p3`, `/dev/nvme0n1p3`).
pub fn partition_device(device: &Path, index: u32) -> PathBuf {
    let base = device.display().to_string();
    let needs_p = base
        .chars()
        .last()
        .map(|c| c.is_ascii_digit())
        .unwrap_or(false);
    if needs_p {
        PathBuf::from(format!("{base}p{index}"))
    } else {
        PathBuf::from(format!("{base}{index}"))
    }
}

fn gpt_type_code(role: PartitionRole) -> &'static str {
    match role {
        PartitionRole::Efi => "EF00",
        _ => "8300",
    }
}

/// Execute a layout plan against a real device.
pub fn apply(device: &Path, ops: &[PlannedOp]) -> Result<()> {
    for op in ops {
        match op {
            PlannedOp::CreateTable => {
                Cmd::new("sgdisk")
                    .args(["--zap-all"])
                    .arg_path(device)
                    .error_msg("failed clearing partition table")
                    .run()?;
            }
            PlannedOp::CreatePartition {
                index,
                role,
                label,
                size,
            } => {
                let size_arg = match size {
                    PartSize::MiB(mib) => format!("--new={index}:0:+{mib}M"),
                    PartSize::Grow => format!("--new={index}:0:0"),
                };
                Cmd::new("sgdisk")
                    .arg(&size_arg)
                    .arg(&format!("--typecode={index}:{}", gpt_type_code(*role)))
                    .arg(&format!("--change-name={index}:{label}"))
                    .arg_path(device)
                    .error_msg("failed creating partition")
                    .run()
                    .with_context(|| format!("creating partition '{label}'"))?;
            }
            PlannedOp::FormatPartition { index, label, fs } => {
                let part_dev = partition_device(device, *index);
                format_partition(&part_dev, label, *fs)?;
            }
            PlannedOp::ExpandPartition { index, label } => {
                Cmd::new("sgdisk")
                    .arg(&format!("--delete={index}"))
                    .arg(&format!("--new={index}:0:0"))
                    .arg(&format!("--change-name={index}:{label}"))
                    .arg_path(device)
                    .error_msg("failed expanding partition")
                    .run()?;
                let part_dev = partition_device(device, *index);
                Cmd::new("resize2fs")
                    .arg_path(&part_dev)
                    .error_msg("failed growing filesystem")
                    .run()?;
            }
        }
    }

    // Let the kernel re-read the table before anything touches the nodes.
    Cmd::new("partprobe")
        .arg_path(device)
        .error_msg("failed re-reading partition table")
        .run()?;

    Ok(())
}

/// Format one partition device with the given filesystem and label.
pub fn format_partition(part_dev: &Path, label: &str, fs: FsKind) -> Result<()> {
    let cmd = match fs {
        FsKind::Vfat => Cmd::new("mkfs.vfat").args(["-n", label]),
        FsKind::Ext4 => Cmd::new("mkfs.ext4").args(["-q", "-F", "-L", label]),
        FsKind::Ext2 => Cmd::new("mkfs.ext2").args(["-q", "-F", "-L", label]),
    };
    cmd.arg_path(part_dev)
        .error_msg(&format!("{} failed", fs.mkfs_tool()))
        .run()
        .with_context(|| format!("formatting '{label}' on {}", part_dev.display()))
}

/// Read the partitions present on `device` via `lsblk`.
pub fn probe_existing(device: &Path) -> Result<Vec<Partition>> {
    let out = Cmd::new("lsblk")
        .args(["--json", "--output", "NAME,LABEL,FSTYPE,SIZE", "--bytes"])
        .arg_path(device)
        .error_msg("failed listing partitions")
        .run_capture()?;
    parse_lsblk(&out)
}

fn parse_lsblk(json: &str) -> Result<Vec<Partition>> {
    #[derive(serde::Deserialize)]
    struct LsblkDev {
        name: String,
        label: Option<String>,
        fstype: Option<String>,
        size: Option<u64>,
        #[serde(default)]
        children: Vec<LsblkDev>,
    }
    #[derive(serde::Deserialize)]
    struct Lsblk {
        blockdevices: Vec<LsblkDev>,
    }

    let parsed: Lsblk = serde_json::from_str(json).context("parsing lsblk output")?;
    let mut parts = Vec::new();
    for dev in &parsed.blockdevices {
        for child in &dev.children {
            let label = match &child.label {
                Some(l) if !l.is_empty() => l.clone(),
                _ => continue,
            };
            let fs = match child.fstype.as_deref() {
                Some("vfat") => FsKind::Vfat,
                Some("ext2") => FsKind::Ext2,
                _ => FsKind::Ext4,
            };
            let role = role_for_label(&label);
            parts.push(Partition {
                role,
                label,
                device: PathBuf::from(format!("/dev/{}", child.name)),
                fs,
                size_mib: child.size.map(|b| b / (1024 * 1024)),
                mount_point: None,
            });
        }
    }
    Ok(parts)
}

fn role_for_label(label: &str) -> PartitionRole {
    match label {
        crate::spec::EFI_LABEL => PartitionRole::Efi,
        crate::spec::RECOVERY_LABEL => PartitionRole::Recovery,
        crate::spec::OEM_LABEL => PartitionRole::Oem,
        crate::spec::PERSISTENT_LABEL => PartitionRole::Persistent,
        _ => PartitionRole::State,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{default_layout, PERSISTENT_LABEL, STATE_LABEL};

    fn existing(labels: &[&str]) -> Vec<Partition> {
        labels
            .iter()
            .enumerate()
            .map(|(i, l)| Partition {
                role: role_for_label(l),
                label: l.to_string(),
                device: PathBuf::from(format!("/dev/sda{}", i + 1)),
                fs: FsKind::Ext4,
                size_mib: Some(1024),
                mount_point: None,
            })
            .collect()
    }

    #[test]
    fn plan_formats_in_fixed_role_order() {
        let ops = plan(&default_layout(), &[], false).unwrap();
        assert_eq!(ops[0], PlannedOp::CreateTable);
        let roles: Vec<PartitionRole> = ops
            .iter()
            .filter_map(|op| match op {
                PlannedOp::CreatePartition { role, .. } => Some(*role),
                _ => None,
            })
            .collect();
        assert_eq!(roles, ROLE_ORDER.to_vec());
    }

    #[test]
    fn plan_orders_roles_regardless_of_request_order() {
        let mut reversed = default_layout();
        reversed.reverse();
        let ops = plan(&reversed, &[], false).unwrap();
        let first_created = ops.iter().find_map(|op| match op {
            PlannedOp::CreatePartition { role, .. } => Some(*role),
            _ => None,
        });
        assert_eq!(first_created, Some(PartitionRole::Efi));
    }

    #[test]
    fn plan_is_deterministic_for_identical_inputs() {
        let layout = default_layout();
        assert_eq!(
            plan(&layout, &[], false).unwrap(),
            plan(&layout, &[], false).unwrap()
        );
    }

    #[test]
    fn no_format_requires_every_label_present() {
        let layout = default_layout();
        let all = existing(&[
            crate::spec::EFI_LABEL,
            STATE_LABEL,
            crate::spec::RECOVERY_LABEL,
            crate::spec::OEM_LABEL,
            PERSISTENT_LABEL,
        ]);
        assert!(plan(&layout, &all, true).unwrap().is_empty());

        let missing = existing(&[crate::spec::EFI_LABEL, STATE_LABEL]);
        let err = plan(&layout, &missing, true).unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidLayout(_)));
        assert_eq!(err.exit_code(), 10);
    }

    #[test]
    fn double_grow_is_invalid_regardless_of_other_fields() {
        let layout = vec![
            PartitionRequest::new(PartitionRole::State, STATE_LABEL, PartSize::Grow, FsKind::Ext4),
            PartitionRequest::new(
                PartitionRole::Persistent,
                PERSISTENT_LABEL,
                PartSize::Grow,
                FsKind::Ext2,
            ),
        ];
        let err = plan(&layout, &[], false).unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidLayout(_)));
        // The same failure with no_format set, before existing labels are
        // even considered.
        assert!(plan(&layout, &[], true).is_err());
    }

    #[test]
    fn grow_must_be_last_in_planning_order() {
        let layout = vec![
            PartitionRequest::new(PartitionRole::State, STATE_LABEL, PartSize::Grow, FsKind::Ext4),
            PartitionRequest::new(
                PartitionRole::Persistent,
                PERSISTENT_LABEL,
                PartSize::MiB(64),
                FsKind::Ext4,
            ),
        ];
        assert!(plan(&layout, &[], false).is_err());
    }

    #[test]
    fn duplicate_roles_are_invalid() {
        let layout = vec![
            PartitionRequest::new(PartitionRole::State, "A", PartSize::MiB(10), FsKind::Ext4),
            PartitionRequest::new(PartitionRole::State, "B", PartSize::MiB(10), FsKind::Ext4),
        ];
        assert!(plan(&layout, &[], false).is_err());
    }

    #[test]
    fn partition_device_naming() {
        assert_eq!(
            partition_device(Path::new("/dev/sda"), 3),
            PathBuf::from("/dev/sda3")
        );
        assert_eq!(
            partition_device(Path::new("/dev/loop0"), 3),
            PathBuf::from("/dev/loop0p3")
        );
        assert_eq!(
            partition_device(Path::new("/dev/nvme0n1"), 1),
            PathBuf::from("/dev/nvme0n1p1")
        );
    }

    #[test]
    fn parse_lsblk_extracts_labeled_children() {
        let json = r#"{
            "blockdevices": [
                {"name": "sda", "label": null, "fstype": null, "size": 100,
                 "children": [
                    {"name": "sda1", "label": "SLOT_EFI", "fstype": "vfat", "size": 67108864},
                    {"name": "sda2", "label": "SLOT_STATE", "fstype": "ext4", "size": 134217728},
                    {"name": "sda3", "label": null, "fstype": "ext4", "size": 1}
                 ]}
            ]
        }"#;
        let parts = parse_lsblk(json).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].role, PartitionRole::Efi);
        assert_eq!(parts[0].size_mib, Some(64));
        assert_eq!(parts[1].label, "SLOT_STATE");
    }
}
