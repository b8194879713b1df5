//! Typed per-action specifications.
//!
//! Each subcommand builds exactly one spec value from flags plus optional
//! config-file defaults, validates it once with `sanitize()`, and the
//! orchestrators treat it as immutable from then on. No component reads
//! ambient global state.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::LifecycleError;
use crate::source::ImageSource;

/// Conventional filesystem labels. The running OS's mount units depend on
/// these names; renaming any of them is a breaking change.
pub const EFI_LABEL: &str = "SLOT_EFI";
pub const STATE_LABEL: &str = "SLOT_STATE";
pub const RECOVERY_LABEL: &str = "SLOT_RECOVERY";
pub const OEM_LABEL: &str = "SLOT_OEM";
pub const PERSISTENT_LABEL: &str = "SLOT_PERSISTENT";

/// Default partition sizes in MiB.
pub const EFI_SIZE_MIB: u64 = 64;
pub const OEM_SIZE_MIB: u64 = 64;
pub const STATE_SIZE_MIB: u64 = 15360;
pub const RECOVERY_SIZE_MIB: u64 = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionRole {
    Efi,
    State,
    Recovery,
    Oem,
    Persistent,
}

impl fmt::Display for PartitionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PartitionRole::Efi => "efi",
            PartitionRole::State => "state",
            PartitionRole::Recovery => "recovery",
            PartitionRole::Oem => "oem",
            PartitionRole::Persistent => "persistent",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartSize {
    MiB(u64),
    /// Fill the remaining free space. Legal only for the last partition.
    Grow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Vfat,
    Ext4,
    Ext2,
}

impl FsKind {
    pub fn mkfs_tool(&self) -> &'static str {
        match self {
            FsKind::Vfat => "mkfs.vfat",
            FsKind::Ext4 => "mkfs.ext4",
            FsKind::Ext2 => "mkfs.ext2",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FsKind::Vfat => "vfat",
            FsKind::Ext4 => "ext4",
            FsKind::Ext2 => "ext2",
        }
    }
}

/// One requested partition in the layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRequest {
    pub role: PartitionRole,
    pub label: String,
    pub size: PartSize,
    pub fs: FsKind,
}

impl PartitionRequest {
    pub fn new(role: PartitionRole, label: &str, size: PartSize, fs: FsKind) -> Self {
        Self {
            role,
            label: label.to_string(),
            size,
            fs,
        }
    }
}

/// The stock five-partition layout for a fresh install.
pub fn default_layout() -> Vec<PartitionRequest> {
    vec![
        PartitionRequest::new(PartitionRole::Efi, EFI_LABEL, PartSize::MiB(EFI_SIZE_MIB), FsKind::Vfat),
        PartitionRequest::new(
            PartitionRole::State,
            STATE_LABEL,
            PartSize::MiB(STATE_SIZE_MIB),
            FsKind::Ext4,
        ),
        PartitionRequest::new(
            PartitionRole::Recovery,
            RECOVERY_LABEL,
            PartSize::MiB(RECOVERY_SIZE_MIB),
            FsKind::Ext4,
        ),
        PartitionRequest::new(PartitionRole::Oem, OEM_LABEL, PartSize::MiB(OEM_SIZE_MIB), FsKind::Ext4),
        PartitionRequest::new(
            PartitionRole::Persistent,
            PERSISTENT_LABEL,
            PartSize::Grow,
            FsKind::Ext4,
        ),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Firmware {
    #[default]
    Efi,
    Bios,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerAction {
    #[default]
    None,
    Reboot,
    PowerOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyPolicy {
    /// No digest check. The deliberate default; verification is opt-in.
    #[default]
    Disabled,
    /// Check and log a flagged warning on mismatch, then proceed.
    Warn,
    /// Check and abort before promotion on mismatch or missing digest.
    Strict,
}

#[derive(Debug, Clone, Default)]
pub struct VerifyConfig {
    pub policy: VerifyPolicy,
    pub expected_digest: Option<String>,
}

/// Spec for `slotkit install DEVICE`.
#[derive(Debug, Clone)]
pub struct InstallSpec {
    /// Block device, or a directory for unprivileged/container installs.
    pub target: PathBuf,
    pub source: ImageSource,
    pub partitions: Vec<PartitionRequest>,
    pub firmware: Firmware,
    pub no_format: bool,
    pub force: bool,
    pub verify: VerifyConfig,
    pub cloud_init: Option<PathBuf>,
    pub cloud_init_paths: Vec<PathBuf>,
    pub strict_hooks: bool,
    pub power: PowerAction,
}

impl InstallSpec {
    pub fn sanitize(&self) -> Result<(), LifecycleError> {
        if self.target.as_os_str().is_empty() {
            return Err(LifecycleError::InvalidLayout("empty install target".into()));
        }
        if self.partitions.is_empty() {
            return Err(LifecycleError::InvalidLayout("no partitions requested".into()));
        }
        let missing_state = !self
            .partitions
            .iter()
            .any(|p| p.role == PartitionRole::State);
        if missing_state {
            return Err(LifecycleError::InvalidLayout(
                "layout is missing the state partition".into(),
            ));
        }
        crate::layout::validate_requests(&self.partitions)?;
        Ok(())
    }
}

/// Spec for `slotkit upgrade`.
#[derive(Debug, Clone)]
pub struct UpgradeSpec {
    /// Mount point of the state partition on the running system.
    pub state_mount: PathBuf,
    /// Mount point of the recovery partition on the running system.
    pub recovery_mount: PathBuf,
    pub efi_mount: PathBuf,
    /// Mount point of the config partition, bind-mounted into chroot hooks.
    pub oem_mount: Option<PathBuf>,
    /// Mount point of the persistent partition, bind-mounted into chroot
    /// hooks.
    pub persistent_mount: Option<PathBuf>,
    pub source: ImageSource,
    /// Also refresh the recovery image after the active slot upgrade.
    pub recovery_upgrade: bool,
    /// Reinstall the bootloader payload alongside the upgrade.
    pub bootloader_upgrade: bool,
    pub verify: VerifyConfig,
    pub cloud_init_paths: Vec<PathBuf>,
    pub strict_hooks: bool,
    pub power: PowerAction,
}

impl UpgradeSpec {
    pub fn sanitize(&self) -> Result<(), LifecycleError> {
        if self.state_mount.as_os_str().is_empty() {
            return Err(LifecycleError::InvalidLayout("empty state mount point".into()));
        }
        Ok(())
    }
}

/// Spec for `slotkit reset`.
#[derive(Debug, Clone)]
pub struct ResetSpec {
    pub state_mount: PathBuf,
    pub recovery_mount: PathBuf,
    pub efi_mount: PathBuf,
    pub oem_mount: Option<PathBuf>,
    pub persistent_mount: Option<PathBuf>,
    pub source: ImageSource,
    /// Reformat the persistent partition as part of the reset.
    pub reset_persistent: bool,
    /// Reformat the oem partition as part of the reset.
    pub reset_oem: bool,
    pub verify: VerifyConfig,
    pub cloud_init: Option<PathBuf>,
    pub cloud_init_paths: Vec<PathBuf>,
    pub strict_hooks: bool,
    pub power: PowerAction,
}

impl ResetSpec {
    pub fn sanitize(&self) -> Result<(), LifecycleError> {
        if self.state_mount.as_os_str().is_empty() {
            return Err(LifecycleError::InvalidLayout("empty state mount point".into()));
        }
        Ok(())
    }
}

/// Spec for `slotkit build-disk [IMAGE]`.
#[derive(Debug, Clone)]
pub struct DiskSpec {
    pub source: ImageSource,
    pub output: PathBuf,
    pub work_dir: PathBuf,
    pub partitions: Vec<PartitionRequest>,
    /// Total image size in MiB; grow partitions fill up to this.
    pub disk_size_mib: u64,
    pub verify: VerifyConfig,
    pub cloud_init_paths: Vec<PathBuf>,
    pub strict_hooks: bool,
}

impl DiskSpec {
    pub fn sanitize(&self) -> Result<(), LifecycleError> {
        crate::layout::validate_requests(&self.partitions)?;
        let fixed: u64 = self
            .partitions
            .iter()
            .filter_map(|p| match p.size {
                PartSize::MiB(m) => Some(m),
                PartSize::Grow => None,
            })
            .sum();
        if fixed + 2 > self.disk_size_mib {
            return Err(LifecycleError::InvalidLayout(format!(
                "disk size {} MiB is too small for {} MiB of fixed partitions",
                self.disk_size_mib, fixed
            )));
        }
        Ok(())
    }
}

/// Spec for `slotkit build-iso SOURCE`.
#[derive(Debug, Clone)]
pub struct IsoSpec {
    pub source: ImageSource,
    pub output: PathBuf,
    pub work_dir: PathBuf,
    pub volume_label: String,
    pub verify: VerifyConfig,
    pub cloud_init_paths: Vec<PathBuf>,
    pub strict_hooks: bool,
}

impl IsoSpec {
    pub fn sanitize(&self) -> Result<(), LifecycleError> {
        if self.volume_label.is_empty() || self.volume_label.len() > 32 {
            return Err(LifecycleError::InvalidLayout(format!(
                "invalid ISO volume label '{}'",
                self.volume_label
            )));
        }
        Ok(())
    }
}
