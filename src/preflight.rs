//! Host tool validation before actions run.
//!
//! Checking up front turns cryptic mid-action subprocess failures into one
//! readable report naming the missing tools and their packages.

use anyhow::{bail, Result};

/// Tools every mutating device action needs. Each entry is
/// (command_name, package_name).
pub const INSTALL_TOOLS: &[(&str, &str)] = &[
    ("sgdisk", "gptfdisk"),
    ("partprobe", "parted"),
    ("mkfs.ext4", "e2fsprogs"),
    ("mkfs.vfat", "dosfstools"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("rsync", "rsync"),
    ("lsblk", "util-linux"),
    ("mksquashfs", "squashfs-tools"),
];

/// Tools for factory resets, which unpack the deployed recovery image.
pub const RESET_TOOLS: &[(&str, &str)] = &[
    ("unsquashfs", "squashfs-tools"),
    ("rsync", "rsync"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
];

/// Additional tools for registry image sources.
pub const REGISTRY_TOOLS: &[(&str, &str)] = &[("skopeo", "skopeo"), ("umoci", "umoci")];

/// Tools for unprivileged disk image builds.
pub const BUILD_DISK_TOOLS: &[(&str, &str)] = &[
    ("sfdisk", "util-linux"),
    ("dd", "coreutils"),
    ("mkfs.ext4", "e2fsprogs"),
    ("mkfs.vfat", "dosfstools"),
    ("mmd", "mtools"),
    ("mcopy", "mtools"),
    ("rsync", "rsync"),
];

/// Tools for ISO builds.
pub const BUILD_ISO_TOOLS: &[(&str, &str)] = &[
    ("mksquashfs", "squashfs-tools"),
    ("xorriso", "xorriso"),
    ("rsync", "rsync"),
];

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that specific tools are available, reporting all missing ones.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Whether the process runs as root. Mutating actions on real block devices
/// refuse to start without it.
pub fn is_root() -> bool {
    // SAFETY: geteuid has no failure modes.
    unsafe { libc::geteuid() == 0 }
}
