//! Live/installer ISO builds.
//!
//! The resolved root tree is packed into a squashfs under `live/`, the
//! kernel and initrd are lifted into `boot/`, and a small FAT image carries
//! the EFI bootloader for El Torito boot. `xorriso -as mkisofs` produces
//! the final hybrid image, plus a sha512 sidecar for release publishing.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha512};

use crate::actions::{after_hook, before_hook, Collaborators};
use crate::error::LifecycleError;
use crate::hooks::hook;
use crate::interrupt;
use crate::preflight;
use crate::process::Cmd;
use crate::source;
use crate::spec::IsoSpec;
use crate::verify;

const ACTION: &str = "build-iso";

const ISO_BOOT_DIR: &str = "boot";
const ISO_LIVE_DIR: &str = "live";
const ISO_EFI_DIR: &str = "EFI";
const SQUASHFS_NAME: &str = "rootfs.squashfs";
const EFIBOOT_IMAGE: &str = "efiboot.img";
const EFIBOOT_SIZE_MIB: u64 = 16;

/// Kernel/initrd names found in built root trees, in preference order.
const KERNEL_CANDIDATES: &[&str] = &["boot/vmlinuz", "boot/bzImage", "boot/vmlinuz-linux"];
const INITRD_CANDIDATES: &[&str] = &["boot/initrd", "boot/initramfs.img", "boot/initrd.img"];

/// Build a bootable ISO from an image source.
pub fn run(spec: &IsoSpec, collab: &Collaborators<'_>) -> Result<(), LifecycleError> {
    spec.sanitize()?;
    verify::precheck(&spec.verify)?;
    preflight::check_required_tools(preflight::BUILD_ISO_TOOLS)?;

    println!("=== Building ISO '{}' from {} ===\n", spec.volume_label, spec.source);

    fs::create_dir_all(&spec.work_dir)
        .with_context(|| format!("creating '{}'", spec.work_dir.display()))?;

    hook(
        collab.stage_runner,
        &before_hook(ACTION),
        &spec.work_dir,
        &spec.cloud_init_paths,
        spec.strict_hooks,
    )?;

    interrupt::checkpoint("resolve-source")?;
    let rootfs = spec.work_dir.join("rootfs");
    if rootfs.exists() {
        fs::remove_dir_all(&rootfs).context("clearing previous root tree")?;
    }
    fs::create_dir_all(&rootfs).context("creating root tree")?;
    let digest = source::resolve(&spec.source, &rootfs, &collab.resolve)?;
    verify::check(&spec.verify, &digest)?;

    hook(
        collab.stage_runner,
        &after_hook(ACTION),
        &rootfs,
        &spec.cloud_init_paths,
        spec.strict_hooks,
    )?;

    let iso_root = spec.work_dir.join("iso-root");
    setup_iso_structure(&iso_root)?;

    interrupt::checkpoint("pack-squashfs")?;
    println!("Packing root tree into squashfs...");
    Cmd::new("mksquashfs")
        .arg_path(&rootfs)
        .arg_path(&iso_root.join(ISO_LIVE_DIR).join(SQUASHFS_NAME))
        .args(["-comp", "zstd", "-no-progress", "-quiet"])
        .error_msg("mksquashfs failed")
        .run()?;

    let (kernel, initrd) = find_boot_files(&rootfs)?;
    fs::copy(&kernel, iso_root.join(ISO_BOOT_DIR).join("vmlinuz"))
        .with_context(|| format!("copying kernel '{}'", kernel.display()))?;
    fs::copy(&initrd, iso_root.join(ISO_BOOT_DIR).join("initrd"))
        .with_context(|| format!("copying initrd '{}'", initrd.display()))?;

    println!("Building EFI boot image...");
    let efi_tree = spec.work_dir.join("efi-tree");
    if efi_tree.exists() {
        fs::remove_dir_all(&efi_tree).context("clearing previous efi tree")?;
    }
    fs::create_dir_all(&efi_tree).context("creating efi tree")?;
    collab
        .bootloader
        .install(&rootfs, &efi_tree)
        .map_err(LifecycleError::BootloaderUpdateFailed)?;
    let efiboot = iso_root.join(ISO_EFI_DIR).join(EFIBOOT_IMAGE);
    build_efiboot_image(&efiboot, &efi_tree)?;

    interrupt::checkpoint("pack-iso")?;
    println!("Writing ISO...");
    if let Some(parent) = spec.output.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating '{}'", parent.display()))?;
        }
    }
    Cmd::new("xorriso")
        .args(["-as", "mkisofs"])
        .args(["-V", &spec.volume_label])
        .args(["-J", "-r"])
        .args(["-e", &format!("{ISO_EFI_DIR}/{EFIBOOT_IMAGE}")])
        .arg("-no-emul-boot")
        .arg("-isohybrid-gpt-basdat")
        .arg("-o")
        .arg_path(&spec.output)
        .arg_path(&iso_root)
        .error_msg("xorriso failed")
        .run()?;

    let checksum = write_iso_checksum(&spec.output)?;
    println!("\n=== ISO written to {} ({}) ===", spec.output.display(), checksum.display());
    Ok(())
}

/// Standard ISO layout: boot/ for kernel+initrd, live/ for the squashfs,
/// EFI/ for the boot image. A previous build is cleared first.
fn setup_iso_structure(iso_root: &Path) -> Result<()> {
    if iso_root.exists() {
        fs::remove_dir_all(iso_root)
            .with_context(|| format!("clearing '{}'", iso_root.display()))?;
    }
    for dir in [ISO_BOOT_DIR, ISO_LIVE_DIR, ISO_EFI_DIR] {
        fs::create_dir_all(iso_root.join(dir))
            .with_context(|| format!("creating '{}'", iso_root.join(dir).display()))?;
    }
    Ok(())
}

/// Locate the kernel and initrd inside a built root tree.
fn find_boot_files(rootfs: &Path) -> Result<(PathBuf, PathBuf)> {
    let kernel = KERNEL_CANDIDATES
        .iter()
        .map(|c| rootfs.join(c))
        .find(|p| p.is_file());
    let initrd = INITRD_CANDIDATES
        .iter()
        .map(|c| rootfs.join(c))
        .find(|p| p.is_file());
    match (kernel, initrd) {
        (Some(kernel), Some(initrd)) => Ok((kernel, initrd)),
        (None, _) => bail!(
            "no kernel found under '{}/boot' (tried {})",
            rootfs.display(),
            KERNEL_CANDIDATES.join(", ")
        ),
        (_, None) => bail!(
            "no initrd found under '{}/boot' (tried {})",
            rootfs.display(),
            INITRD_CANDIDATES.join(", ")
        ),
    }
}

/// FAT16 image holding the EFI tree, populated with mtools.
fn build_efiboot_image(image: &Path, efi_tree: &Path) -> Result<()> {
    {
        let file = fs::File::create(image)
            .with_context(|| format!("creating '{}'", image.display()))?;
        file.set_len(EFIBOOT_SIZE_MIB * 1024 * 1024)
            .with_context(|| format!("sizing '{}'", image.display()))?;
    }
    Cmd::new("mkfs.vfat")
        .args(["-F", "16", "-n", "EFIBOOT"])
        .arg_path(image)
        .error_msg("mkfs.vfat failed for the EFI boot image")
        .run()?;
    for entry in
        fs::read_dir(efi_tree).with_context(|| format!("reading '{}'", efi_tree.display()))?
    {
        let entry = entry?;
        Cmd::new("mcopy")
            .arg("-i")
            .arg_path(image)
            .arg("-s")
            .arg_path(&entry.path())
            .arg("::/")
            .error_msg("mcopy failed populating the EFI boot image")
            .run()?;
    }
    Ok(())
}

/// `<hash>  <filename>` sidecar next to the ISO, verifiable with
/// `sha512sum -c`.
fn write_iso_checksum(iso_path: &Path) -> Result<PathBuf> {
    let mut file = fs::File::open(iso_path)
        .with_context(|| format!("opening '{}'", iso_path.display()))?;
    let mut hasher = Sha512::new();
    std::io::copy(&mut file, &mut hasher).context("hashing ISO")?;
    let hash = format!("{:x}", hasher.finalize());

    let filename = iso_path
        .file_name()
        .context("ISO path has no file name")?
        .to_string_lossy();
    let checksum_path = iso_path.with_extension("iso.sha512");
    fs::write(&checksum_path, format!("{hash}  {filename}\n"))
        .with_context(|| format!("writing '{}'", checksum_path.display()))?;
    Ok(checksum_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_structure_replaces_previous_build() {
        let tmp = tempfile::tempdir().unwrap();
        let iso_root = tmp.path().join("iso-root");
        fs::create_dir_all(iso_root.join("live")).unwrap();
        fs::write(iso_root.join("live/stale.squashfs"), "old").unwrap();

        setup_iso_structure(&iso_root).unwrap();

        assert!(iso_root.join("boot").is_dir());
        assert!(iso_root.join("live").is_dir());
        assert!(iso_root.join("EFI").is_dir());
        assert!(!iso_root.join("live/stale.squashfs").exists());
    }

    #[test]
    fn boot_files_are_found_by_candidate_order() {
        let tmp = tempfile::tempdir().unwrap();
        let rootfs = tmp.path().join("rootfs");
        fs::create_dir_all(rootfs.join("boot")).unwrap();
        fs::write(rootfs.join("boot/vmlinuz-linux"), "k").unwrap();
        fs::write(rootfs.join("boot/vmlinuz"), "k").unwrap();
        fs::write(rootfs.join("boot/initramfs.img"), "i").unwrap();

        let (kernel, initrd) = find_boot_files(&rootfs).unwrap();
        assert_eq!(kernel, rootfs.join("boot/vmlinuz"));
        assert_eq!(initrd, rootfs.join("boot/initramfs.img"));
    }

    #[test]
    fn missing_kernel_is_a_readable_error() {
        let tmp = tempfile::tempdir().unwrap();
        let rootfs = tmp.path().join("rootfs");
        fs::create_dir_all(rootfs.join("boot")).unwrap();

        let err = find_boot_files(&rootfs).unwrap_err();
        assert!(format!("{err:#}").contains("no kernel found"));
    }

    #[test]
    fn checksum_sidecar_matches_sha512sum_format() {
        let tmp = tempfile::tempdir().unwrap();
        let iso = tmp.path().join("release.iso");
        fs::write(&iso, b"iso bytes").unwrap();

        let sidecar = write_iso_checksum(&iso).unwrap();
        let content = fs::read_to_string(&sidecar).unwrap();
        assert!(content.ends_with("  release.iso\n"));
        // sha512 hex is 128 chars.
        assert_eq!(content.split("  ").next().unwrap().len(), 128);
    }
}
