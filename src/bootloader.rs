//! Bootloader management.
//!
//! GRUB is driven through two seams: a payload install (grub binaries plus
//! a static grub.cfg that chain-loads whatever the env file names) and the
//! persistent env vars that select the active/passive snapshots. The env
//! write is the actual boot switch, so orchestrators call it only after the
//! state file has been flushed.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};

use crate::process::Cmd;

pub const GRUB_ENV_FILE: &str = "grub_env";
pub const GRUB_CFG_FILE: &str = "grub.cfg";

/// Env var names read by the shipped grub.cfg.
pub const VAR_ACTIVE_SNAPSHOT: &str = "active_snapshot";
pub const VAR_PASSIVE_SNAPSHOT: &str = "passive_snapshot";
pub const VAR_DEFAULT_ENTRY: &str = "default_entry";

pub trait Bootloader {
    /// Install the bootloader payload from the staged root into the EFI
    /// partition.
    fn install(&self, root_tree: &Path, efi_mount: &Path) -> Result<()>;

    /// Write persistent variables into the env file under `efi_mount`.
    fn set_persistent_vars(&self, efi_mount: &Path, vars: &[(String, String)]) -> Result<()>;
}

/// Candidate locations of the grub EFI binary inside a staged root.
const GRUB_EFI_CANDIDATES: &[&str] = &[
    "usr/share/grub2/x86_64-efi/grub.efi",
    "usr/lib/grub/x86_64-efi/grub.efi",
    "usr/share/efi/x86_64/grub.efi",
    "boot/efi/EFI/BOOT/grubx64.efi",
];

/// Real GRUB driver. Env vars go through `grub2-editenv` so the on-disk
/// format stays whatever the installed grub expects.
pub struct Grub {
    /// Skip NVRAM boot entry registration (removable media, disk images).
    pub disable_boot_entry: bool,
}

impl Grub {
    pub fn new() -> Self {
        Self {
            disable_boot_entry: true,
        }
    }

    fn find_efi_binary(&self, root_tree: &Path) -> Result<PathBuf> {
        for candidate in GRUB_EFI_CANDIDATES {
            let path = root_tree.join(candidate);
            if path.is_file() {
                return Ok(path);
            }
        }
        bail!(
            "no grub EFI binary found under '{}' (tried {} locations)",
            root_tree.display(),
            GRUB_EFI_CANDIDATES.len()
        )
    }
}

impl Default for Grub {
    fn default() -> Self {
        Self::new()
    }
}

impl Bootloader for Grub {
    fn install(&self, root_tree: &Path, efi_mount: &Path) -> Result<()> {
        let efi_binary = self.find_efi_binary(root_tree)?;

        let boot_dir = efi_mount.join("EFI/BOOT");
        fs::create_dir_all(&boot_dir)
            .with_context(|| format!("creating '{}'", boot_dir.display()))?;
        fs::copy(&efi_binary, boot_dir.join("BOOTX64.EFI")).with_context(|| {
            format!("installing '{}' into EFI partition", efi_binary.display())
        })?;

        // Static config: everything dynamic lives in the env file.
        let grub_cfg = root_tree.join("etc/slotkit/grub.cfg");
        let cfg_content = if grub_cfg.is_file() {
            fs::read_to_string(&grub_cfg)
                .with_context(|| format!("reading '{}'", grub_cfg.display()))?
        } else {
            default_grub_cfg()
        };
        fs::write(boot_dir.join(GRUB_CFG_FILE), cfg_content)
            .context("writing grub.cfg into EFI partition")?;

        if !self.disable_boot_entry {
            Cmd::new("efibootmgr")
                .args(["--create", "--label", "slotkit"])
                .error_msg("failed registering EFI boot entry")
                .run()?;
        }
        Ok(())
    }

    fn set_persistent_vars(&self, efi_mount: &Path, vars: &[(String, String)]) -> Result<()> {
        let env_file = efi_mount.join(GRUB_ENV_FILE);
        if !env_file.exists() {
            Cmd::new("grub2-editenv")
                .arg_path(&env_file)
                .arg("create")
                .error_msg("failed creating grub env file")
                .run()?;
        }
        let mut cmd = Cmd::new("grub2-editenv").arg_path(&env_file).arg("set");
        for (key, value) in vars {
            cmd = cmd.arg(&format!("{key}={value}"));
        }
        cmd.error_msg("failed setting grub env variables").run()
    }
}

fn default_grub_cfg() -> String {
    format!(
        "set timeout=3\n\
         load_env -f ${{prefix}}/../{env}\n\
         menuentry \"Active\" {{\n    search --label {state} --set root\n    linux /${{{active}}}/boot/vmlinuz root=LABEL={state} slot=${{{active}}}\n    initrd /${{{active}}}/boot/initrd\n}}\n\
         menuentry \"Fallback\" {{\n    search --label {state} --set root\n    linux /${{{passive}}}/boot/vmlinuz root=LABEL={state} slot=${{{passive}}}\n    initrd /${{{passive}}}/boot/initrd\n}}\n\
         menuentry \"Recovery\" {{\n    search --label {recovery} --set root\n    loopback loop0 /{image}\n    linux (loop0)/boot/vmlinuz root=LABEL={recovery} recovery_mode=1\n    initrd (loop0)/boot/initrd\n}}\n",
        env = GRUB_ENV_FILE,
        image = crate::actions::RECOVERY_IMAGE_FILE,
        state = crate::spec::STATE_LABEL,
        recovery = crate::spec::RECOVERY_LABEL,
        active = VAR_ACTIVE_SNAPSHOT,
        passive = VAR_PASSIVE_SNAPSHOT,
    )
}

/// Fake bootloader recording calls, for tests and unprivileged builds that
/// assemble env files without grub tooling on the host.
#[derive(Default)]
pub struct MemoryBootloader {
    pub installs: Mutex<Vec<(PathBuf, PathBuf)>>,
    pub vars: Mutex<Vec<(String, String)>>,
    pub fail_vars: bool,
}

impl MemoryBootloader {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Bootloader for MemoryBootloader {
    fn install(&self, root_tree: &Path, efi_mount: &Path) -> Result<()> {
        self.installs
            .lock()
            .expect("poisoned")
            .push((root_tree.to_path_buf(), efi_mount.to_path_buf()));
        Ok(())
    }

    fn set_persistent_vars(&self, efi_mount: &Path, vars: &[(String, String)]) -> Result<()> {
        if self.fail_vars {
            bail!("injected bootloader env failure");
        }
        // Mirror the real driver closely enough for assertions: write a
        // plain key=value file under the EFI mount.
        let mut content = String::new();
        for (key, value) in vars {
            self.vars.lock().expect("poisoned").push((key.clone(), value.clone()));
            content.push_str(&format!("{key}={value}\n"));
        }
        fs::create_dir_all(efi_mount)?;
        fs::write(efi_mount.join(GRUB_ENV_FILE), content)?;
        Ok(())
    }
}

/// The env vars for switching the default boot target to snapshot `active`,
/// with `passive` as the fallback entry.
pub fn slot_vars(active: u32, passive: Option<u32>) -> Vec<(String, String)> {
    let mut vars = vec![
        (
            VAR_ACTIVE_SNAPSHOT.to_string(),
            format!("snapshots/{active}"),
        ),
        (VAR_DEFAULT_ENTRY.to_string(), "0".to_string()),
    ];
    if let Some(passive) = passive {
        vars.push((
            VAR_PASSIVE_SNAPSHOT.to_string(),
            format!("snapshots/{passive}"),
        ));
    }
    vars
}
