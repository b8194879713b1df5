//! Mount acquisition with guaranteed, ordered release.
//!
//! A [`Mounter`] is an injected strategy so build/test contexts can run with
//! a fake that never touches the kernel mount table. [`MountStack`] owns
//! every mount acquired for an action and releases them in reverse order on
//! all exit paths, attempting each one even when an earlier unmount fails
//! and aggregating the failures instead of stopping at the first.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::error::LifecycleError;
use crate::process::Cmd;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    pub device: PathBuf,
    pub mount_point: PathBuf,
    pub fstype: Option<String>,
    /// Bind mount; `device` is then the source directory.
    pub bind: bool,
}

impl MountRequest {
    pub fn device(device: &Path, mount_point: &Path) -> Self {
        Self {
            device: device.to_path_buf(),
            mount_point: mount_point.to_path_buf(),
            fstype: None,
            bind: false,
        }
    }

    pub fn bind(source: &Path, mount_point: &Path) -> Self {
        Self {
            device: source.to_path_buf(),
            mount_point: mount_point.to_path_buf(),
            fstype: None,
            bind: true,
        }
    }
}

/// Strategy interface over mount(8)/umount(8).
pub trait Mounter {
    fn mount(&self, req: &MountRequest) -> Result<()>;
    fn unmount(&self, mount_point: &Path) -> Result<()>;
}

/// Real mounter shelling out to the system tools. Requires privileges.
pub struct LinuxMounter;

impl Mounter for LinuxMounter {
    fn mount(&self, req: &MountRequest) -> Result<()> {
        fs::create_dir_all(&req.mount_point).with_context(|| {
            format!("creating mount point '{}'", req.mount_point.display())
        })?;
        let mut cmd = Cmd::new("mount");
        if req.bind {
            cmd = cmd.arg("--bind");
        } else if let Some(fstype) = &req.fstype {
            cmd = cmd.args(["-t", fstype]);
        }
        cmd.arg_path(&req.device)
            .arg_path(&req.mount_point)
            .error_msg("mount failed")
            .run()
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        Cmd::new("umount")
            .arg_path(mount_point)
            .error_msg("umount failed")
            .run()
    }
}

/// Records calls without touching the kernel. Used by unprivileged builds
/// and tests; mount points are still created as plain directories so the
/// rest of an action can write through them.
#[derive(Default, Clone)]
pub struct FakeMounter {
    pub log: Arc<Mutex<Vec<String>>>,
    /// Mount points whose unmount should fail, for error-path tests.
    pub fail_unmount: Arc<Mutex<Vec<PathBuf>>>,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().expect("fake mounter log poisoned").clone()
    }
}

impl Mounter for FakeMounter {
    fn mount(&self, req: &MountRequest) -> Result<()> {
        fs::create_dir_all(&req.mount_point)?;
        self.log
            .lock()
            .expect("fake mounter log poisoned")
            .push(format!("mount {}", req.mount_point.display()));
        Ok(())
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        self.log
            .lock()
            .expect("fake mounter log poisoned")
            .push(format!("umount {}", mount_point.display()));
        let failing = self.fail_unmount.lock().expect("poisoned");
        if failing.iter().any(|p| p == mount_point) {
            anyhow::bail!("injected unmount failure for {}", mount_point.display());
        }
        Ok(())
    }
}

/// Scoped owner of everything mounted for one action.
pub struct MountStack<'a> {
    mounter: &'a dyn Mounter,
    acquired: Vec<PathBuf>,
    released: bool,
}

impl<'a> MountStack<'a> {
    pub fn new(mounter: &'a dyn Mounter) -> Self {
        Self {
            mounter,
            acquired: Vec::new(),
            released: false,
        }
    }

    /// Mount one request onto the stack. On failure nothing is recorded, so
    /// release covers exactly the successfully acquired mounts.
    pub fn push(&mut self, req: &MountRequest) -> Result<(), LifecycleError> {
        self.mounter
            .mount(req)
            .map_err(LifecycleError::MountFailed)?;
        self.acquired.push(req.mount_point.clone());
        Ok(())
    }

    pub fn acquired(&self) -> &[PathBuf] {
        &self.acquired
    }

    /// Unmount everything in reverse acquisition order. Every mount is
    /// attempted; failures are collected into one aggregated error.
    pub fn release(mut self) -> Result<(), LifecycleError> {
        self.released = true;
        let mut failures = Vec::new();
        for mount_point in self.acquired.drain(..).rev() {
            if let Err(e) = self.mounter.unmount(&mount_point) {
                failures.push(format!("  {}: {e:#}", mount_point.display()));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::UnmountFailed(failures.join("\n")))
        }
    }
}

impl Drop for MountStack<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Last-resort release for early returns and unwinding; errors can
        // only be logged here.
        for mount_point in self.acquired.drain(..).rev() {
            if let Err(e) = self.mounter.unmount(&mount_point) {
                log::warn!("cleanup unmount of {} failed: {e:#}", mount_point.display());
            }
        }
    }
}
