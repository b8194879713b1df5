//! Configuration stage hooks.
//!
//! The declarative stage runner is an external collaborator behind
//! [`StageRunner`]: the orchestrators supply a stage name
//! (`before-install`, `after-upgrade`, ...) and a target root, the
//! collaborator owns execution semantics. The `strict` flag decides whether
//! a failing hook aborts the action or is logged and ignored.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;

use crate::error::LifecycleError;
use crate::mounts::{MountRequest, MountStack, Mounter};
use crate::process::Cmd;

pub trait StageRunner {
    fn run(&self, stage: &str, root: &Path, extra_paths: &[PathBuf]) -> Result<()>;
}

/// Runs the configured stage-runner binary (`<program> <stage> --root
/// <root> [--path <extra>...]`).
pub struct CommandStageRunner {
    pub program: String,
}

impl CommandStageRunner {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }
}

impl StageRunner for CommandStageRunner {
    fn run(&self, stage: &str, root: &Path, extra_paths: &[PathBuf]) -> Result<()> {
        let mut cmd = Cmd::new(&self.program)
            .arg(stage)
            .args(["--root"])
            .arg_path(root);
        for path in extra_paths {
            cmd = cmd.arg("--path").arg_path(path);
        }
        cmd.error_msg(&format!("stage '{stage}' failed")).run()
    }
}

/// Records stages for tests; optionally fails named stages.
#[derive(Default)]
pub struct RecordingStageRunner {
    pub stages: Mutex<Vec<String>>,
    pub fail_stages: Vec<String>,
}

impl RecordingStageRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(stages: &[&str]) -> Self {
        Self {
            stages: Mutex::new(Vec::new()),
            fail_stages: stages.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn ran(&self) -> Vec<String> {
        self.stages.lock().expect("poisoned").clone()
    }
}

impl StageRunner for RecordingStageRunner {
    fn run(&self, stage: &str, _root: &Path, _extra_paths: &[PathBuf]) -> Result<()> {
        self.stages.lock().expect("poisoned").push(stage.to_string());
        if self.fail_stages.iter().any(|s| s == stage) {
            anyhow::bail!("injected failure for stage '{stage}'");
        }
        Ok(())
    }
}

/// Run one hook stage with strict/lenient semantics.
pub fn hook(
    runner: &dyn StageRunner,
    stage: &str,
    root: &Path,
    extra_paths: &[PathBuf],
    strict: bool,
) -> Result<(), LifecycleError> {
    println!("Running '{stage}' hook");
    match runner.run(stage, root, extra_paths) {
        Ok(()) => Ok(()),
        Err(source) if strict => Err(LifecycleError::HookFailed {
            stage: stage.to_string(),
            source,
        }),
        Err(source) => {
            log::warn!("hook '{stage}' failed (non-strict, continuing): {source:#}");
            Ok(())
        }
    }
}

/// Run a hook against a target root with extra partitions bind-mounted
/// inside it (oem, persistent), releasing the binds on every path.
pub fn chroot_hook(
    runner: &dyn StageRunner,
    mounter: &dyn Mounter,
    stage: &str,
    root: &Path,
    binds: &BTreeMap<PathBuf, PathBuf>,
    extra_paths: &[PathBuf],
    strict: bool,
) -> Result<(), LifecycleError> {
    let mut stack = MountStack::new(mounter);
    for (source, target_rel) in binds {
        let target = root.join(target_rel.strip_prefix("/").unwrap_or(target_rel));
        stack.push(&MountRequest::bind(source, &target))?;
    }

    let result = hook(runner, stage, root, extra_paths, strict);
    let release = stack.release();
    // A hook failure takes precedence over a release failure; a leaked
    // bind still fails an otherwise successful hook.
    match (result, release) {
        (Err(e), _) => Err(e),
        (Ok(()), Err(e)) => Err(e),
        (Ok(()), Ok(())) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mounts::FakeMounter;

    #[test]
    fn non_strict_hook_failure_is_ignored() {
        let runner = RecordingStageRunner::failing(&["before-install"]);
        hook(&runner, "before-install", Path::new("/r"), &[], false).unwrap();
        assert_eq!(runner.ran(), vec!["before-install"]);
    }

    #[test]
    fn strict_hook_failure_is_fatal_with_hook_exit_code() {
        let runner = RecordingStageRunner::failing(&["before-install"]);
        let err = hook(&runner, "before-install", Path::new("/r"), &[], true).unwrap_err();
        assert_eq!(err.exit_code(), 60);
        assert!(matches!(err, LifecycleError::HookFailed { .. }));
    }

    #[test]
    fn chroot_hook_binds_and_releases_in_reverse() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        let mounter = FakeMounter::new();
        let runner = RecordingStageRunner::new();

        let mut binds = BTreeMap::new();
        binds.insert(tmp.path().join("oem"), PathBuf::from("/oem"));
        binds.insert(tmp.path().join("persistent"), PathBuf::from("/usr/local"));

        chroot_hook(&runner, &mounter, "after-install-chroot", &root, &binds, &[], true).unwrap();

        let calls = mounter.calls();
        assert_eq!(calls.len(), 4);
        assert!(calls[0].starts_with("mount"));
        assert!(calls[3].starts_with("umount"));
        // Reverse order release.
        assert_eq!(calls[0].replace("mount", "umount"), calls[3]);
        assert_eq!(runner.ran(), vec!["after-install-chroot"]);
    }

    #[test]
    fn chroot_hook_releases_binds_when_hook_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        let mounter = FakeMounter::new();
        let runner = RecordingStageRunner::failing(&["after-reset-chroot"]);

        let mut binds = BTreeMap::new();
        binds.insert(tmp.path().join("oem"), PathBuf::from("/oem"));

        let err = chroot_hook(
            &runner, &mounter, "after-reset-chroot", &root, &binds, &[], true,
        )
        .unwrap_err();
        assert_eq!(err.exit_code(), 60);
        let umounts = mounter
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("umount"))
            .count();
        assert_eq!(umounts, 1);
    }
}
