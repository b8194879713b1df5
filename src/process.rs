//! Subprocess runner used by every module that shells out.
//!
//! All external tools (sgdisk, mkfs.*, mount, mksquashfs, xorriso, skopeo,
//! rsync...) are invoked through [`Cmd`] so failures carry the command line,
//! a caller-supplied hint, and the tool's stderr.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process::Command;

/// Builder around `std::process::Command` with uniform error reporting.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    error_msg: Option<String>,
    quiet: bool,
}

impl Cmd {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            error_msg: None,
            quiet: false,
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for a in args {
            self.args.push(a.as_ref().to_string());
        }
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.display().to_string());
        self
    }

    /// Hint prepended to the failure report, e.g. "mkfs.vfat failed".
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// Suppress the tool's stdout/stderr passthrough on success.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for a in &self.args {
            line.push(' ');
            line.push_str(a);
        }
        line
    }

    /// Run the command, discarding output on success.
    pub fn run(self) -> Result<()> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .with_context(|| format!("spawning '{}'", self.command_line()))?;

        if output.status.success() {
            if !self.quiet && !output.stdout.is_empty() {
                log::debug!("{}: {}", self.program, String::from_utf8_lossy(&output.stdout).trim());
            }
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let hint = self.error_msg.as_deref().unwrap_or("command failed");
        bail!(
            "{}: '{}' exited with {}\n{}\n{}",
            hint,
            self.command_line(),
            output.status,
            stdout.trim(),
            stderr.trim()
        )
    }

    /// Run the command and return trimmed stdout.
    pub fn run_capture(self) -> Result<String> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .with_context(|| format!("spawning '{}'", self.command_line()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let hint = self.error_msg.as_deref().unwrap_or("command failed");
            bail!(
                "{}: '{}' exited with {}\n{}",
                hint,
                self.command_line(),
                output.status,
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
