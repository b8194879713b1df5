//! Digest gate for staged trees.
//!
//! Before a staged tree is promoted into a bootable slot it can be checked
//! against an expected digest. Policy is explicit opt-in: `Disabled` by
//! default, `Warn` logs and proceeds, `Strict` refuses promotion.

use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::LifecycleError;
use crate::spec::{VerifyConfig, VerifyPolicy};

/// Deterministic sha256 over a directory tree.
///
/// Hashes relative paths, symlink targets, and regular file contents in
/// sorted walk order, so the same tree always produces the same digest on
/// any host.
pub fn tree_digest(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking '{}'", root.display()))?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path());
        if rel.as_os_str().is_empty() {
            continue;
        }
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);

        let ftype = entry.file_type();
        if ftype.is_symlink() {
            let target = fs::read_link(entry.path())
                .with_context(|| format!("reading link '{}'", entry.path().display()))?;
            hasher.update(b"l");
            hasher.update(target.to_string_lossy().as_bytes());
        } else if ftype.is_file() {
            hasher.update(b"f");
            let mut file = fs::File::open(entry.path())
                .with_context(|| format!("opening '{}'", entry.path().display()))?;
            loop {
                let n = file
                    .read(&mut buf)
                    .with_context(|| format!("reading '{}'", entry.path().display()))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        } else {
            hasher.update(b"d");
        }
        hasher.update([0u8]);
    }

    Ok(format!("sha256:{:x}", hasher.finalize()))
}

/// Validation-phase check: a strict policy with no expected digest can
/// never pass, so the action refuses before mutating anything.
pub fn precheck(config: &VerifyConfig) -> Result<(), LifecycleError> {
    if config.policy == VerifyPolicy::Strict && config.expected_digest.is_none() {
        return Err(LifecycleError::VerificationRequired);
    }
    Ok(())
}

/// Gate a staged tree against the configured policy.
///
/// `actual_digest` is the digest reported by the source resolver. For
/// registry sources that is the manifest digest; for everything else it is
/// content-derived.
pub fn check(config: &VerifyConfig, actual_digest: &str) -> Result<(), LifecycleError> {
    match config.policy {
        VerifyPolicy::Disabled => Ok(()),
        VerifyPolicy::Warn => {
            match &config.expected_digest {
                None => {
                    log::warn!("VERIFICATION SKIPPED: warn policy set but no expected digest configured");
                }
                Some(expected) if expected != actual_digest => {
                    log::warn!(
                        "VERIFICATION MISMATCH: expected {expected}, got {actual_digest}; proceeding under warn policy"
                    );
                }
                Some(_) => {}
            }
            Ok(())
        }
        VerifyPolicy::Strict => {
            let expected = config
                .expected_digest
                .as_ref()
                .ok_or(LifecycleError::VerificationRequired)?;
            if expected != actual_digest {
                return Err(LifecycleError::VerificationFailed {
                    expected: expected.clone(),
                    actual: actual_digest.to_string(),
                });
            }
            Ok(())
        }
    }
}
