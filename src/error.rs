//! Error taxonomy for lifecycle actions.
//!
//! Each variant maps to a stable non-zero process exit code so callers and
//! provisioning automation can key off the failure class rather than parse
//! messages. Validation-class errors are raised before any mutating
//! operation; mutating-phase errors leave the previously active slot
//! untouched.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid partition layout: {0}")]
    InvalidLayout(String),

    #[error("image source not found: {0}")]
    SourceNotFound(String),

    #[error("unsupported image source: {0}")]
    UnsupportedSourceType(String),

    #[error("failed pulling image source: {0:#}")]
    PullFailed(#[source] anyhow::Error),

    #[error("failed extracting image source: {0:#}")]
    ExtractFailed(#[source] anyhow::Error),

    #[error("strict verification requested but no expected digest configured")]
    VerificationRequired,

    #[error("digest verification failed: expected {expected}, got {actual}")]
    VerificationFailed { expected: String, actual: String },

    #[error("target already contains an installation (use --force to overwrite)")]
    AlreadyInstalled,

    #[error("reset requires the system to be booted from the recovery image")]
    NotBootedFromRecovery,

    #[error("failed mounting partitions: {0:#}")]
    MountFailed(#[source] anyhow::Error),

    #[error("failed unmounting on cleanup:\n{0}")]
    UnmountFailed(String),

    #[error("hook '{stage}' failed: {source:#}")]
    HookFailed {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed persisting install state: {0:#}")]
    StatePersistFailed(#[source] anyhow::Error),

    #[error("failed updating bootloader: {0:#}")]
    BootloaderUpdateFailed(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LifecycleError {
    /// Stable process exit code for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            LifecycleError::InvalidLayout(_) => 10,
            LifecycleError::SourceNotFound(_) => 20,
            LifecycleError::UnsupportedSourceType(_) => 21,
            LifecycleError::PullFailed(_) => 22,
            LifecycleError::ExtractFailed(_) => 23,
            LifecycleError::VerificationRequired => 30,
            LifecycleError::VerificationFailed { .. } => 31,
            LifecycleError::AlreadyInstalled => 40,
            LifecycleError::NotBootedFromRecovery => 41,
            LifecycleError::MountFailed(_) => 50,
            LifecycleError::UnmountFailed(_) => 51,
            LifecycleError::HookFailed { .. } => 60,
            LifecycleError::StatePersistFailed(_) => 70,
            LifecycleError::BootloaderUpdateFailed(_) => 71,
            LifecycleError::Other(_) => 255,
        }
    }
}

pub type LifecycleResult<T> = std::result::Result<T, LifecycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_stable_and_distinct() {
        let errs = vec![
            LifecycleError::InvalidLayout("x".into()),
            LifecycleError::SourceNotFound("x".into()),
            LifecycleError::UnsupportedSourceType("x".into()),
            LifecycleError::VerificationRequired,
            LifecycleError::AlreadyInstalled,
            LifecycleError::NotBootedFromRecovery,
            LifecycleError::UnmountFailed("x".into()),
        ];
        let mut codes: Vec<i32> = errs.iter().map(|e| e.exit_code()).collect();
        assert_eq!(codes, vec![10, 20, 21, 30, 40, 41, 51]);
        codes.dedup();
        assert_eq!(codes.len(), 7);
    }

    #[test]
    fn anyhow_errors_map_to_unknown() {
        let e: LifecycleError = anyhow::anyhow!("boom").into();
        assert_eq!(e.exit_code(), 255);
    }
}
