//! Lifecycle toolkit for immutable A/B Linux systems.
//!
//! A system managed by this crate boots from read-only root trees kept as
//! numbered snapshots on a dedicated state partition. Every mutating
//! operation builds a complete new tree off to the side, commits it, and
//! only then flips the active slot; the previously active tree stays
//! behind as the fallback, and a separate recovery partition holds a
//! last-resort image for factory reset.
//!
//! # Layout
//!
//! - [`actions`] - the orchestrators: install, upgrade, reset, and the
//!   unprivileged disk/ISO image builds
//! - [`layout`] - partition planning and realization (sgdisk/mkfs)
//! - [`source`] - image source resolution (`docker:`, `dir:`, `file:`,
//!   `channel:`)
//! - [`snapshot`] - A/B snapshot transactions on the state partition
//! - [`state`] - the durable install state record and its locking
//! - [`bootloader`], [`mounts`], [`hooks`] - injected collaborators with
//!   real and in-memory implementations
//! - [`verify`] - digest gate for staged trees
//! - [`error`] - the failure taxonomy with stable exit codes
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::PathBuf;
//! use std::str::FromStr;
//!
//! use slotkit::actions::{install, Collaborators};
//! use slotkit::bootloader::Grub;
//! use slotkit::hooks::CommandStageRunner;
//! use slotkit::mounts::LinuxMounter;
//! use slotkit::source::{ImageSource, ResolveOpts};
//! use slotkit::spec::{default_layout, Firmware, InstallSpec, PowerAction, VerifyConfig};
//!
//! # fn main() -> Result<(), slotkit::error::LifecycleError> {
//! let spec = InstallSpec {
//!     target: PathBuf::from("/dev/sda"),
//!     source: ImageSource::from_str("docker:registry.example.com/os/base:42.1")?,
//!     partitions: default_layout(),
//!     firmware: Firmware::Efi,
//!     no_format: false,
//!     force: false,
//!     verify: VerifyConfig::default(),
//!     cloud_init: None,
//!     cloud_init_paths: vec![],
//!     strict_hooks: false,
//!     power: PowerAction::Reboot,
//! };
//! let collab = Collaborators {
//!     mounter: &LinuxMounter,
//!     bootloader: &Grub::new(),
//!     stage_runner: &CommandStageRunner::new("cloud-init"),
//!     resolve: ResolveOpts::default(),
//! };
//! install::run(&spec, &collab)?;
//! # Ok(())
//! # }
//! ```

pub mod actions;
pub mod bootloader;
pub mod error;
pub mod hooks;
pub mod interrupt;
pub mod layout;
pub mod mounts;
pub mod preflight;
pub mod process;
pub mod snapshot;
pub mod source;
pub mod spec;
pub mod state;
pub mod verify;

pub use error::{LifecycleError, LifecycleResult};
