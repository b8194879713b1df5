use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use slotkit::actions::{self, Collaborators};
use slotkit::bootloader::{Bootloader, Grub, MemoryBootloader};
use slotkit::error::LifecycleError;
use slotkit::hooks::CommandStageRunner;
use slotkit::interrupt;
use slotkit::mounts::{FakeMounter, LinuxMounter, Mounter};
use slotkit::source::{ImageSource, ResolveOpts};
use slotkit::spec::{
    default_layout, DiskSpec, Firmware, InstallSpec, IsoSpec, PowerAction, ResetSpec,
    UpgradeSpec, VerifyConfig, VerifyPolicy,
};
use slotkit::state;

const CONFIG_FILE: &str = "/etc/slotkit.toml";

#[derive(Parser)]
#[command(
    name = "slotkit",
    version,
    about = "Lifecycle manager for immutable A/B Linux systems"
)]
struct Cli {
    /// Config file with defaults for repeated flags.
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install an image source onto a block device or directory target.
    Install(InstallArgs),
    /// Upgrade the running system into a new snapshot.
    Upgrade(UpgradeArgs),
    /// Factory-reset the state partition from the recovery image.
    Reset(ResetArgs),
    /// Build a bootable raw disk image, no root required.
    BuildDisk(BuildDiskArgs),
    /// Build a bootable live ISO.
    BuildIso(BuildIsoArgs),
    /// Show the install state record of a system.
    State(StateArgs),
}

#[derive(Args)]
struct SourceArgs {
    /// Image source: docker:REF, dir:PATH, file:PATH or channel:NAME.
    #[arg(long)]
    source: String,

    /// Verification policy: disabled, warn or strict.
    #[arg(long, default_value = "disabled")]
    verify: String,

    /// Expected sha256 digest of the source.
    #[arg(long)]
    expected_digest: Option<String>,
}

impl SourceArgs {
    fn source(&self) -> Result<ImageSource, LifecycleError> {
        ImageSource::from_str(&self.source)
    }

    fn verify(&self) -> Result<VerifyConfig> {
        parse_verify(&self.verify, self.expected_digest.clone())
    }
}

fn parse_verify(policy: &str, expected_digest: Option<String>) -> Result<VerifyConfig> {
    let policy = match policy {
        "disabled" => VerifyPolicy::Disabled,
        "warn" => VerifyPolicy::Warn,
        "strict" => VerifyPolicy::Strict,
        other => anyhow::bail!("unknown verify policy '{other}' (disabled|warn|strict)"),
    };
    Ok(VerifyConfig {
        policy,
        expected_digest,
    })
}

#[derive(Args)]
struct HookArgs {
    /// Abort the action when a hook stage fails.
    #[arg(long)]
    strict_hooks: bool,

    /// Extra paths handed to the stage runner.
    #[arg(long = "hook-path")]
    hook_paths: Vec<PathBuf>,
}

#[derive(Args)]
struct PowerArgs {
    /// Reboot when the action completes.
    #[arg(long, conflicts_with = "poweroff")]
    reboot: bool,

    /// Power off when the action completes.
    #[arg(long)]
    poweroff: bool,
}

impl PowerArgs {
    fn power(&self) -> PowerAction {
        if self.reboot {
            PowerAction::Reboot
        } else if self.poweroff {
            PowerAction::PowerOff
        } else {
            PowerAction::None
        }
    }
}

#[derive(Args)]
struct InstallArgs {
    /// Block device (/dev/sda) or directory target.
    target: PathBuf,

    #[command(flatten)]
    source: SourceArgs,

    /// Reuse existing partitions instead of repartitioning.
    #[arg(long)]
    no_format: bool,

    /// Install over an existing installation.
    #[arg(long)]
    force: bool,

    /// Cloud-init config file copied to the config partition.
    #[arg(long)]
    cloud_init: Option<PathBuf>,

    /// Firmware type: efi or bios.
    #[arg(long, default_value = "efi")]
    firmware: String,

    #[command(flatten)]
    hooks: HookArgs,

    #[command(flatten)]
    power: PowerArgs,
}

#[derive(Args)]
struct MountArgs {
    #[arg(long, default_value = "/run/slotkit/state")]
    state_mount: PathBuf,

    #[arg(long, default_value = "/run/slotkit/recovery")]
    recovery_mount: PathBuf,

    #[arg(long, default_value = "/run/slotkit/efi")]
    efi_mount: PathBuf,
}

#[derive(Args)]
struct UpgradeArgs {
    #[command(flatten)]
    source: SourceArgs,

    #[command(flatten)]
    mounts: MountArgs,

    #[arg(long, default_value = "/run/slotkit/oem")]
    oem_mount: PathBuf,

    #[arg(long, default_value = "/run/slotkit/persistent")]
    persistent_mount: PathBuf,

    /// Also refresh the recovery image from the new tree.
    #[arg(long)]
    recovery: bool,

    /// Reinstall the bootloader payload from the new tree.
    #[arg(long)]
    bootloader: bool,

    #[command(flatten)]
    hooks: HookArgs,

    #[command(flatten)]
    power: PowerArgs,
}

#[derive(Args)]
struct ResetArgs {
    /// Image source; defaults to the deployed recovery tree.
    #[arg(long)]
    source: Option<String>,

    #[command(flatten)]
    mounts: MountArgs,

    #[arg(long, default_value = "/run/slotkit/oem")]
    oem_mount: PathBuf,

    #[arg(long, default_value = "/run/slotkit/persistent")]
    persistent_mount: PathBuf,

    /// Also wipe the persistent partition.
    #[arg(long)]
    reset_persistent: bool,

    /// Also wipe the config partition.
    #[arg(long)]
    reset_oem: bool,

    /// Verification policy: disabled, warn or strict.
    #[arg(long, default_value = "disabled")]
    verify: String,

    /// Expected sha256 digest of the source.
    #[arg(long)]
    expected_digest: Option<String>,

    /// Cloud-init config file copied to the config partition.
    #[arg(long)]
    cloud_init: Option<PathBuf>,

    #[command(flatten)]
    hooks: HookArgs,

    #[command(flatten)]
    power: PowerArgs,
}

#[derive(Args)]
struct BuildDiskArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// Output image path.
    #[arg(long, default_value = "slotkit-disk.img")]
    output: PathBuf,

    /// Total image size in MiB.
    #[arg(long, default_value_t = 32768)]
    size: u64,

    /// Scratch directory for intermediate trees and partition images.
    #[arg(long, default_value = "slotkit-work")]
    work_dir: PathBuf,

    #[command(flatten)]
    hooks: HookArgs,
}

#[derive(Args)]
struct BuildIsoArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// Output ISO path.
    #[arg(long, default_value = "slotkit.iso")]
    output: PathBuf,

    /// ISO volume label.
    #[arg(long, default_value = "SLOTKIT")]
    label: String,

    /// Scratch directory for intermediate trees.
    #[arg(long, default_value = "slotkit-work")]
    work_dir: PathBuf,

    #[command(flatten)]
    hooks: HookArgs,
}

#[derive(Args)]
struct StateArgs {
    /// Mount point of the state partition.
    #[arg(long, default_value = "/run/slotkit/state")]
    state_mount: PathBuf,
}

/// Optional defaults from `/etc/slotkit.toml`. Flags always win.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    /// Stage runner binary for hook execution.
    stage_runner: Option<String>,
    /// Platform filter for registry pulls, e.g. `linux/amd64`.
    platform: Option<String>,
    /// OCI layout cache directory.
    cache_dir: Option<PathBuf>,
    /// Template expanding `channel:<name>` sources (`{}` is the name).
    channel_template: Option<String>,
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading '{}'", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing '{}'", path.display()))
    }

    fn resolve_opts(&self) -> ResolveOpts {
        let mut opts = ResolveOpts::default();
        if let Some(platform) = &self.platform {
            opts.platform = Some(platform.clone());
        }
        if let Some(cache_dir) = &self.cache_dir {
            opts.cache_dir = cache_dir.clone();
        }
        if let Some(template) = &self.channel_template {
            opts.channel_template = template.clone();
        }
        opts
    }

    fn stage_runner(&self) -> CommandStageRunner {
        CommandStageRunner::new(self.stage_runner.as_deref().unwrap_or("cloud-init"))
    }
}

fn parse_firmware(value: &str) -> Result<Firmware> {
    match value {
        "efi" => Ok(Firmware::Efi),
        "bios" => Ok(Firmware::Bios),
        other => anyhow::bail!("unknown firmware type '{other}' (efi|bios)"),
    }
}

fn require_root(what: &str) -> Result<(), LifecycleError> {
    if !slotkit::preflight::is_root() {
        return Err(anyhow::anyhow!("{what} requires root privileges").into());
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    interrupt::install_handlers();

    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            let mut source = std::error::Error::source(&e);
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = cause.source();
            }
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn dispatch(cli: Cli) -> Result<(), LifecycleError> {
    let config = FileConfig::load(&cli.config)?;
    let resolve = config.resolve_opts();
    let stage_runner = config.stage_runner();

    match cli.command {
        Commands::Install(args) => {
            let spec = InstallSpec {
                target: args.target.clone(),
                source: args.source.source()?,
                partitions: default_layout(),
                firmware: parse_firmware(&args.firmware)?,
                no_format: args.no_format,
                force: args.force,
                verify: args.source.verify()?,
                cloud_init: args.cloud_init,
                cloud_init_paths: args.hooks.hook_paths,
                strict_hooks: args.hooks.strict_hooks,
                power: args.power.power(),
            };
            // Directory targets run entirely unprivileged: no kernel
            // mounts, no bootloader tooling.
            let dir_mode = spec.target.is_dir();
            if !dir_mode {
                require_root("install to a block device")?;
                slotkit::preflight::check_required_tools(slotkit::preflight::INSTALL_TOOLS)?;
            }
            let fake_mounter = FakeMounter::new();
            let memory_boot = MemoryBootloader::new();
            let grub = Grub::new();
            let mounter: &dyn Mounter = if dir_mode { &fake_mounter } else { &LinuxMounter };
            let bootloader: &dyn Bootloader = if dir_mode { &memory_boot } else { &grub };
            actions::install::run(
                &spec,
                &Collaborators {
                    mounter,
                    bootloader,
                    stage_runner: &stage_runner,
                    resolve,
                },
            )
        }
        Commands::Upgrade(args) => {
            let spec = UpgradeSpec {
                state_mount: args.mounts.state_mount,
                recovery_mount: args.mounts.recovery_mount,
                efi_mount: args.mounts.efi_mount,
                oem_mount: Some(args.oem_mount),
                persistent_mount: Some(args.persistent_mount),
                source: args.source.source()?,
                recovery_upgrade: args.recovery,
                bootloader_upgrade: args.bootloader,
                verify: args.source.verify()?,
                cloud_init_paths: args.hooks.hook_paths,
                strict_hooks: args.hooks.strict_hooks,
                power: args.power.power(),
            };
            require_root("upgrade")?;
            actions::upgrade::run(
                &spec,
                &Collaborators {
                    mounter: &LinuxMounter,
                    bootloader: &Grub::new(),
                    stage_runner: &stage_runner,
                    resolve,
                },
            )
        }
        Commands::Reset(args) => {
            let source = match &args.source {
                Some(uri) => ImageSource::from_str(uri)?,
                None => actions::default_reset_source(&args.mounts.recovery_mount),
            };
            let verify = parse_verify(&args.verify, args.expected_digest)?;
            let spec = ResetSpec {
                state_mount: args.mounts.state_mount,
                recovery_mount: args.mounts.recovery_mount,
                efi_mount: args.mounts.efi_mount,
                oem_mount: Some(args.oem_mount),
                persistent_mount: Some(args.persistent_mount),
                source,
                reset_persistent: args.reset_persistent,
                reset_oem: args.reset_oem,
                verify,
                cloud_init: args.cloud_init,
                cloud_init_paths: args.hooks.hook_paths,
                strict_hooks: args.hooks.strict_hooks,
                power: args.power.power(),
            };
            require_root("reset")?;
            slotkit::preflight::check_required_tools(slotkit::preflight::RESET_TOOLS)?;
            actions::reset::run(
                &spec,
                &Collaborators {
                    mounter: &LinuxMounter,
                    bootloader: &Grub::new(),
                    stage_runner: &stage_runner,
                    resolve,
                },
                actions::booted_from_recovery(),
            )
        }
        Commands::BuildDisk(args) => {
            let spec = DiskSpec {
                source: args.source.source()?,
                output: args.output,
                work_dir: args.work_dir,
                partitions: default_layout(),
                disk_size_mib: args.size,
                verify: args.source.verify()?,
                cloud_init_paths: args.hooks.hook_paths,
                strict_hooks: args.hooks.strict_hooks,
            };
            actions::build_disk::run(
                &spec,
                &Collaborators {
                    mounter: &FakeMounter::new(),
                    bootloader: &Grub::new(),
                    stage_runner: &stage_runner,
                    resolve,
                },
            )
        }
        Commands::BuildIso(args) => {
            let spec = IsoSpec {
                source: args.source.source()?,
                output: args.output,
                work_dir: args.work_dir,
                volume_label: args.label,
                verify: args.source.verify()?,
                cloud_init_paths: args.hooks.hook_paths,
                strict_hooks: args.hooks.strict_hooks,
            };
            actions::build_iso::run(
                &spec,
                &Collaborators {
                    mounter: &FakeMounter::new(),
                    bootloader: &Grub::new(),
                    stage_runner: &stage_runner,
                    resolve,
                },
            )
        }
        Commands::State(args) => show_state(&args.state_mount),
    }
}

fn show_state(state_mount: &Path) -> Result<(), LifecycleError> {
    match state::load(state_mount)? {
        None => {
            println!("no install state found under '{}'", state_mount.display());
            Ok(())
        }
        Some(st) => {
            let yaml = serde_yaml::to_string(&st)
                .context("serializing install state")
                .map_err(LifecycleError::Other)?;
            print!("{yaml}");
            Ok(())
        }
    }
}
