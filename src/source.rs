//! Image source resolution.
//!
//! A source URI (`docker:`, `dir:`, `file:`, `channel:`) is parsed into an
//! [`ImageSource`] once at the CLI boundary; `resolve()` then materializes
//! it into a destination tree and reports the content digest. Actual
//! registry byte transfer is delegated to skopeo/umoci as external
//! collaborators; this module never retries, retry policy belongs to the
//! orchestrators.

use std::fmt;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};

use crate::error::LifecycleError;
use crate::process::Cmd;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Container registry reference, e.g. `docker:registry.io/os/base:1.2`.
    Registry { reference: String },
    /// Local directory tree copied as-is.
    Dir(PathBuf),
    /// Local archive (`.tar`, `.tar.zst`) or squashfs image.
    File(PathBuf),
    /// Named release channel, expanded through the configured template.
    Channel(String),
}

impl FromStr for ImageSource {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(reference) = s.strip_prefix("docker:") {
            let reference = reference.trim_start_matches("//");
            if reference.is_empty() {
                return Err(LifecycleError::UnsupportedSourceType(s.to_string()));
            }
            return Ok(ImageSource::Registry {
                reference: reference.to_string(),
            });
        }
        if let Some(path) = s.strip_prefix("dir:") {
            return Ok(ImageSource::Dir(PathBuf::from(path)));
        }
        if let Some(path) = s.strip_prefix("file:") {
            return Ok(ImageSource::File(PathBuf::from(path)));
        }
        if let Some(name) = s.strip_prefix("channel:") {
            if name.is_empty() {
                return Err(LifecycleError::UnsupportedSourceType(s.to_string()));
            }
            return Ok(ImageSource::Channel(name.to_string()));
        }
        Err(LifecycleError::UnsupportedSourceType(s.to_string()))
    }
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Registry { reference } => write!(f, "docker:{reference}"),
            ImageSource::Dir(p) => write!(f, "dir:{}", p.display()),
            ImageSource::File(p) => write!(f, "file:{}", p.display()),
            ImageSource::Channel(n) => write!(f, "channel:{n}"),
        }
    }
}

/// Knobs shared by all resolver variants.
#[derive(Debug, Clone)]
pub struct ResolveOpts {
    /// Target platform filter for registry pulls, e.g. `linux/amd64`.
    pub platform: Option<String>,
    /// OCI layout cache; a cached reference skips the network entirely.
    pub cache_dir: PathBuf,
    /// `channel:<name>` expands through this template (`{}` is the name).
    pub channel_template: String,
}

impl Default for ResolveOpts {
    fn default() -> Self {
        let cache = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("/var/cache"))
            .join("slotkit/oci");
        Self {
            platform: None,
            cache_dir: cache,
            channel_template: "{}:latest".to_string(),
        }
    }
}

/// Materialize `source` into `dest` and return its content digest.
///
/// `dest` must be an existing empty directory; ownership of the produced
/// tree transfers to the caller, which either promotes it (rename) or
/// discards it.
pub fn resolve(
    source: &ImageSource,
    dest: &Path,
    opts: &ResolveOpts,
) -> Result<String, LifecycleError> {
    match source {
        ImageSource::Dir(path) => resolve_dir(path, dest),
        ImageSource::File(path) => resolve_file(path, dest),
        ImageSource::Registry { reference } => resolve_registry(reference, dest, opts),
        ImageSource::Channel(name) => {
            let reference = opts.channel_template.replace("{}", name);
            resolve_registry(&reference, dest, opts)
        }
    }
}

fn resolve_dir(path: &Path, dest: &Path) -> Result<String, LifecycleError> {
    if !path.is_dir() {
        return Err(LifecycleError::SourceNotFound(path.display().to_string()));
    }
    // -aHAX keeps ownership, hard links, ACLs and extended attributes, which
    // SELinux-labeled trees depend on.
    Cmd::new("rsync")
        .arg("-aHAX")
        .arg(&format!("{}/", path.display()))
        .arg(&format!("{}/", dest.display()))
        .error_msg("failed copying source tree")
        .run()
        .map_err(LifecycleError::ExtractFailed)?;
    crate::verify::tree_digest(dest).map_err(LifecycleError::ExtractFailed)
}

fn resolve_file(path: &Path, dest: &Path) -> Result<String, LifecycleError> {
    if !path.is_file() {
        return Err(LifecycleError::SourceNotFound(path.display().to_string()));
    }

    let digest = file_digest(path).map_err(LifecycleError::ExtractFailed)?;
    unpack_archive(path, dest).map_err(LifecycleError::ExtractFailed)?;
    Ok(digest)
}

fn unpack_archive(path: &Path, dest: &Path) -> Result<()> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    // Recovery images are deployed in this form; reset consumes them.
    if name.ends_with(".squashfs") {
        return Cmd::new("unsquashfs")
            .args(["-f", "-d"])
            .arg_path(dest)
            .arg_path(path)
            .error_msg("unsquashfs failed")
            .quiet()
            .run();
    }

    let file =
        fs::File::open(path).with_context(|| format!("opening archive '{}'", path.display()))?;
    let reader = BufReader::new(file);

    if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
        let decoder = zstd::stream::read::Decoder::new(reader).context("initializing zstd")?;
        let mut archive = tar::Archive::new(decoder);
        archive.set_preserve_permissions(true);
        archive.set_unpack_xattrs(true);
        archive
            .unpack(dest)
            .with_context(|| format!("unpacking '{}'", path.display()))
    } else if name.ends_with(".tar") {
        let mut archive = tar::Archive::new(reader);
        archive.set_preserve_permissions(true);
        archive.set_unpack_xattrs(true);
        archive
            .unpack(dest)
            .with_context(|| format!("unpacking '{}'", path.display()))
    } else {
        Err(anyhow!("unrecognized archive format '{name}'"))
    }
}

fn file_digest(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).context("hashing file")?;
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

fn resolve_registry(
    reference: &str,
    dest: &Path,
    opts: &ResolveOpts,
) -> Result<String, LifecycleError> {
    let cache = opts.cache_dir.join(sanitize_reference(reference));

    if !cache.join("index.json").exists() {
        pull_to_cache(reference, &cache, opts).map_err(LifecycleError::PullFailed)?;
    } else {
        println!("  Using cached image for {reference}");
    }

    unpack_oci(&cache, dest).map_err(LifecycleError::ExtractFailed)?;
    registry_digest(reference, &cache).map_err(LifecycleError::PullFailed)
}

fn pull_to_cache(reference: &str, cache: &Path, opts: &ResolveOpts) -> Result<()> {
    fs::create_dir_all(cache)
        .with_context(|| format!("creating cache dir '{}'", cache.display()))?;

    let mut cmd = Cmd::new("skopeo");
    if let Some(platform) = &opts.platform {
        let (os, arch) = platform.split_once('/').unwrap_or(("linux", platform));
        cmd = cmd
            .args(["--override-os", os])
            .args(["--override-arch", arch]);
    }
    cmd.arg("copy")
        .arg(&format!("docker://{reference}"))
        .arg(&format!("oci:{}:img", cache.display()))
        .error_msg("skopeo copy failed")
        .run()
}

fn unpack_oci(cache: &Path, dest: &Path) -> Result<()> {
    Cmd::new("umoci")
        .args(["raw", "unpack", "--rootless", "--image"])
        .arg(&format!("{}:img", cache.display()))
        .arg_path(dest)
        .error_msg("umoci unpack failed")
        .run()
}

fn registry_digest(reference: &str, cache: &Path) -> Result<String> {
    #[derive(serde::Deserialize)]
    struct Inspect {
        #[serde(rename = "Digest")]
        digest: String,
    }

    let out = Cmd::new("skopeo")
        .arg("inspect")
        .arg(&format!("oci:{}:img", cache.display()))
        .error_msg("skopeo inspect failed")
        .run_capture()?;
    let inspect: Inspect =
        serde_json::from_str(&out).with_context(|| format!("parsing inspect of '{reference}'"))?;
    Ok(inspect.digest)
}

fn sanitize_reference(reference: &str) -> String {
    reference
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}
