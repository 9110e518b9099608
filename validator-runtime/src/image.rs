//! Hardware-isolated image preparation.
//!
//! Base images are checked against an explicit compatibility table before
//! the external build/sign tool is invoked. The tool contract is fixed:
//!
//! ```text
//! <tool> build <image> <manifest> -c <config>
//! <tool> sign-image <image> -c <config>
//! ```
//!
//! and a successful run yields the signed image `gsc-<image>`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{Result, SandboxError};

/// Prefix the build tool gives every signed image.
pub const SIGNED_IMAGE_PREFIX: &str = "gsc-";

/// Distribution metadata of a base image, e.g. from its `/etc/os-release`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub distro: String,
    pub version: String,
}

impl ImageMetadata {
    pub fn new(distro: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            distro: distro.into(),
            version: version.into(),
        }
    }
}

/// Build profiles the enclave tooling supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupportedProfile {
    Ubuntu2004,
    Ubuntu2204,
    Debian11,
    Debian12,
}

const COMPATIBILITY: &[(&str, &str, SupportedProfile)] = &[
    ("ubuntu", "20.04", SupportedProfile::Ubuntu2004),
    ("ubuntu", "22.04", SupportedProfile::Ubuntu2204),
    ("debian", "11", SupportedProfile::Debian11),
    ("debian", "12", SupportedProfile::Debian12),
];

impl SupportedProfile {
    /// Resolve metadata through the compatibility table. Distro names are
    /// matched case-insensitively; versions must match exactly.
    pub fn resolve(metadata: &ImageMetadata) -> Result<Self> {
        let distro = metadata.distro.trim();
        let version = metadata.version.trim();
        COMPATIBILITY
            .iter()
            .find(|(d, v, _)| d.eq_ignore_ascii_case(distro) && *v == version)
            .map(|(_, _, profile)| *profile)
            .ok_or_else(|| {
                SandboxError::UnsupportedProfile(format!(
                    "{distro} {version} is not a supported base image"
                ))
            })
    }

    /// Base distribution tag as the build tool expects it in its config.
    pub fn distro_tag(self) -> &'static str {
        match self {
            SupportedProfile::Ubuntu2004 => "ubuntu:20.04",
            SupportedProfile::Ubuntu2204 => "ubuntu:22.04",
            SupportedProfile::Debian11 => "debian:11",
            SupportedProfile::Debian12 => "debian:12",
        }
    }
}

impl fmt::Display for SupportedProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.distro_tag())
    }
}

pub fn signed_image_name(image: &str) -> String {
    format!("{SIGNED_IMAGE_PREFIX}{image}")
}

/// Files handed to the build tool alongside the image name.
#[derive(Clone, Debug)]
pub struct BuildInputs {
    pub manifest: PathBuf,
    pub config: PathBuf,
}

pub struct ImageBuilder {
    tool: PathBuf,
}

impl ImageBuilder {
    pub fn new(tool: impl Into<PathBuf>) -> Self {
        Self { tool: tool.into() }
    }

    /// Build and sign `image`, returning the signed image name.
    pub async fn build_signed(
        &self,
        image: &str,
        metadata: &ImageMetadata,
        inputs: &BuildInputs,
    ) -> Result<String> {
        if image.trim().is_empty() {
            return Err(SandboxError::Validation("image name must not be empty".into()));
        }
        let profile = SupportedProfile::resolve(metadata)?;
        info!("image: building {image} for profile {profile}");

        let config = path_arg(&inputs.config)?;
        self.run(&["build", image, path_arg(&inputs.manifest)?, "-c", config])
            .await?;
        self.run(&["sign-image", image, "-c", config]).await?;

        let signed = signed_image_name(image);
        info!("image: signed {signed}");
        Ok(signed)
    }

    async fn run(&self, args: &[&str]) -> Result<()> {
        let step = args.first().copied().unwrap_or_default();
        let output = Command::new(&self.tool)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| {
                SandboxError::ImageBuild(format!(
                    "failed to run {} {step}: {err}",
                    self.tool.display()
                ))
            })?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(
            "image: {} {step} exited with {}: {}",
            self.tool.display(),
            output.status,
            stderr.trim()
        );
        Err(SandboxError::ImageBuild(format!(
            "{step} exited with {}: {}",
            output.status,
            stderr.trim()
        )))
    }
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| {
        SandboxError::Validation(format!("non-UTF-8 path: {}", path.display()))
    })
}
