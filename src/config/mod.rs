pub mod check;
pub mod source;
pub mod template;

use std::{fmt::Display, path::PathBuf, str::FromStr};

use anyhow::{bail, Context as _, Result};
use documented::{Documented, DocumentedFields};
use serde::{Deserialize, Serialize};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;

/// Settings of one image build.
///
/// All stages read from the same value, it is never changed once a stage has started.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Documented, DocumentedFields)]
#[serde(deny_unknown_fields, default)]
pub struct BuildConfig {
    /// Target CPU architecture of the image, either "amd64" or "arm64". When it differs from the host, the bootstrap runs in two stages through a qemu user-mode emulator.
    pub arch: Architecture,

    /// Distribution suite handed to debootstrap, e.g. "bookworm".
    pub suite: String,

    /// Package source used by debootstrap and later by apt inside the tree.
    pub mirror: String,

    /// Directory the root filesystem is bootstrapped into. It must not exist yet unless `reuse_existing` is set.
    pub rootfs: PathBuf,

    /// Kernel package installed into the tree. Defaults to "linux-image-<arch>".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel_package: Option<String>,

    /// Install the KDE Plasma desktop together with the SDDM display manager.
    pub install_desktop: bool,

    /// Install the Calamares graphical installer. Failures are only reported as warnings.
    pub install_installer: bool,

    /// Accept an already existing rootfs directory instead of refusing to bootstrap over it.
    pub reuse_existing: bool,

    /// Settings of the produced disk image.
    pub image: ImageConfig,

    /// Default login account created by the finalize stage.
    pub account: AccountConfig,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            arch: Architecture::Amd64,
            suite: "bookworm".into(),
            mirror: "http://deb.debian.org/debian".into(),
            rootfs: "/var/lib/simetrio/rootfs".into(),
            kernel_package: None,
            install_desktop: false,
            install_installer: false,
            reuse_existing: false,
            image: ImageConfig::default(),
            account: AccountConfig::default(),
        }
    }
}

impl BuildConfig {
    pub fn kernel_package(&self) -> String {
        self.kernel_package
            .clone()
            .unwrap_or_else(|| self.arch.kernel_package().to_owned())
    }
}

/// Disk image settings.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Documented, DocumentedFields)]
#[serde(deny_unknown_fields, default)]
pub struct ImageConfig {
    /// Path of the raw disk image. An existing file at this path is overwritten.
    pub path: PathBuf,

    /// Size of the disk image, e.g. "4G" or "512M". Suffixes are powers of 1024.
    pub size: ImageSize,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            path: "/var/lib/simetrio/output/debian-smoke.img".into(),
            size: ImageSize(4 * GIB),
        }
    }
}

/// The login account created when finalizing a tree.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Documented, DocumentedFields)]
#[serde(deny_unknown_fields, default)]
pub struct AccountConfig {
    /// Name of the login account. It is added to the "sudo" group.
    pub username: String,

    /// Initial password of the account. It is only set when the account is created and is NOT secret, change it after the first boot.
    pub password: String,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            username: "stralyx".into(),
            password: "stralyx".into(),
        }
    }
}

#[derive(
    Serialize,
    Deserialize,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Clone,
    Copy,
    strum::Display,
    strum::EnumString,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Architecture {
    Amd64,
    Arm64,
}

impl Architecture {
    /// The architecture of the machine we are running on, if it is one we can build for.
    pub fn from_host() -> Option<Self> {
        match std::env::consts::ARCH {
            "x86_64" => Some(Architecture::Amd64),
            "aarch64" => Some(Architecture::Arm64),
            _ => None,
        }
    }

    /// Name of the qemu user-mode binary able to run code of this architecture.
    pub fn emulator_binary(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "qemu-x86_64-static",
            Architecture::Arm64 => "qemu-aarch64-static",
        }
    }

    pub fn kernel_package(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "linux-image-amd64",
            Architecture::Arm64 => "linux-image-arm64",
        }
    }

    pub fn bootloader_packages(&self) -> &'static [&'static str] {
        match self {
            Architecture::Amd64 => &["grub-pc"],
            Architecture::Arm64 => &["grub-efi-arm64"],
        }
    }

    /// Arguments of `grub-install` besides the boot directory and the target device.
    pub fn grub_install_args(&self) -> &'static [&'static str] {
        match self {
            Architecture::Amd64 => &["--target=i386-pc"],
            Architecture::Arm64 => &[
                "--target=arm64-efi",
                "--removable",
                "--no-nvram",
            ],
        }
    }
}

/// Size of a disk image in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageSize(u64);

impl ImageSize {
    pub const MIN: ImageSize = ImageSize(64 * MIB);

    pub fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> u64 {
        self.0
    }
}

impl FromStr for ImageSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len());
        let (number, unit) = s.split_at(split);
        if number.is_empty() {
            bail!("Invalid size {s:?}, expected a number with an optional K/M/G/T suffix");
        }
        let number: u64 = number
            .parse()
            .with_context(|| format!("Invalid size {s:?}"))?;

        let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
            "" | "B" => 1,
            "K" | "KB" | "KIB" => KIB,
            "M" | "MB" | "MIB" => MIB,
            "G" | "GB" | "GIB" => GIB,
            "T" | "TB" | "TIB" => TIB,
            other => bail!("Unknown size unit {other:?} in {s:?}"),
        };

        number
            .checked_mul(multiplier)
            .map(ImageSize)
            .with_context(|| format!("Size {s:?} is too large"))
    }
}

impl TryFrom<String> for ImageSize {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ImageSize> for String {
    fn from(value: ImageSize) -> Self {
        value.to_string()
    }
}

impl Display for ImageSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (unit, suffix) in [(TIB, "T"), (GIB, "G"), (MIB, "M"), (KIB, "K")] {
            if self.0 >= unit && self.0 % unit == 0 {
                return write!(f, "{}{suffix}", self.0 / unit);
            }
        }
        write!(f, "{}", self.0)
    }
}
