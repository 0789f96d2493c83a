use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::{
    build::CLAP_LONG_VERSION,
    config::{Architecture, BuildConfig, ImageSize},
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[clap(long_version = CLAP_LONG_VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: BuildSubcommand,

    /// Path to the build config file. Default value is $XDG_CONFIG_HOME/simetrio/simetrio.toml, built-in defaults are used if it does not exist.
    #[clap(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level.
    #[clap(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(flatten)]
    pub overrides: ConfigOverrides,
}

#[derive(Subcommand, Debug)]
pub enum BuildSubcommand {
    /// Bootstrap a minimal root filesystem at the configured rootfs path.
    #[command(name = "bootstrap")]
    Bootstrap,

    /// Install packages into the root filesystem from inside a chroot.
    #[command(name = "customize")]
    Customize,

    /// Turn the root filesystem into a partitioned, bootable disk image.
    #[command(name = "image")]
    Image,

    /// Create the login account and refresh boot metadata in a root filesystem.
    #[command(name = "finalize")]
    Finalize(FinalizeOptions),

    /// Run every stage in order: bootstrap, customize, finalize, image, and sign when a key is given.
    #[command(name = "build")]
    Build(BuildOptions),

    /// Write a detached signature of a disk image.
    #[command(name = "sign")]
    Sign(SignOptions),

    /// Check a detached signature of a disk image.
    #[command(name = "verify")]
    Verify(VerifyOptions),

    /// Generate an Ed25519 key pair for signing images.
    #[command(name = "keygen")]
    Keygen(KeygenOptions),

    /// Show mounts and loop devices currently held for the configured rootfs and image.
    #[command(name = "status")]
    Status,

    /// Release mounts and loop devices left behind by an interrupted build.
    #[command(name = "teardown")]
    Teardown,

    /// Subcommands related to configuration.
    #[command(name = "config")]
    Config(ConfigOptions),
}

impl BuildSubcommand {
    /// Commands touching mounts, loop devices or chroots.
    pub fn needs_root(&self) -> bool {
        matches!(
            self,
            BuildSubcommand::Bootstrap
                | BuildSubcommand::Customize
                | BuildSubcommand::Image
                | BuildSubcommand::Finalize(_)
                | BuildSubcommand::Build(_)
                | BuildSubcommand::Teardown
        )
    }

    /// Commands that build with the config and so need a valid one.
    pub fn validates_config(&self) -> bool {
        matches!(
            self,
            BuildSubcommand::Bootstrap
                | BuildSubcommand::Customize
                | BuildSubcommand::Image
                | BuildSubcommand::Finalize(_)
                | BuildSubcommand::Build(_)
        )
    }
}

/// Settings given on the command line take precedence over the config file.
#[derive(Args, Debug, Default)]
pub struct ConfigOverrides {
    /// Target architecture.
    #[clap(long, global = true, value_enum)]
    pub arch: Option<Architecture>,

    /// Distribution suite, e.g. "bookworm".
    #[clap(long, global = true)]
    pub suite: Option<String>,

    /// Package mirror URL.
    #[clap(long, global = true)]
    pub mirror: Option<String>,

    /// Directory of the root filesystem.
    #[clap(long, global = true)]
    pub rootfs: Option<PathBuf>,

    /// Kernel package to install.
    #[clap(long, global = true)]
    pub kernel_package: Option<String>,

    /// Install the KDE Plasma desktop.
    #[clap(long, global = true, visible_alias = "with-kde")]
    pub with_desktop: bool,

    /// Install the Calamares installer.
    #[clap(long, global = true, visible_alias = "with-calamares")]
    pub with_installer: bool,

    /// Accept an existing rootfs directory instead of refusing to bootstrap.
    #[clap(long, global = true)]
    pub reuse_existing: bool,

    /// Path of the disk image.
    #[clap(long, global = true)]
    pub image: Option<PathBuf>,

    /// Size of the disk image, e.g. "4G".
    #[clap(long, global = true)]
    pub size: Option<ImageSize>,

    /// Name of the login account.
    #[clap(long, global = true)]
    pub username: Option<String>,
}

impl ConfigOverrides {
    pub fn apply(self, config: &mut BuildConfig) {
        if let Some(arch) = self.arch {
            config.arch = arch;
        }
        if let Some(suite) = self.suite {
            config.suite = suite;
        }
        if let Some(mirror) = self.mirror {
            config.mirror = mirror;
        }
        if let Some(rootfs) = self.rootfs {
            config.rootfs = rootfs;
        }
        if let Some(kernel_package) = self.kernel_package {
            config.kernel_package = Some(kernel_package);
        }
        config.install_desktop |= self.with_desktop;
        config.install_installer |= self.with_installer;
        config.reuse_existing |= self.reuse_existing;
        if let Some(image) = self.image {
            config.image.path = image;
        }
        if let Some(size) = self.size {
            config.image.size = size;
        }
        if let Some(username) = self.username {
            config.account.username = username;
        }
    }
}

#[derive(Parser, Debug)]
pub struct FinalizeOptions {
    /// Root filesystem to finalize instead of the configured rootfs.
    #[clap(long)]
    pub root: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct BuildOptions {
    /// Do not run the finalize stage.
    #[clap(long)]
    pub skip_finalize: bool,

    /// Sign the finished image with this private key.
    #[clap(long)]
    pub sign_key: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct SignOptions {
    /// Private key, PKCS#8 PEM or a raw 32-byte seed.
    #[clap(long, short = 'k')]
    pub key: PathBuf,

    /// Where to write the signature. Default value is the image path with ".sig" appended.
    #[clap(long, short = 'o')]
    pub output: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct VerifyOptions {
    /// Public key, SPKI PEM or 32 raw bytes.
    #[clap(long, short = 'k')]
    pub public_key: PathBuf,

    /// The signature to check. Default value is the image path with ".sig" appended.
    #[clap(long, short = 's')]
    pub signature: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct KeygenOptions {
    /// Where to write the private key.
    #[clap(long)]
    pub private_key: PathBuf,

    /// Where to write the public key.
    #[clap(long)]
    pub public_key: PathBuf,
}

#[derive(Debug, Args)]
#[command(args_conflicts_with_subcommands = true)]
pub struct ConfigOptions {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigSubcommand {
    /// Print a commented config file with the default values.
    #[command(name = "template")]
    Template,

    /// Print the effective config after applying the command line.
    #[command(name = "dump")]
    Dump,

    /// Check if the config is valid.
    #[command(name = "check")]
    Check,
}
