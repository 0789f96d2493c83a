//! Everything the pipeline asks of the machine it runs on.
//!
//! Stages never spawn processes or touch the mount table directly, they go through a [`Host`].
//! [`system::SystemHost`] is the real implementation; tests use an in-memory fake that keeps its
//! own mount and loop tables so teardown can be checked after every injected failure.

#[cfg(test)]
pub mod fake;
pub mod system;

use std::{
    ffi::OsString,
    fmt::Display,
    path::{Path, PathBuf},
};

use anyhow::Result;
use async_trait::async_trait;

use crate::config::Architecture;

#[async_trait]
pub trait Host: Send + Sync {
    /// Architecture of the running machine, `None` if it is not one we can build for.
    fn host_arch(&self) -> Option<Architecture>;

    fn find_program(&self, name: &str) -> Option<PathBuf>;

    /// The name-resolution config copied into trees before running commands in them.
    fn resolver_config(&self) -> PathBuf {
        PathBuf::from("/etc/resolv.conf")
    }

    fn device_exists(&self, device: &Path) -> bool;

    /// Run a command on the host, or inside a root when [`Invocation::root`] is set. Returns stdout.
    async fn run(&self, invocation: &Invocation) -> Result<Vec<u8>>;

    async fn mount(&self, request: &MountRequest) -> Result<()>;

    async fn umount(&self, target: &Path) -> Result<()>;

    /// Attach a file to a free loop device with partition scanning enabled.
    async fn attach_loop(&self, image: &Path) -> Result<PathBuf>;

    async fn detach_loop(&self, device: &Path) -> Result<()>;

    /// Loop devices currently backed by `image`.
    async fn loops_backing(&self, image: &Path) -> Result<Vec<PathBuf>>;

    /// Every entry of the mount table, in mount order.
    async fn mount_table(&self) -> Result<Vec<MountEntry>>;
}

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub target: PathBuf,
    /// The mounted device, or the filesystem name for virtual filesystems.
    pub source: String,
}

/// A command line to run on the host or inside a root filesystem.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<OsString>,
    pub root: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            root: None,
            envs: vec![],
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Run the command chrooted into `root`.
    pub fn in_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

impl Display for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(root) = &self.root {
            write!(f, "[chroot {}] ", root.display())?;
        }
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// `mount --bind <source> <target>`
    Bind,
    /// A kernel virtual filesystem such as proc or sysfs, no source device.
    Virtual { fstype: &'static str },
    /// A block device holding a filesystem.
    Device { fstype: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MountRequest {
    pub source: PathBuf,
    pub target: PathBuf,
    pub kind: MountKind,
}

impl MountRequest {
    pub fn bind(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind: MountKind::Bind,
        }
    }

    pub fn virtual_fs(fstype: &'static str, target: impl Into<PathBuf>) -> Self {
        Self {
            source: fstype.into(),
            target: target.into(),
            kind: MountKind::Virtual { fstype },
        }
    }

    pub fn device(
        device: impl Into<PathBuf>,
        fstype: &'static str,
        target: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source: device.into(),
            target: target.into(),
            kind: MountKind::Device { fstype },
        }
    }
}

/// Check that every program in `programs` is available, naming all the missing ones at once.
pub fn require_programs(host: &dyn Host, programs: &[&str]) -> Result<()> {
    let missing = programs
        .iter()
        .filter(|program| host.find_program(program).is_none())
        .map(|program| program.to_string())
        .collect::<Vec<_>>();

    if !missing.is_empty() {
        return Err(crate::error::BuildError::MissingDependency(missing).into());
    }
    Ok(())
}
