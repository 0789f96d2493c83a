use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use again::RetryPolicy;
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use loopdev::{LoopControl, LoopDevice};
use nix::mount::{MntFlags, MsFlags};
use tokio::process::Command;

use crate::{config::Architecture, fs::cmd::RunCommand as _};

use super::{Host, Invocation, MountEntry, MountKind, MountRequest};

/// The machine we are running on.
#[derive(Debug, Default)]
pub struct SystemHost;

impl SystemHost {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Host for SystemHost {
    fn host_arch(&self) -> Option<Architecture> {
        Architecture::from_host()
    }

    fn find_program(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }

    fn device_exists(&self, device: &Path) -> bool {
        device.exists()
    }

    async fn run(&self, invocation: &Invocation) -> Result<Vec<u8>> {
        let mut cmd = match &invocation.root {
            Some(root) => {
                let mut cmd = Command::new("chroot");
                cmd.arg(root).arg(&invocation.program);
                cmd
            }
            None => Command::new(&invocation.program),
        };
        cmd.args(&invocation.args);
        cmd.envs(invocation.envs.iter().map(|(k, v)| (k, v)));

        tracing::debug!("Running: {invocation}");
        cmd.run_with_input(invocation.stdin.as_deref()).await
    }

    async fn mount(&self, request: &MountRequest) -> Result<()> {
        let request = request.clone();
        tracing::debug!(source = ?request.source, target = ?request.target, kind = ?request.kind, "Mounting");

        tokio::task::spawn_blocking(move || -> Result<_> {
            let (fstype, flags) = match request.kind {
                MountKind::Bind => (None, MsFlags::MS_BIND),
                MountKind::Virtual { fstype } => (
                    Some(fstype),
                    MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                ),
                MountKind::Device { fstype } => (Some(fstype), MsFlags::empty()),
            };
            nix::mount::mount(
                Some(request.source.as_path()),
                request.target.as_path(),
                fstype,
                flags,
                Option::<&str>::None,
            )
            .with_context(|| {
                format!(
                    "Failed to mount {:?} on {:?}",
                    request.source, request.target
                )
            })
        })
        .await
        .context("background task failed")?
    }

    async fn umount(&self, target: &Path) -> Result<()> {
        let target = target.to_owned();
        tracing::debug!(?target, "Unmounting");

        tokio::task::spawn_blocking(move || -> Result<_> {
            nix::mount::umount2(target.as_path(), MntFlags::empty())
                .with_context(|| format!("Failed to umount {target:?}"))
        })
        .await
        .context("background task failed")?
    }

    async fn attach_loop(&self, image: &Path) -> Result<PathBuf> {
        // Another process may grab the same free device between lookup and attach, so retry.
        RetryPolicy::exponential(Duration::from_millis(1))
            .with_max_retries(20)
            .with_max_delay(Duration::from_millis(500))
            .retry(|| {
                let image = image.to_owned();
                async move {
                    tokio::task::spawn_blocking(move || -> Result<_> {
                        let lc = LoopControl::open().context(
                            "Failed to open loop control, maybe forgot to run 'sudo modprobe loop'?",
                        )?;
                        let ld = lc.next_free().context("No free loop device")?;
                        ld.with()
                            .part_scan(true)
                            .attach(&image)
                            .with_context(|| format!("Failed to attach {image:?} to a loop device"))?;
                        ld.path().context("Unknown loop device path")
                    })
                    .await
                    .context("background task failed")?
                }
            })
            .await
    }

    async fn detach_loop(&self, device: &Path) -> Result<()> {
        let device = device.to_owned();

        tokio::task::spawn_blocking(move || -> Result<_> {
            LoopDevice::open(&device)
                .and_then(|ld| ld.detach())
                .with_context(|| format!("Failed to detach loop device {device:?}"))
        })
        .await
        .context("background task failed")?
    }

    async fn loops_backing(&self, image: &Path) -> Result<Vec<PathBuf>> {
        if !image.exists() {
            return Ok(vec![]);
        }

        let stdout = Command::new("losetup")
            .args(["--noheadings", "--output", "NAME", "--associated"])
            .arg(image)
            .run()
            .await
            .with_context(|| format!("Failed to list loop devices backed by {image:?}"))?;

        Ok(String::from_utf8_lossy(&stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    async fn mount_table(&self) -> Result<Vec<MountEntry>> {
        tokio::task::spawn_blocking(|| -> Result<_> {
            let mut table = vec![];
            for entry in mnt::MountIter::new_from_proc()? {
                match entry {
                    Ok(entry) => table.push(MountEntry {
                        target: entry.file,
                        source: entry.spec,
                    }),
                    Err(error) => tracing::debug!(?error, "Skipping unparsable mount entry"),
                }
            }
            Ok(table)
        })
        .await
        .context("background task failed")?
    }
}
