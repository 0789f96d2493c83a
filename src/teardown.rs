//! Release whatever an interrupted or crashed build left behind.
//!
//! Works only from the host mount and loop tables, so it can run in a fresh process, and does
//! nothing when there is nothing to release.

use std::path::{Path, PathBuf};

use crate::{
    config::BuildConfig,
    fs::mount::SCRATCH_MOUNT_PREFIX,
    host::{Host, MountEntry},
};

/// `losetup` lists the loop devices backing the image.
pub const REQUIRED_PROGRAMS: &[&str] = &["losetup"];

/// The places a build acquires resources on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownTargets {
    pub rootfs: PathBuf,
    pub image: PathBuf,
}

impl TeardownTargets {
    pub fn from_config(config: &BuildConfig) -> Self {
        Self {
            rootfs: config.rootfs.clone(),
            image: config.image.path.clone(),
        }
    }

    /// Strictly below the rootfs; a filesystem mounted on the rootfs itself is not ours.
    fn below_rootfs(&self, mount_point: &Path) -> bool {
        mount_point != self.rootfs && mount_point.starts_with(&self.rootfs)
    }
}

/// A scratch mount point holding a partition of one of `devices`.
fn is_scratch_mount_of(entry: &MountEntry, devices: &[PathBuf]) -> bool {
    let scratch_named = entry
        .target
        .file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with(SCRATCH_MOUNT_PREFIX));

    scratch_named
        && devices.iter().any(|device| {
            entry
                .source
                .strip_prefix(device.to_string_lossy().as_ref())
                .and_then(|rest| rest.strip_prefix('p'))
                .is_some_and(|number| !number.is_empty() && number.chars().all(|c| c.is_ascii_digit()))
        })
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub unmounted: Vec<PathBuf>,
    pub detached: Vec<PathBuf>,
    pub failures: Vec<String>,
}

impl TeardownReport {
    pub fn is_empty(&self) -> bool {
        self.unmounted.is_empty() && self.detached.is_empty() && self.failures.is_empty()
    }
}

/// Mounts belonging to a build, in the order they can be unmounted: most recently mounted
/// first, and never a mount before one nested below it.
///
/// Owned are the mounts below the rootfs, and the scratch mounts of a partition of `devices`
/// (the loop devices backing the image) together with everything mounted inside them.
pub fn owned_mounts(
    mount_table: Vec<MountEntry>,
    targets: &TeardownTargets,
    devices: &[PathBuf],
) -> Vec<PathBuf> {
    let scratch_mounts = mount_table
        .iter()
        .filter(|entry| is_scratch_mount_of(entry, devices))
        .map(|entry| entry.target.clone())
        .collect::<Vec<_>>();

    let mut owned = mount_table
        .into_iter()
        .rev()
        .map(|entry| entry.target)
        .filter(|mount_point| {
            targets.below_rootfs(mount_point)
                || scratch_mounts
                    .iter()
                    .any(|scratch| mount_point.starts_with(scratch))
        })
        .collect::<Vec<_>>();
    owned.sort_by_key(|mount_point| std::cmp::Reverse(mount_point.components().count()));
    owned
}

/// The mount table may list the canonical form of a path given through a symlink.
pub(crate) fn canonical_targets(targets: &TeardownTargets) -> TeardownTargets {
    let canonical = |path: &Path| std::fs::canonicalize(path).unwrap_or_else(|_| path.to_owned());
    TeardownTargets {
        rootfs: canonical(&targets.rootfs),
        image: canonical(&targets.image),
    }
}

/// Unmount everything below the rootfs and the scratch mounts of the image, deepest first, then
/// detach every loop device backed by the image. Failures are logged and reported, never returned.
pub async fn compensate(host: &dyn Host, targets: &TeardownTargets) -> TeardownReport {
    let targets = canonical_targets(targets);
    let mut report = TeardownReport::default();

    let devices = match host.loops_backing(&targets.image).await {
        Ok(devices) => devices,
        Err(error) => {
            tracing::warn!(?error, image = ?targets.image, "Failed to list loop devices");
            report.failures.push(format!("loop devices: {error:#}"));
            vec![]
        }
    };

    match host.mount_table().await {
        Ok(mount_table) => {
            for mount_point in owned_mounts(mount_table, &targets, &devices) {
                match host.umount(&mount_point).await {
                    Ok(()) => {
                        tracing::info!(?mount_point, "Released leftover mount");
                        report.unmounted.push(mount_point);
                    }
                    Err(error) => {
                        tracing::warn!(?error, ?mount_point, "Failed to release leftover mount");
                        report.failures.push(format!("umount {mount_point:?}: {error:#}"));
                    }
                }
            }
        }
        Err(error) => {
            tracing::warn!(?error, "Failed to read the mount table");
            report.failures.push(format!("mount table: {error:#}"));
        }
    }

    for device in devices {
        match host.detach_loop(&device).await {
            Ok(()) => {
                tracing::info!(?device, "Detached leftover loop device");
                report.detached.push(device);
            }
            Err(error) => {
                tracing::warn!(?error, ?device, "Failed to detach leftover loop device");
                report.failures.push(format!("detach {device:?}: {error:#}"));
            }
        }
    }

    report
}
