use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Context as _, Result};
use lazy_static::lazy_static;
use tempfile::TempDir;

use crate::{
    async_defer,
    error::BuildError,
    host::{Host, MountRequest},
};

/// Directory name prefix of the scratch mount points, also used to find leftovers.
pub const SCRATCH_MOUNT_PREFIX: &str = "simetrio-mnt-";

lazy_static! {
    static ref ACTIVE_SESSIONS: Mutex<HashSet<PathBuf>> = Mutex::new(HashSet::new());
}

/// The pseudo-filesystems bound into a root, in acquisition order.
fn session_mounts(root: &Path) -> [MountRequest; 4] {
    [
        MountRequest::bind("/dev", root.join("dev")),
        MountRequest::bind("/dev/pts", root.join("dev/pts")),
        MountRequest::virtual_fs("proc", root.join("proc")),
        MountRequest::virtual_fs("sysfs", root.join("sys")),
    ]
}

/// The mounts needed to run commands chrooted into a root filesystem.
///
/// Mounts are released in reverse order by [`MountSession::close`]. A session that is dropped
/// without being closed releases itself from `Drop`. Only one session may be active on a root.
pub struct MountSession {
    host: Arc<dyn Host>,
    root: PathBuf,
    key: Option<PathBuf>,
    mounted: Vec<PathBuf>,
    /// Mounts whose unmount failed.
    leaked: Vec<PathBuf>,
}

impl MountSession {
    pub async fn open(host: Arc<dyn Host>, root: &Path) -> Result<Self> {
        let key = tokio::fs::canonicalize(root)
            .await
            .with_context(|| format!("Failed to resolve root filesystem path {root:?}"))?;

        {
            let mut active = ACTIVE_SESSIONS.lock().unwrap_or_else(|e| e.into_inner());
            if !active.insert(key.clone()) {
                return Err(BuildError::SessionActive(root.to_owned()).into());
            }
        }

        let mut session = Self {
            host,
            root: root.to_owned(),
            key: Some(key),
            mounted: vec![],
            leaked: vec![],
        };

        if let Err(error) = session.acquire().await {
            if !session.close().await {
                tracing::warn!(root = ?session.root, "Partially opened mount session left mounts behind");
            }
            return Err(error);
        }

        tracing::debug!(root = ?session.root, "Mount session opened");
        Ok(session)
    }

    async fn acquire(&mut self) -> Result<()> {
        for request in session_mounts(&self.root) {
            tokio::fs::create_dir_all(&request.target)
                .await
                .with_context(|| format!("Failed to create mount point {:?}", request.target))?;
            self.host
                .mount(&request)
                .await
                .with_context(|| format!("Failed to mount {:?} into {:?}", request.source, self.root))?;
            self.mounted.push(request.target);
        }

        self.copy_resolver_config().await
    }

    async fn copy_resolver_config(&self) -> Result<()> {
        let source = self.host.resolver_config();
        if !source.exists() {
            tracing::warn!(?source, "No name-resolution config on the host, network access inside the root may fail");
            return Ok(());
        }

        let etc = self.root.join("etc");
        tokio::fs::create_dir_all(&etc).await?;
        let target = etc.join("resolv.conf");

        // Often a dangling symlink into /run inside a fresh tree
        if let Ok(metadata) = tokio::fs::symlink_metadata(&target).await {
            if metadata.file_type().is_symlink() {
                tokio::fs::remove_file(&target).await?;
            }
        }

        tokio::fs::copy(&source, &target)
            .await
            .with_context(|| format!("Failed to copy {source:?} to {target:?}"))?;
        Ok(())
    }

    /// Unmount everything in reverse order. Failures are logged, never returned; the result tells
    /// whether every mount was released. Calling it again is a no-op returning the same answer.
    pub async fn close(&mut self) -> bool {
        while let Some(target) = self.mounted.pop() {
            if let Err(error) = self.host.umount(&target).await {
                tracing::warn!(?error, ?target, "Failed to unmount, continuing teardown");
                self.leaked.push(target);
            }
        }

        if let Some(key) = self.key.take() {
            ACTIVE_SESSIONS
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key);
            tracing::debug!(root = ?self.root, "Mount session closed");
        }

        self.leaked.is_empty()
    }
}

impl Drop for MountSession {
    fn drop(&mut self) {
        if self.mounted.is_empty() && self.key.is_none() {
            return;
        }

        tracing::warn!(root = ?self.root, "Mount session was not closed, releasing it now");
        async_defer! {
            async {
                self.close().await;
                Ok::<_, anyhow::Error>(())
            }
        }
    }
}

/// A block device mounted on a fresh temporary directory.
pub struct ScratchMount {
    host: Arc<dyn Host>,
    device: PathBuf,
    mount_point: PathBuf,
    dir: Option<TempDir>,
    mounted: bool,
    released: bool,
}

impl ScratchMount {
    pub async fn mount(host: Arc<dyn Host>, device: &Path, fstype: &'static str) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(SCRATCH_MOUNT_PREFIX)
            .tempdir()
            .context("Failed to create scratch mount point")?;
        let mount_point = dir.path().to_owned();

        host.mount(&MountRequest::device(device, fstype, &mount_point))
            .await
            .with_context(|| format!("Failed to mount {device:?} on {mount_point:?}"))?;

        Ok(Self {
            host,
            device: device.to_owned(),
            mount_point,
            dir: Some(dir),
            mounted: true,
            released: false,
        })
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Failures are logged; the result tells whether the device is no longer mounted. Nothing is
    /// attempted while something is still mounted inside, and the mount point directory is kept
    /// whenever the device stays mounted, so that removing it never reaches into the filesystem.
    pub async fn unmount(&mut self) -> bool {
        if !self.mounted {
            return self.released;
        }
        self.mounted = false;

        let nested = self.nested_mounts().await;
        let result = if nested.is_empty() {
            self.host.umount(&self.mount_point).await
        } else {
            Err(anyhow!("still holds mounts {nested:?}"))
        };

        match result {
            Ok(()) => {
                self.released = true;
                if let Some(dir) = self.dir.take() {
                    if let Err(error) = dir.close() {
                        tracing::debug!(?error, "Failed to remove scratch mount point");
                    }
                }
            }
            Err(error) => {
                tracing::warn!(?error, device = ?self.device, mount_point = ?self.mount_point, "Failed to unmount, leaving mount point in place");
                if let Some(dir) = self.dir.take() {
                    let _ = dir.keep();
                }
            }
        }
        self.released
    }

    async fn nested_mounts(&self) -> Vec<PathBuf> {
        match self.host.mount_table().await {
            Ok(table) => table
                .into_iter()
                .map(|entry| entry.target)
                .filter(|target| target != &self.mount_point && target.starts_with(&self.mount_point))
                .collect(),
            Err(error) => {
                tracing::debug!(?error, "Failed to read the mount table, unmounting anyway");
                vec![]
            }
        }
    }
}

impl Drop for ScratchMount {
    fn drop(&mut self) {
        if !self.mounted {
            return;
        }

        async_defer! {
            async {
                self.unmount().await;
                Ok::<_, anyhow::Error>(())
            }
        }
    }
}

#[cfg(test)]
pub mod tests {
    use anyhow::Result;

    use crate::host::fake::{Event, FailPoint, FakeHost};

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_session_releases_in_reverse_order() -> Result<()> {
        let root = tempfile::tempdir()?;
        let host = Arc::new(FakeHost::new());

        let mut session = MountSession::open(host.clone(), root.path()).await?;
        assert_eq!(host.active_mounts().len(), 4);
        assert!(root.path().join("etc/resolv.conf").exists());

        assert!(session.close().await);
        assert!(session.close().await);
        assert!(host.active_mounts().is_empty());

        let unmounted = host
            .events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Umount(target) => Some(target),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(
            unmounted,
            ["sys", "proc", "dev/pts", "dev"]
                .map(|p| root.path().join(p))
                .to_vec()
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_second_session_on_same_root_is_rejected() -> Result<()> {
        let root = tempfile::tempdir()?;
        let host = Arc::new(FakeHost::new());

        let mut first = MountSession::open(host.clone(), root.path()).await?;
        let error = MountSession::open(host.clone(), root.path())
            .await
            .err()
            .expect("second session must fail");
        assert!(matches!(
            BuildError::find(&error),
            Some(BuildError::SessionActive(_))
        ));
        assert_eq!(host.active_mounts().len(), 4);

        first.close().await;
        let mut again = MountSession::open(host.clone(), root.path()).await?;
        again.close().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_open_releases_partial_mounts() -> Result<()> {
        let root = tempfile::tempdir()?;
        let host = Arc::new(FakeHost::new().with_failure(FailPoint::Mount("/proc".into())));

        assert!(MountSession::open(host.clone(), root.path()).await.is_err());
        assert!(host.active_mounts().is_empty());

        // The registry entry is gone as well
        let host = Arc::new(FakeHost::new());
        let mut session = MountSession::open(host, root.path()).await?;
        session.close().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dropped_session_releases_mounts() -> Result<()> {
        let root = tempfile::tempdir()?;
        let host = Arc::new(FakeHost::new());

        {
            let _session = MountSession::open(host.clone(), root.path()).await?;
        }
        assert!(host.active_mounts().is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resolver_config_replaces_symlink() -> Result<()> {
        let root = tempfile::tempdir()?;
        tokio::fs::create_dir_all(root.path().join("etc")).await?;
        std::os::unix::fs::symlink(
            "/run/systemd/resolve/stub-resolv.conf",
            root.path().join("etc/resolv.conf"),
        )?;
        let host = Arc::new(FakeHost::new());

        let mut session = MountSession::open(host.clone(), root.path()).await?;
        session.close().await;

        let copied = tokio::fs::read_to_string(root.path().join("etc/resolv.conf")).await?;
        assert_eq!(copied, tokio::fs::read_to_string(host.resolver_config()).await?);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_scratch_mount_removes_dir_after_unmount() -> Result<()> {
        let host = Arc::new(FakeHost::new());
        let mut scratch = ScratchMount::mount(host.clone(), Path::new("/dev/loop0p1"), "ext4").await?;
        let mount_point = scratch.mount_point().to_owned();
        assert!(mount_point
            .file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with(SCRATCH_MOUNT_PREFIX)));
        assert_eq!(host.active_mounts(), [mount_point.clone()]);

        assert!(scratch.unmount().await);
        assert!(scratch.unmount().await);
        assert!(host.active_mounts().is_empty());
        assert!(!mount_point.exists());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_scratch_mount_keeps_dir_when_unmount_fails() -> Result<()> {
        let host = Arc::new(FakeHost::new().with_failure(FailPoint::Umount(SCRATCH_MOUNT_PREFIX.into())));
        let mut scratch = ScratchMount::mount(host.clone(), Path::new("/dev/loop0p1"), "ext4").await?;
        let mount_point = scratch.mount_point().to_owned();

        assert!(!scratch.unmount().await);
        assert!(!scratch.unmount().await);
        assert!(mount_point.exists());
        drop(scratch);
        assert!(mount_point.exists());

        std::fs::remove_dir(&mount_point)?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_close_reports_leftovers() -> Result<()> {
        let root = tempfile::tempdir()?;
        let host = Arc::new(FakeHost::new().with_failure(FailPoint::Umount("/proc".into())));

        let mut session = MountSession::open(host.clone(), root.path()).await?;
        assert!(!session.close().await);
        assert!(!session.close().await);
        assert_eq!(host.active_mounts(), [root.path().join("proc")]);

        // The root is free for a new session all the same
        host.clear_failures();
        host.umount(&root.path().join("proc")).await?;
        let mut again = MountSession::open(host.clone(), root.path()).await?;
        assert!(again.close().await);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_scratch_mount_stays_while_something_is_mounted_inside() -> Result<()> {
        let host = Arc::new(FakeHost::new());
        let mut scratch = ScratchMount::mount(host.clone(), Path::new("/dev/loop0p1"), "ext4").await?;
        let mount_point = scratch.mount_point().to_owned();
        let nested = mount_point.join("proc");
        host.mount(&MountRequest::virtual_fs("proc", &nested)).await?;

        assert!(!scratch.unmount().await);
        assert_eq!(host.active_mounts(), [mount_point.clone(), nested.clone()]);
        assert!(!host
            .events()
            .iter()
            .any(|e| matches!(e, Event::Umount(t) | Event::UmountFailed(t) if t == &mount_point)));
        assert!(mount_point.exists());

        host.umount(&nested).await?;
        host.umount(&mount_point).await?;
        std::fs::remove_dir_all(&mount_point)?;
        Ok(())
    }
}
