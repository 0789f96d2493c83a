use std::path::Path;

use anyhow::{Context as _, Result};

use crate::{fs::mount::MountSession, host::require_programs};

use super::{
    after_release, apt::Apt, ensure_tree, write_into, BuildContext, RootfsTree, StageReport,
};

pub const REQUIRED_PROGRAMS: &[&str] = &["chroot"];

pub const BASE_PACKAGES: &[&str] = &[
    "locales",
    "ca-certificates",
    "systemd-sysv",
    "initramfs-tools",
    "sudo",
    "iproute2",
    "iputils-ping",
    "net-tools",
];

pub const DESKTOP_PACKAGES: &[&str] = &["kde-plasma-desktop", "sddm"];

/// Used when the desktop metapackage is not available from the mirror.
pub const DESKTOP_FALLBACK_PACKAGES: &[&str] = &["plasma-desktop", "sddm", "konsole"];

pub const INSTALLER_PACKAGES: &[&str] = &["calamares", "calamares-settings-debian"];

pub(crate) const XSESSION_PATH: &str = "etc/skel/.xsession";
pub(crate) const SDDM_SESSION_PATH: &str = "etc/sddm.conf.d/10-simetrio-session.conf";

const XSESSION: &str = "#!/bin/sh\nexec startplasma-x11\n";
const SDDM_SESSION: &str = "[Autologin]\nSession=plasma\n\n[General]\nDisplayServer=x11\n";

/// Install packages into the tree from inside a chroot.
///
/// The mount session is closed before returning whatever happened in between.
pub async fn customize(ctx: &BuildContext, tree: &RootfsTree) -> Result<StageReport> {
    require_programs(ctx.host.as_ref(), REQUIRED_PROGRAMS)?;
    ensure_tree(tree.path())?;

    tracing::info!(root = ?tree.path(), "Customizing root filesystem");
    let mut session = MountSession::open(ctx.host.clone(), tree.path()).await?;
    let result = install_packages(ctx, tree.path()).await;
    let released = session.close().await;

    after_release(result, released, "The chroot mounts")
}

async fn install_packages(ctx: &BuildContext, root: &Path) -> Result<StageReport> {
    let config = &ctx.config;
    let apt = Apt::new(ctx.host.as_ref(), root);
    let mut report = StageReport::default();

    apt.update().await?;
    apt.install(BASE_PACKAGES)
        .await
        .context("Failed to install the base system")?;

    let kernel = config.kernel_package();
    report.non_fatal("kernel", apt.install(&[kernel.as_str()]).await);

    if config.install_desktop {
        let installed = match apt.install(DESKTOP_PACKAGES).await {
            Ok(()) => Ok(()),
            Err(error) => {
                tracing::warn!(?error, "Desktop metapackage unavailable, trying the fallback set");
                apt.install(DESKTOP_FALLBACK_PACKAGES).await
            }
        };
        report.non_fatal("desktop", installed);

        write_into(root, XSESSION_PATH, XSESSION, 0o755).await?;
        write_into(root, SDDM_SESSION_PATH, SDDM_SESSION, 0o644).await?;
    }

    if config.install_installer {
        report.non_fatal("installer", apt.install(INSTALLER_PACKAGES).await);
    }

    report.non_fatal("cache cleanup", apt.clean().await);

    Ok(report)
}

#[cfg(test)]
pub mod tests {
    use std::{os::unix::fs::PermissionsExt as _, sync::Arc};

    use anyhow::Result;
    use rstest::rstest;

    use crate::{
        error::BuildError,
        host::fake::{Event, FailPoint, FakeHost},
        stage::{tests::context, BuildContext, TEARDOWN_STEP},
    };

    use super::*;

    async fn prepared(host: &Arc<FakeHost>, workdir: &Path) -> Result<(BuildContext, RootfsTree)> {
        let ctx = context(host, workdir);
        tokio::fs::create_dir_all(&ctx.config.rootfs).await?;
        let tree = RootfsTree::existing(&ctx.config.rootfs);
        Ok((ctx, tree))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_customize_installs_inside_mount_session() -> Result<()> {
        let workdir = tempfile::tempdir()?;
        let host = Arc::new(FakeHost::new());
        let (ctx, tree) = prepared(&host, workdir.path()).await?;

        let report = customize(&ctx, &tree).await?;
        assert!(report.is_clean(), "{report:?}");
        assert!(host.active_mounts().is_empty());

        let invocations = host.invocations();
        assert!(invocations
            .iter()
            .all(|i| i.root.as_deref() == Some(tree.path())));
        assert!(host.ran("apt-get", "sudo"));
        assert!(host.ran("apt-get", "linux-image-amd64"));
        assert!(!host.ran("apt-get", "kde-plasma-desktop"));
        assert!(!host.ran("apt-get", "calamares"));

        let last_mount = host
            .events()
            .iter()
            .rposition(|e| matches!(e, Event::Mount(_)))
            .expect("mounted");
        let first_run = host
            .position(|e| matches!(e, Event::Run(_)))
            .expect("ran apt-get");
        let first_umount = host
            .position(|e| matches!(e, Event::Umount(_)))
            .expect("unmounted");
        let last_run = host
            .events()
            .iter()
            .rposition(|e| matches!(e, Event::Run(_)))
            .expect("ran apt-get");
        assert!(last_mount < first_run && last_run < first_umount);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_desktop_falls_back_and_writes_session_files() -> Result<()> {
        let workdir = tempfile::tempdir()?;
        let host = Arc::new(
            FakeHost::new().with_failure(FailPoint::run_with_arg("apt-get", "kde-plasma-desktop")),
        );
        let (mut ctx, tree) = prepared(&host, workdir.path()).await?;
        ctx.config.install_desktop = true;

        let report = customize(&ctx, &tree).await?;
        assert!(report.is_clean(), "{report:?}");
        assert!(host.ran("apt-get", "konsole"));

        let xsession = tree.path().join(XSESSION_PATH);
        assert_eq!(std::fs::metadata(&xsession)?.permissions().mode() & 0o777, 0o755);
        assert!(std::fs::read_to_string(tree.path().join(SDDM_SESSION_PATH))?.contains("Session=plasma"));
        Ok(())
    }

    #[rstest]
    #[case::kernel(FailPoint::run_with_arg("apt-get", "linux-image-amd64"), "kernel")]
    #[case::desktop(FailPoint::run_with_arg("apt-get", "sddm"), "desktop")]
    #[case::installer(FailPoint::run_with_arg("apt-get", "calamares"), "installer")]
    #[case::clean(FailPoint::run_with_arg("apt-get", "clean"), "cache cleanup")]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_optional_steps_only_warn(#[case] fail_point: FailPoint, #[case] step: &str) -> Result<()> {
        let workdir = tempfile::tempdir()?;
        let host = Arc::new(FakeHost::new().with_failure(fail_point));
        let (mut ctx, tree) = prepared(&host, workdir.path()).await?;
        ctx.config.install_desktop = true;
        ctx.config.install_installer = true;

        let report = customize(&ctx, &tree).await?;
        assert_eq!(
            report.warnings.iter().map(|w| w.step).collect::<Vec<_>>(),
            [step]
        );
        assert!(host.active_mounts().is_empty());
        Ok(())
    }

    #[rstest]
    #[case::update(FailPoint::run_with_arg("apt-get", "update"))]
    #[case::base(FailPoint::run_with_arg("apt-get", "systemd-sysv"))]
    #[case::mount_proc(FailPoint::Mount("/proc".into()))]
    #[case::mount_sys(FailPoint::Mount("/sys".into()))]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_fatal_failures_still_release_mounts(#[case] fail_point: FailPoint) -> Result<()> {
        let workdir = tempfile::tempdir()?;
        let host = Arc::new(FakeHost::new().with_failure(fail_point));
        let (ctx, tree) = prepared(&host, workdir.path()).await?;

        assert!(customize(&ctx, &tree).await.is_err());
        assert!(host.active_mounts().is_empty());
        assert!(host.active_loops().is_empty());
        Ok(())
    }

    #[rstest]
    #[case::finished(None)]
    #[case::failed(Some(FailPoint::run_with_arg("apt-get", "systemd-sysv")))]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_unmount_points_at_teardown(#[case] fail_point: Option<FailPoint>) -> Result<()> {
        let workdir = tempfile::tempdir()?;
        let host = FakeHost::new().with_failure(FailPoint::Umount("/proc".into()));
        let host = Arc::new(match fail_point.clone() {
            Some(fail_point) => host.with_failure(fail_point),
            None => host,
        });
        let (ctx, tree) = prepared(&host, workdir.path()).await?;

        match customize(&ctx, &tree).await {
            Ok(report) => {
                assert!(fail_point.is_none());
                assert_eq!(
                    report.warnings.iter().map(|w| w.step).collect::<Vec<_>>(),
                    [TEARDOWN_STEP]
                );
                assert!(report.warnings[0].message.contains("simetrio teardown"));
            }
            Err(error) => {
                assert!(fail_point.is_some(), "unexpected failure: {error:#}");
                assert!(format!("{error:#}").contains("simetrio teardown"));
            }
        }
        assert_eq!(host.active_mounts(), [tree.path().join("proc")]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_tree() -> Result<()> {
        let workdir = tempfile::tempdir()?;
        let host = Arc::new(FakeHost::new());
        let ctx = context(&host, workdir.path());

        let error = customize(&ctx, &RootfsTree::existing(&ctx.config.rootfs))
            .await
            .unwrap_err();
        assert!(matches!(BuildError::find(&error), Some(BuildError::NotFound(_))));
        assert!(host.events().is_empty());
        Ok(())
    }
}
