use std::path::Path;

use anyhow::{Context as _, Result};

use crate::{
    config::AccountConfig,
    fs::mount::MountSession,
    host::{require_programs, Host, Invocation},
};

use super::{
    after_release, apt::Apt, customize::INSTALLER_PACKAGES, ensure_tree, write_into, BuildContext,
    StageReport,
};

pub const REQUIRED_PROGRAMS: &[&str] = &["chroot"];

pub(crate) const AUTOLOGIN_PATH: &str = "etc/sddm.conf.d/20-simetrio-autologin.conf";

/// Add the login account and refresh boot metadata. Running it again on the same tree changes
/// nothing about the account.
pub async fn finalize(ctx: &BuildContext, root: &Path) -> Result<StageReport> {
    require_programs(ctx.host.as_ref(), REQUIRED_PROGRAMS)?;
    ensure_tree(root)?;

    tracing::info!(?root, "Finalizing root filesystem");
    let mut session = MountSession::open(ctx.host.clone(), root).await?;
    let result = configure(ctx, root).await;
    let released = session.close().await;

    after_release(result, released, "The chroot mounts")
}

async fn configure(ctx: &BuildContext, root: &Path) -> Result<StageReport> {
    let config = &ctx.config;
    let host = ctx.host.as_ref();
    let apt = Apt::new(host, root);
    let mut report = StageReport::default();

    let kernel = config.kernel_package();
    let installed = async {
        apt.update().await?;
        apt.install(&[kernel.as_str()]).await
    }
    .await;
    report.non_fatal("kernel", installed);

    ensure_account(host, root, &config.account).await?;

    if config.install_desktop {
        write_into(
            root,
            AUTOLOGIN_PATH,
            &format!(
                "[Autologin]\nUser={}\nSession=plasma\n",
                config.account.username
            ),
            0o644,
        )
        .await?;
    }

    let initramfs = host
        .run(
            &Invocation::new("update-initramfs")
                .args(["-u", "-k", "all"])
                .in_root(root),
        )
        .await
        .context("Failed to regenerate the initramfs");
    report.non_fatal("initramfs", initramfs);

    let update_grub = host
        .run(&Invocation::new("update-grub").in_root(root))
        .await
        .context("Failed to generate the bootloader menu");
    report.non_fatal("bootloader config", update_grub);

    if config.install_installer {
        report.non_fatal("installer", apt.install(INSTALLER_PACKAGES).await);
    }

    Ok(report)
}

/// Create the account unless it exists, then make sure it may use sudo.
///
/// The initial password is only set on creation.
async fn ensure_account(host: &dyn Host, root: &Path, account: &AccountConfig) -> Result<()> {
    let username = account.username.as_str();

    let exists = host
        .run(&Invocation::new("id").args(["-u", username]).in_root(root))
        .await
        .is_ok();

    if exists {
        tracing::info!(username, "Account already exists, keeping its password");
    } else {
        host.run(
            &Invocation::new("useradd")
                .args(["-m", "-s", "/bin/bash", username])
                .in_root(root),
        )
        .await
        .with_context(|| format!("Failed to create account {username:?}"))?;

        host.run(
            &Invocation::new("chpasswd")
                .in_root(root)
                .stdin(format!("{username}:{}\n", account.password)),
        )
        .await
        .with_context(|| format!("Failed to set the password of {username:?}"))?;

        tracing::warn!(
            username,
            "Account created with the configured initial password, change it after the first boot"
        );
    }

    host.run(
        &Invocation::new("usermod")
            .args(["-aG", "sudo", username])
            .in_root(root),
    )
    .await
    .with_context(|| format!("Failed to add {username:?} to the sudo group"))?;

    Ok(())
}
