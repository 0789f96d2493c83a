use std::{os::unix::fs::PermissionsExt as _, path::Path};

use anyhow::{Context as _, Result};

use crate::{
    config::Architecture,
    error::BuildError,
    host::{require_programs, Invocation},
};

use super::{BuildContext, Provenance, RootfsTree};

pub const REQUIRED_PROGRAMS: &[&str] = &["debootstrap", "chroot"];

/// Left by a `--foreign` first pass; running it inside the tree completes the bootstrap.
const SECOND_STAGE: &str = "debootstrap/debootstrap";

/// Create a minimal tree at the configured rootfs path.
///
/// An existing path is never touched: it is either rejected with [`BuildError::TargetExists`] or,
/// with `reuse_existing`, returned as is.
pub async fn bootstrap(ctx: &BuildContext) -> Result<RootfsTree> {
    let config = &ctx.config;
    let target = config.rootfs.as_path();

    if tokio::fs::symlink_metadata(target).await.is_ok() {
        if config.reuse_existing {
            tracing::info!(?target, "Reusing existing root filesystem");
            return Ok(RootfsTree {
                path: target.to_owned(),
                provenance: Provenance::PreExisting,
            });
        }
        return Err(BuildError::TargetExists(target.to_owned()).into());
    }

    require_programs(ctx.host.as_ref(), REQUIRED_PROGRAMS)?;

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {parent:?}"))?;
    }

    if ctx.host.host_arch() == Some(config.arch) {
        tracing::info!(arch = %config.arch, suite = %config.suite, ?target, "Bootstrapping natively");
        debootstrap(ctx, false).await?;
    } else {
        tracing::info!(arch = %config.arch, suite = %config.suite, ?target, "Bootstrapping a foreign architecture in two stages");
        bootstrap_foreign(ctx, target).await?;
    }

    Ok(RootfsTree {
        path: target.to_owned(),
        provenance: Provenance::Bootstrapped,
    })
}

async fn debootstrap(ctx: &BuildContext, foreign: bool) -> Result<()> {
    let config = &ctx.config;

    let mut invocation = Invocation::new("debootstrap").arg(format!("--arch={}", config.arch));
    if foreign {
        invocation = invocation.arg("--foreign");
    }
    let invocation = invocation
        .arg(&config.suite)
        .arg(&config.rootfs)
        .arg(&config.mirror);

    ctx.host
        .run(&invocation)
        .await
        .context("debootstrap failed")?;
    Ok(())
}

async fn bootstrap_foreign(ctx: &BuildContext, target: &Path) -> Result<()> {
    let arch = ctx.config.arch;

    debootstrap(ctx, true).await?;

    if !target.join(SECOND_STAGE).exists() {
        return Err(BuildError::StageFailed {
            stage: "bootstrap",
            message: format!("first pass left no second-stage script at {SECOND_STAGE:?} in {target:?}"),
        }
        .into());
    }

    install_emulator(ctx, arch, target).await?;

    tracing::info!(?target, "Running second stage under emulation");
    ctx.host
        .run(
            &Invocation::new(format!("/{SECOND_STAGE}"))
                .arg("--second-stage")
                .in_root(target),
        )
        .await
        .context("debootstrap second stage failed")?;
    Ok(())
}

/// Copy the user-mode emulator into the tree so its binaries can run under chroot.
async fn install_emulator(ctx: &BuildContext, arch: Architecture, target: &Path) -> Result<()> {
    let binary = arch.emulator_binary();
    let Some(source) = ctx.host.find_program(binary) else {
        return Err(BuildError::MissingEmulationLayer {
            arch,
            binary: binary.to_owned(),
            rootfs: target.to_owned(),
        }
        .into());
    };

    let bin_dir = target.join("usr/bin");
    tokio::fs::create_dir_all(&bin_dir).await?;
    let destination = bin_dir.join(binary);

    tokio::fs::copy(&source, &destination)
        .await
        .with_context(|| format!("Failed to copy {source:?} into the tree"))?;
    tokio::fs::set_permissions(&destination, std::fs::Permissions::from_mode(0o755)).await?;

    tracing::debug!(?source, ?destination, "Emulator installed");
    Ok(())
}
