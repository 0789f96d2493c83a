use std::path::Path;

use anyhow::{Context as _, Result};

use crate::{
    error::BuildError,
    fs::{
        loopdev::{LoopBinding, PartitionPoll},
        mount::{MountSession, ScratchMount},
    },
    host::{require_programs, Invocation},
};

use super::{
    after_release, apt::Apt, ensure_tree, write_into, BuildContext, RootfsTree, StageReport,
};

pub const REQUIRED_PROGRAMS: &[&str] = &["parted", "mkfs.ext4", "cp", "chroot", "losetup"];

const ROOT_FSTYPE: &str = "ext4";
const ROOT_LABEL: &str = "root";

const FSTAB: &str = "# <file system> <mount point> <type> <options> <dump> <pass>\nLABEL=root / ext4 errors=remount-ro 0 1\n";

/// Turn the tree into a partitioned disk image with a bootloader.
pub async fn materialize(ctx: &BuildContext, tree: &RootfsTree) -> Result<StageReport> {
    materialize_with(ctx, tree, PartitionPoll::default()).await
}

/// Teardown always runs in this order: chroot mounts inside the partition, the partition
/// itself, then the loop device. A layer that could not be released keeps every outer layer in
/// place, and the report says so.
pub async fn materialize_with(
    ctx: &BuildContext,
    tree: &RootfsTree,
    poll: PartitionPoll,
) -> Result<StageReport> {
    require_programs(ctx.host.as_ref(), REQUIRED_PROGRAMS)?;
    ensure_tree(tree.path())?;

    let image = ctx.config.image.path.as_path();

    // Never resize or repartition an image some loop device is still writing to
    let busy = ctx.host.loops_backing(image).await?;
    if !busy.is_empty() {
        return Err(BuildError::ImageBusy {
            image: image.to_owned(),
            devices: busy,
        }
        .into());
    }

    allocate(image, ctx.config.image.size.bytes()).await?;
    tracing::info!(?image, size = %ctx.config.image.size, "Image allocated");

    ctx.host
        .run(
            &Invocation::new("parted")
                .arg("-s")
                .arg(image)
                .args(["mklabel", "msdos", "mkpart", "primary", ROOT_FSTYPE, "1MiB", "100%"]),
        )
        .await
        .context("Failed to partition the image")?;

    let mut binding = LoopBinding::attach(ctx.host.clone(), image).await?;
    let partition = match binding.wait_for_partition(1, poll).await {
        Ok(partition) => partition,
        Err(error) => {
            binding.detach().await;
            return Err(error);
        }
    };

    let (result, released) = fill_partition(ctx, tree, binding.device(), &partition).await;
    if released {
        binding.detach().await;
    } else {
        binding.abandon();
    }
    let result = after_release(result, released, format!("Partition {partition:?} of the image"));

    if result.is_ok() {
        tracing::info!(?image, "Disk image ready");
    }
    result
}

async fn allocate(image: &Path, size: u64) -> Result<()> {
    if let Some(parent) = image.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {parent:?}"))?;
    }

    // Truncate first, so that no old content survives in the new image
    let file = tokio::fs::File::create(image)
        .await
        .with_context(|| format!("Failed to create image {image:?}"))?;
    file.set_len(size)
        .await
        .with_context(|| format!("Failed to resize image {image:?} to {size} bytes"))?;
    Ok(())
}

/// Also tells whether the partition is unmounted again.
async fn fill_partition(
    ctx: &BuildContext,
    tree: &RootfsTree,
    disk: &Path,
    partition: &Path,
) -> (Result<StageReport>, bool) {
    let formatted = ctx
        .host
        .run(
            &Invocation::new("mkfs.ext4")
                .args(["-F", "-L", ROOT_LABEL])
                .arg(partition),
        )
        .await
        .with_context(|| format!("Failed to format {partition:?}"));
    if let Err(error) = formatted {
        return (Err(error), true);
    }

    let mut scratch = match ScratchMount::mount(ctx.host.clone(), partition, ROOT_FSTYPE).await {
        Ok(scratch) => scratch,
        Err(error) => return (Err(error), true),
    };
    let result = install_tree(ctx, tree, disk, scratch.mount_point()).await;
    let released = scratch.unmount().await;

    (result, released)
}

async fn install_tree(
    ctx: &BuildContext,
    tree: &RootfsTree,
    disk: &Path,
    mount_point: &Path,
) -> Result<StageReport> {
    let mut source = tree.path().to_owned().into_os_string();
    source.push("/.");
    let mut destination = mount_point.to_owned().into_os_string();
    destination.push("/");

    tracing::info!(from = ?tree.path(), to = ?mount_point, "Copying root filesystem into the image");
    ctx.host
        .run(&Invocation::new("cp").arg("-a").arg(source).arg(destination))
        .await
        .context("Failed to copy the root filesystem into the image")?;

    tokio::fs::create_dir_all(mount_point.join("boot")).await?;
    write_into(mount_point, "etc/fstab", FSTAB, 0o644).await?;

    let mut session = MountSession::open(ctx.host.clone(), mount_point).await?;
    let report = install_bootloader(ctx, disk, mount_point).await;
    let released = session.close().await;

    after_release(Ok(report), released, "The chroot mounts inside the image")
}

/// A missing bootloader still leaves an image worth inspecting, so nothing here is fatal.
async fn install_bootloader(ctx: &BuildContext, disk: &Path, root: &Path) -> StageReport {
    let arch = ctx.config.arch;
    let apt = Apt::new(ctx.host.as_ref(), root);
    let mut report = StageReport::default();

    let packages = async {
        apt.update().await?;
        apt.install(arch.bootloader_packages()).await
    }
    .await;
    report.non_fatal("bootloader packages", packages);

    let grub_install = ctx
        .host
        .run(
            &Invocation::new("grub-install")
                .args(arch.grub_install_args().iter().copied())
                .arg("--boot-directory=/boot")
                .arg(disk)
                .in_root(root),
        )
        .await
        .with_context(|| format!("Failed to install the bootloader on {disk:?}"));
    report.non_fatal("bootloader install", grub_install);

    let update_grub = ctx
        .host
        .run(&Invocation::new("update-grub").in_root(root))
        .await
        .context("Failed to generate the bootloader menu");
    report.non_fatal("bootloader config", update_grub);

    report
}
