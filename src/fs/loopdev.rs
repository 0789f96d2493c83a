use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use again::RetryPolicy;
use anyhow::{anyhow, Context as _, Result};

use crate::{async_defer, error::BuildError, host::Host};

/// How long to wait for the kernel to create a partition node after attaching.
#[derive(Debug, Clone, Copy)]
pub struct PartitionPoll {
    pub attempts: usize,
    pub interval: Duration,
}

impl Default for PartitionPoll {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval: Duration::from_secs(1),
        }
    }
}

/// An image file attached to a loop device with partition scanning.
///
/// Detached by [`LoopBinding::detach`], or from `Drop` if that was never called.
pub struct LoopBinding {
    host: Arc<dyn Host>,
    image: PathBuf,
    device: PathBuf,
    attached: bool,
}

impl LoopBinding {
    /// Fails with [`BuildError::ImageBusy`] if some loop device is already backed by `image`.
    pub async fn attach(host: Arc<dyn Host>, image: &Path) -> Result<Self> {
        let busy = host
            .loops_backing(image)
            .await
            .with_context(|| format!("Failed to check loop devices of {image:?}"))?;
        if !busy.is_empty() {
            return Err(BuildError::ImageBusy {
                image: image.to_owned(),
                devices: busy,
            }
            .into());
        }

        let device = host.attach_loop(image).await?;
        tracing::info!(?image, ?device, "Image attached to loop device");

        Ok(Self {
            host,
            image: image.to_owned(),
            device,
            attached: true,
        })
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    /// Device node of partition `number`, e.g. `/dev/loop3p1`.
    pub fn partition_path(&self, number: u32) -> PathBuf {
        let mut path = self.device.clone().into_os_string();
        path.push(format!("p{number}"));
        path.into()
    }

    /// Wait for the partition node to show up. Fails with [`BuildError::PartitionNodeMissing`]
    /// once the attempts are exhausted; the binding stays attached, detaching is up to the caller.
    pub async fn wait_for_partition(&self, number: u32, poll: PartitionPoll) -> Result<PathBuf> {
        let partition = self.partition_path(number);

        RetryPolicy::fixed(poll.interval)
            .with_max_retries(poll.attempts.saturating_sub(1))
            .retry(|| async {
                if self.host.device_exists(&partition) {
                    Ok(partition.clone())
                } else {
                    tracing::debug!(?partition, "Partition node not there yet");
                    Err(anyhow!("Partition node {partition:?} not found"))
                }
            })
            .await
            .map_err(|_| BuildError::PartitionNodeMissing(partition.clone()).into())
    }

    /// Detach the device. Only the first call does anything; failures are logged.
    pub async fn detach(&mut self) {
        if !self.attached {
            return;
        }
        self.attached = false;

        match self.host.detach_loop(&self.device).await {
            Ok(()) => tracing::info!(device = ?self.device, "Loop device detached"),
            Err(error) => {
                tracing::warn!(?error, device = ?self.device, image = ?self.image, "Failed to detach loop device")
            }
        }
    }

    /// Leave the device attached, e.g. while one of its partitions is still mounted, and stop
    /// tracking it so that `Drop` does not try either.
    pub fn abandon(&mut self) {
        if self.attached {
            self.attached = false;
            tracing::warn!(device = ?self.device, image = ?self.image, "Leaving loop device attached");
        }
    }
}

impl Drop for LoopBinding {
    fn drop(&mut self) {
        if !self.attached {
            return;
        }

        async_defer! {
            async {
                self.detach().await;
                Ok::<_, anyhow::Error>(())
            }
        }
    }
}
