use anyhow::Result;
use async_trait::async_trait;

use crate::stage::{bootstrap::bootstrap, BuildContext, Provenance};

pub struct BootstrapCommand {
    pub ctx: BuildContext,
}

#[async_trait]
impl super::Command for BootstrapCommand {
    async fn run(&self) -> Result<()> {
        let tree = bootstrap(&self.ctx).await?;
        match tree.provenance {
            Provenance::Bootstrapped => {
                tracing::info!(rootfs = ?tree.path(), "The bootstrap stage finished")
            }
            Provenance::PreExisting => {
                tracing::info!(rootfs = ?tree.path(), "Reusing the existing root filesystem")
            }
        }
        Ok(())
    }
}
