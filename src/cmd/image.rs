use anyhow::Result;
use async_trait::async_trait;

use crate::stage::{image::materialize, BuildContext, RootfsTree};

pub struct ImageCommand {
    pub ctx: BuildContext,
}

#[async_trait]
impl super::Command for ImageCommand {
    async fn run(&self) -> Result<()> {
        let tree = RootfsTree::existing(&self.ctx.config.rootfs);
        let report = materialize(&self.ctx, &tree).await?;
        super::log_report("image", &report);
        tracing::info!(image = ?self.ctx.config.image.path, "Disk image is ready");
        Ok(())
    }
}
