use anyhow::Result;
use async_trait::async_trait;

use crate::stage::{customize::customize, BuildContext, RootfsTree};

pub struct CustomizeCommand {
    pub ctx: BuildContext,
}

#[async_trait]
impl super::Command for CustomizeCommand {
    async fn run(&self) -> Result<()> {
        let tree = RootfsTree::existing(&self.ctx.config.rootfs);
        let report = customize(&self.ctx, &tree).await?;
        super::log_report("customize", &report);
        Ok(())
    }
}
