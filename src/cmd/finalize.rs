use anyhow::Result;
use async_trait::async_trait;

use crate::{
    cli::FinalizeOptions,
    stage::{finalize::finalize, BuildContext},
};

pub struct FinalizeCommand {
    pub ctx: BuildContext,
    pub finalize_options: FinalizeOptions,
}

#[async_trait]
impl super::Command for FinalizeCommand {
    async fn run(&self) -> Result<()> {
        let root = self
            .finalize_options
            .root
            .as_deref()
            .unwrap_or(self.ctx.config.rootfs.as_path());
        let report = finalize(&self.ctx, root).await?;
        super::log_report("finalize", &report);
        Ok(())
    }
}
