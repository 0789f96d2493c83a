use anyhow::{Context as _, Result};
use async_trait::async_trait;

use crate::{
    cli::BuildOptions,
    sign::sign_image,
    stage::{
        bootstrap::bootstrap, customize::customize, finalize::finalize, image::materialize,
        BuildContext, StageReport,
    },
};

pub struct BuildCommand {
    pub ctx: BuildContext,
    pub build_options: BuildOptions,
}

#[async_trait]
impl super::Command for BuildCommand {
    async fn run(&self) -> Result<()> {
        let ctx = &self.ctx;
        let mut report = StageReport::default();

        let tree = bootstrap(ctx).await.context("The bootstrap stage failed")?;

        let customized = customize(ctx, &tree)
            .await
            .context("The customize stage failed")?;
        super::log_report("customize", &customized);
        report.merge(customized);

        // The account has to exist in the tree before it is copied into the image
        if self.build_options.skip_finalize {
            tracing::info!("Skipping the finalize stage");
        } else {
            let finalized = finalize(ctx, tree.path())
                .await
                .context("The finalize stage failed")?;
            super::log_report("finalize", &finalized);
            report.merge(finalized);
        }

        let imaged = materialize(ctx, &tree)
            .await
            .context("The image stage failed")?;
        super::log_report("image", &imaged);
        report.merge(imaged);

        if let Some(key) = &self.build_options.sign_key {
            sign_image(&ctx.config.image.path, key, None)
                .await
                .context("Failed to sign the image")?;
        }

        tracing::info!(
            image = ?ctx.config.image.path,
            skipped_steps = report.warnings.len(),
            "Build finished"
        );
        Ok(())
    }
}
