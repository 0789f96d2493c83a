use anyhow::Result;
use async_trait::async_trait;

use crate::{cli::SignOptions, sign::sign_image, stage::BuildContext};

pub struct SignCommand {
    pub ctx: BuildContext,
    pub sign_options: SignOptions,
}

#[async_trait]
impl super::Command for SignCommand {
    async fn run(&self) -> Result<()> {
        let signature = sign_image(
            &self.ctx.config.image.path,
            &self.sign_options.key,
            self.sign_options.output.as_deref(),
        )
        .await?;
        println!("{}", signature.display());
        Ok(())
    }
}
