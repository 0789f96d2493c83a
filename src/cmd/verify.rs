use anyhow::Result;
use async_trait::async_trait;

use crate::{
    cli::VerifyOptions,
    sign::{default_signature_path, verify_image},
    stage::BuildContext,
};

pub struct VerifyCommand {
    pub ctx: BuildContext,
    pub verify_options: VerifyOptions,
}

#[async_trait]
impl super::Command for VerifyCommand {
    async fn run(&self) -> Result<()> {
        let image = &self.ctx.config.image.path;
        let signature = self
            .verify_options
            .signature
            .clone()
            .unwrap_or_else(|| default_signature_path(image));

        verify_image(image, &signature, &self.verify_options.public_key).await?;
        println!("OK");
        Ok(())
    }
}
