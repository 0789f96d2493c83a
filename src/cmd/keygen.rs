use anyhow::Result;
use async_trait::async_trait;

use crate::{cli::KeygenOptions, sign::generate_keypair};

pub struct KeygenCommand {
    pub keygen_options: KeygenOptions,
}

#[async_trait]
impl super::Command for KeygenCommand {
    async fn run(&self) -> Result<()> {
        generate_keypair(
            &self.keygen_options.private_key,
            &self.keygen_options.public_key,
        )
        .await
    }
}
