use anyhow::Result;
use async_trait::async_trait;

use crate::{config::template::annotated_toml, stage::BuildContext};

pub struct ConfigDumpCommand {
    pub ctx: BuildContext,
}

#[async_trait]
impl super::super::Command for ConfigDumpCommand {
    async fn run(&self) -> Result<()> {
        print!("{}", annotated_toml(&self.ctx.config)?);
        Ok(())
    }
}
