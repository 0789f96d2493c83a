use anyhow::Result;
use async_trait::async_trait;

use crate::config::{template::render_template, BuildConfig};

pub struct ConfigTemplateCommand;

#[async_trait]
impl super::super::Command for ConfigTemplateCommand {
    async fn run(&self) -> Result<()> {
        print!("{}", render_template(&BuildConfig::default())?);
        Ok(())
    }
}
