use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::{
    host::require_programs,
    stage::BuildContext,
    teardown::{compensate, TeardownTargets, REQUIRED_PROGRAMS},
};

pub struct TeardownCommand {
    pub ctx: BuildContext,
}

#[async_trait]
impl super::Command for TeardownCommand {
    async fn run(&self) -> Result<()> {
        require_programs(self.ctx.host.as_ref(), REQUIRED_PROGRAMS)?;
        let targets = TeardownTargets::from_config(&self.ctx.config);
        let report = compensate(self.ctx.host.as_ref(), &targets).await;

        if report.is_empty() {
            tracing::info!("Nothing to release");
            return Ok(());
        }

        tracing::info!(
            "Released {} mount(s) and {} loop device(s)",
            report.unmounted.len(),
            report.detached.len()
        );
        if !report.failures.is_empty() {
            bail!(
                "Failed to release some resources:\n\t{}",
                report.failures.join("\n\t")
            );
        }
        Ok(())
    }
}
