use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::{
    config::Architecture,
    host::Host,
    stage::{bootstrap, customize, finalize, image, BuildContext},
    teardown,
};

pub struct ConfigCheckCommand {
    pub ctx: BuildContext,
}

#[async_trait]
impl super::super::Command for ConfigCheckCommand {
    async fn run(&self) -> Result<()> {
        let config = &self.ctx.config;
        let problems = config.problems();
        for problem in &problems {
            tracing::error!("{problem}");
        }

        let missing = missing_programs(self.ctx.host.as_ref(), config.arch);
        if missing.is_empty() {
            tracing::info!("All required host programs are available");
        } else {
            // Only a warning here, the config may be meant for another machine
            tracing::warn!("Missing host programs: {}", missing.join(", "));
        }

        if !problems.is_empty() {
            bail!("Found {} problem(s) in the build config", problems.len());
        }

        tracing::info!("The build config is valid");
        Ok(())
    }
}

/// Programs the whole pipeline needs on this host for `arch`, in a stable order.
pub fn missing_programs(host: &dyn Host, arch: Architecture) -> Vec<String> {
    let mut wanted = [
        bootstrap::REQUIRED_PROGRAMS,
        customize::REQUIRED_PROGRAMS,
        finalize::REQUIRED_PROGRAMS,
        image::REQUIRED_PROGRAMS,
        teardown::REQUIRED_PROGRAMS,
    ]
    .concat();
    if host.host_arch() != Some(arch) {
        wanted.push(arch.emulator_binary());
    }
    wanted.sort_unstable();
    wanted.dedup();

    wanted
        .into_iter()
        .filter(|program| host.find_program(program).is_none())
        .map(str::to_owned)
        .collect()
}
