pub mod bootstrap;
pub mod build;
pub mod config;
pub mod customize;
pub mod finalize;
pub mod image;
pub mod keygen;
pub mod sign;
pub mod status;
pub mod teardown;
pub mod verify;

use anyhow::Result;
use async_trait::async_trait;

use crate::{
    cli::{BuildSubcommand, ConfigSubcommand},
    cmd::{
        bootstrap::BootstrapCommand,
        build::BuildCommand,
        config::{check::ConfigCheckCommand, dump::ConfigDumpCommand, template::ConfigTemplateCommand},
        customize::CustomizeCommand,
        finalize::FinalizeCommand,
        image::ImageCommand,
        keygen::KeygenCommand,
        sign::SignCommand,
        status::StatusCommand,
        teardown::TeardownCommand,
        verify::VerifyCommand,
    },
    stage::{BuildContext, StageReport},
};

#[async_trait]
pub trait Command: Send + Sync {
    async fn run(&self) -> Result<()>;
}

pub trait IntoCommand {
    fn into_command(self, ctx: BuildContext) -> Box<dyn Command>;
}

impl IntoCommand for BuildSubcommand {
    fn into_command(self, ctx: BuildContext) -> Box<dyn Command> {
        match self {
            BuildSubcommand::Bootstrap => Box::new(BootstrapCommand { ctx }),
            BuildSubcommand::Customize => Box::new(CustomizeCommand { ctx }),
            BuildSubcommand::Image => Box::new(ImageCommand { ctx }),
            BuildSubcommand::Finalize(finalize_options) => Box::new(FinalizeCommand {
                ctx,
                finalize_options,
            }),
            BuildSubcommand::Build(build_options) => Box::new(BuildCommand { ctx, build_options }),
            BuildSubcommand::Sign(sign_options) => Box::new(SignCommand { ctx, sign_options }),
            BuildSubcommand::Verify(verify_options) => {
                Box::new(VerifyCommand { ctx, verify_options })
            }
            BuildSubcommand::Keygen(keygen_options) => Box::new(KeygenCommand { keygen_options }),
            BuildSubcommand::Status => Box::new(StatusCommand { ctx }),
            BuildSubcommand::Teardown => Box::new(TeardownCommand { ctx }),
            BuildSubcommand::Config(config_options) => match config_options.command {
                ConfigSubcommand::Template => Box::new(ConfigTemplateCommand),
                ConfigSubcommand::Dump => Box::new(ConfigDumpCommand { ctx }),
                ConfigSubcommand::Check => Box::new(ConfigCheckCommand { ctx }),
            },
        }
    }
}

/// Print what a finished stage skipped.
pub(crate) fn log_report(stage: &str, report: &StageReport) {
    if report.is_clean() {
        tracing::info!("The {stage} stage finished");
        return;
    }

    tracing::warn!(
        "The {stage} stage finished with {} skipped step(s)",
        report.warnings.len()
    );
    for warning in &report.warnings {
        tracing::warn!("  {warning}");
    }
}
