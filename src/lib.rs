pub mod cli;
pub mod cmd;
pub mod config;
pub mod error;
pub mod fs;
pub mod host;
pub mod sign;
pub mod stage;
pub mod teardown;

use std::{future::Future, sync::Arc};

use anyhow::{bail, Context as _, Result};
use clap::Parser as _;
use cmd::{Command, IntoCommand as _};
use error::BuildError;
use host::{system::SystemHost, Host};
use shadow_rs::shadow;
use stage::BuildContext;
use teardown::{compensate, TeardownTargets};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

shadow!(build);

pub async fn run() -> Result<()> {
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let (filter, reload_handle) = tracing_subscriber::reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = cli::Cli::parse();

    if args.verbose {
        reload_handle
            .modify(|filter| *filter = "debug".into())
            .context("Failed to update log level to DEBUG")?;
        tracing::debug!("Log level set to DEBUG");
    }

    tracing::debug!(
        "simetrio version: v{}  commit: {}  buildtime: {}",
        build::PKG_VERSION,
        build::COMMIT_HASH,
        build::BUILD_TIME
    );

    let mut config = config::source::load_config(args.config.as_deref()).await?;
    args.overrides.apply(&mut config);

    let command = args.command;
    if command.validates_config() {
        config.validate()?;
    }
    if command.needs_root() && !nix::unistd::Uid::effective().is_root() {
        bail!("This command mounts filesystems and attaches loop devices, run it as root");
    }

    let compensate_on_interrupt = command.needs_root();
    let targets = TeardownTargets::from_config(&config);
    let host = Arc::new(SystemHost::new());
    let command = command.into_command(BuildContext::new(config, host.clone()));

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to listen for SIGINT")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
    let shutdown = async move {
        tokio::select! {
            _ = sigint.recv() => tracing::warn!("Received SIGINT"),
            _ = sigterm.recv() => tracing::warn!("Received SIGTERM"),
        }
    };

    let cleanup = compensate_on_interrupt.then_some((host.as_ref() as &dyn Host, &targets));
    run_interruptible(command.as_ref(), shutdown, cleanup).await
}

/// Run `command` until it finishes or `shutdown` resolves. On shutdown the command is dropped,
/// so its guards release what they hold, and then whatever is still held for `cleanup` is
/// released from the host tables.
pub(crate) async fn run_interruptible(
    command: &dyn Command,
    shutdown: impl Future<Output = ()>,
    cleanup: Option<(&dyn Host, &TeardownTargets)>,
) -> Result<()> {
    tokio::select! {
        result = command.run() => result,
        _ = shutdown => {
            tracing::warn!("Interrupted, releasing leftover mounts and loop devices");
            if let Some((host, targets)) = cleanup {
                let report = compensate(host, targets).await;
                if !report.failures.is_empty() {
                    tracing::error!("Some resources could not be released, run `simetrio teardown` again");
                }
            }
            Err(BuildError::Interrupted.into())
        }
    }
}

/// A macro like scopeguard::defer! but can defer a future.
///
/// Note that other code running concurrently in the same task will be suspended
/// due to the call to block_in_place, until the future is finished.
///
/// # Examples
///
/// ```ignore
/// async_defer!(async {
///     // Do some cleanup
/// });
/// ```
///
/// # Panics
///
/// This macro should only be used in tokio multi-thread runtime, and will panics
/// if called from a [`current_thread`] runtime.
///
#[macro_export]
macro_rules! async_defer {
    ($future:expr) => {
        scopeguard::defer! {
            tokio::task::block_in_place(|| {
                tokio::runtime::Handle::current().block_on(async {
                    let _ = $future.await;
                });
            });
        }
    };
}
