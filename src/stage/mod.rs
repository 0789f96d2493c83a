//! The build pipeline: bootstrap, customize, image, finalize.
//!
//! Stages run strictly one after another and hand each other paths. Steps that only add
//! convenience are non-fatal: their failures are logged and collected in a [`StageReport`].

pub mod apt;
pub mod bootstrap;
pub mod customize;
pub mod finalize;
pub mod image;

use std::{
    fmt::Display,
    os::unix::fs::PermissionsExt as _,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context as _, Result};

use crate::{config::BuildConfig, error::BuildError, host::Host};

/// What every stage gets: the immutable build settings and the machine to act on.
#[derive(Clone)]
pub struct BuildContext {
    pub config: BuildConfig,
    pub host: Arc<dyn Host>,
}

impl BuildContext {
    pub fn new(config: BuildConfig, host: Arc<dyn Host>) -> Self {
        Self { config, host }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Created by this run.
    Bootstrapped,
    /// Already on disk and accepted as is.
    PreExisting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootfsTree {
    pub path: PathBuf,
    pub provenance: Provenance,
}

impl RootfsTree {
    /// A tree left by an earlier run, as used by the stages that are invoked on their own.
    pub fn existing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            provenance: Provenance::PreExisting,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageWarning {
    pub step: &'static str,
    pub message: String,
}

impl Display for StageWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.step, self.message)
    }
}

/// Outcome of a stage that completed, possibly with some steps skipped.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub warnings: Vec<StageWarning>,
}

impl StageReport {
    /// Keep going when `result` is an error, remembering it as a warning. Returns whether the step succeeded.
    pub fn non_fatal<T>(&mut self, step: &'static str, result: Result<T>) -> bool {
        match result {
            Ok(_) => true,
            Err(error) => {
                tracing::warn!(step, "Non-fatal step failed: {error:#}");
                self.warnings.push(StageWarning {
                    step,
                    message: format!("{error:#}"),
                });
                false
            }
        }
    }

    pub fn merge(&mut self, other: StageReport) {
        self.warnings.extend(other.warnings);
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Step name of the warning left when a stage could not release what it mounted or attached.
pub const TEARDOWN_STEP: &str = "teardown";

/// Account for resources a stage failed to release: a finished stage gets a warning, a failed
/// one more context, both telling the operator how to clean up.
pub(crate) fn after_release(
    result: Result<StageReport>,
    released: bool,
    what: impl Display,
) -> Result<StageReport> {
    if released {
        return result;
    }

    let message = format!("{what} could not be fully released, run `simetrio teardown` to clean up");
    match result {
        Ok(mut report) => {
            tracing::warn!("{message}");
            report.warnings.push(StageWarning {
                step: TEARDOWN_STEP,
                message,
            });
            Ok(report)
        }
        Err(error) => Err(error.context(message)),
    }
}

/// Write `content` to `relative` inside `root`, creating parent directories.
pub(crate) async fn write_into(root: &Path, relative: &str, content: &str, mode: u32) -> Result<()> {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, content)
        .await
        .with_context(|| format!("Failed to write {path:?}"))?;
    tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

/// Stages working on an existing tree need it to be there.
pub(crate) fn ensure_tree(root: &Path) -> Result<()> {
    if !root.is_dir() {
        return Err(BuildError::NotFound(root.to_owned()).into());
    }
    Ok(())
}
