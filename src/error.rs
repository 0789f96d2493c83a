use std::path::PathBuf;

use crate::config::Architecture;

/// Failures that callers are expected to tell apart. Everything else surfaces
/// as a plain [`anyhow::Error`] and is reported as a generic stage failure.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Target {0:?} already exists, refusing to overwrite it")]
    TargetExists(PathBuf),

    #[error("Missing required host programs: {}", .0.join(", "))]
    MissingDependency(Vec<String>),

    #[error("Emulation binary `{binary}` for {arch} is not available on the host, the first-stage tree at {rootfs:?} is kept for manual resume")]
    MissingEmulationLayer {
        arch: Architecture,
        binary: String,
        rootfs: PathBuf,
    },

    #[error("Partition node {0:?} did not appear")]
    PartitionNodeMissing(PathBuf),

    #[error("File not found: {0:?}")]
    NotFound(PathBuf),

    #[error("Signing failed: {0}")]
    SigningError(String),

    #[error("A mount session is already active on {0:?}")]
    SessionActive(PathBuf),

    #[error("Image {image:?} is already attached to {devices:?}")]
    ImageBusy {
        image: PathBuf,
        devices: Vec<PathBuf>,
    },

    #[error("Interrupted")]
    Interrupted,

    #[error("The {stage} stage failed: {message}")]
    StageFailed {
        stage: &'static str,
        message: String,
    },
}

pub const EXIT_STAGE_FAILED: u8 = 1;

impl BuildError {
    pub fn exit_code(&self) -> u8 {
        match self {
            BuildError::TargetExists(_) => 10,
            BuildError::MissingDependency(_) => 11,
            BuildError::MissingEmulationLayer { .. } => 12,
            BuildError::PartitionNodeMissing(_) => 13,
            BuildError::NotFound(_) => 14,
            BuildError::SigningError(_) => 15,
            BuildError::SessionActive(_) => 16,
            BuildError::ImageBusy { .. } => 17,
            BuildError::Interrupted => 130,
            BuildError::StageFailed { .. } => EXIT_STAGE_FAILED,
        }
    }

    /// Find the first [`BuildError`] in the chain of an error, looking through any context layers.
    pub fn find(error: &anyhow::Error) -> Option<&BuildError> {
        error
            .chain()
            .find_map(|cause| cause.downcast_ref::<BuildError>())
    }
}

pub fn exit_code(error: &anyhow::Error) -> u8 {
    BuildError::find(error)
        .map(BuildError::exit_code)
        .unwrap_or(EXIT_STAGE_FAILED)
}
