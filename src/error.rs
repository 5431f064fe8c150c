//! Error types shared across the reconstruction pipeline.
//!
//! Fatal conditions are `Err` values. Recoverable ones (non-finite optic axes,
//! a missing voxel-index cache) are handled where they occur and only logged.

use crate::core::VolumeStage;
use crate::io::VolumeFileError;
use crate::optim::StepPhase;
use thiserror::Error;

/// Invalid or contradictory run configuration. Raised before any iteration runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported optimizer '{name}', choose from {supported:?}")]
    UnsupportedOptimizer {
        name: String,
        supported: &'static [&'static str],
    },

    #[error("LBFGS is not supported because it needs a loss closure")]
    LbfgsRequiresClosure,

    #[error("cannot free large arrays and mask volume gradients at the same time")]
    MemoryFreeWithGradientMask,

    #[error("unknown regularization function '{0}'")]
    UnknownRegularizer(String),

    #[error("unknown data-fidelity method '{0}'")]
    UnknownDataFidelity(String),

    #[error("intensity data fidelity requested but no measured intensity images were given")]
    MissingIntensityTargets,

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Errors that halt a reconstruction run.
#[derive(Debug, Error)]
pub enum ReconstructionError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("non-finite {what} gradient in phase {phase:?} at epoch {epoch}")]
    NonFiniteGradient {
        what: &'static str,
        phase: StepPhase,
        epoch: usize,
    },

    #[error("{operation} requires a volume in stage {required:?}, found {actual:?}")]
    StageMismatch {
        operation: &'static str,
        required: VolumeStage,
        actual: VolumeStage,
    },

    #[error("size mismatch for {what}: expected {expected}, got {actual}")]
    SizeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("forward model produced {produced} images but the loss expects {expected}")]
    OutputMismatch {
        produced: &'static str,
        expected: &'static str,
    },

    #[error(transparent)]
    VolumeFile(#[from] VolumeFileError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ReconstructionError>;
