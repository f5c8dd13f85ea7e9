use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while configuring or running an attack.
#[derive(Error, Debug)]
pub enum DeltaError {
    /// Invalid run configuration (detected before any optimization work).
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Unknown model '{name}' (supported: {supported})")]
    UnknownModel { name: String, supported: String },

    /// Targeted mode is active but the image has no entry in the target mapping.
    #[error("No target label for image '{name}'")]
    MissingTarget { name: String },

    /// Decode or I/O failure for a single image. Recoverable per image.
    #[error("Failed to load image {}: {reason}", path.display())]
    ImageLoad { path: PathBuf, reason: String },

    /// Worker threads still running after the shutdown grace period.
    #[error("{pending} worker thread(s) did not stop within {grace_ms} ms")]
    ShutdownTimeout { pending: usize, grace_ms: u64 },

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("NPY error: {0}")]
    Npy(String),
}

impl DeltaError {
    /// True for errors that abort the whole run.
    ///
    /// Image load failures and shutdown timeouts are reported and the run
    /// continues with whatever was produced.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            DeltaError::ImageLoad { .. } | DeltaError::ShutdownTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DeltaError>;
