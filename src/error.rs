// ============================================================================
// ERRORS: one taxonomy for the pipeline, file I/O and the CLI
// ============================================================================

use thiserror::Error;

/// Top-level error type for all studio operations.
#[derive(Debug, Error)]
pub enum StudioError {
    // -- Pipeline errors --
    #[error("unknown filter: {0}")]
    UnknownFilter(String),

    #[error("unknown blend mode: {0}")]
    UnknownBlendMode(String),

    #[error("invalid parameter for {filter}: {reason}")]
    InvalidParam { filter: String, reason: String },

    #[error("size mismatch: expected {expected_w}x{expected_h}, got {actual_w}x{actual_h}")]
    SizeMismatch {
        expected_w: u32,
        expected_h: u32,
        actual_w: u32,
        actual_h: u32,
    },

    #[error("layer index {index} out of range ({count} layers)")]
    LayerIndex { index: usize, count: usize },

    #[error("operation cancelled")]
    Cancelled,

    #[error("filter job failed: {0}")]
    JobFailed(String),

    // -- File errors --
    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("TIFF encode error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("invalid project file: {0}")]
    Project(String),

    #[error("{what} exceeds limit: {detail}")]
    LimitExceeded { what: &'static str, detail: String },

    #[error("project serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("recipe serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StudioError {
    /// Shorthand for [`StudioError::InvalidParam`].
    pub fn invalid(filter: impl Into<String>, reason: impl Into<String>) -> Self {
        StudioError::InvalidParam {
            filter: filter.into(),
            reason: reason.into(),
        }
    }

    pub fn size_mismatch(expected: (u32, u32), actual: (u32, u32)) -> Self {
        StudioError::SizeMismatch {
            expected_w: expected.0,
            expected_h: expected.1,
            actual_w: actual.0,
            actual_h: actual.1,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StudioError::Cancelled)
    }
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, StudioError>;
