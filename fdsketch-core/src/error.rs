//! Error types for the sketching core.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SketchError {
    /// Rejected before any data is touched
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Row width does not match the sketch feature dimension
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// The SVD did not converge. Never recovered locally.
    #[error("Decomposition failed: {0}")]
    Decomposition(String),
}

/// Result type alias for sketching operations.
pub type Result<T> = std::result::Result<T, SketchError>;
