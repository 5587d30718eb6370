//! Error types for clasificar
//!
//! All fallible operations return [`Result`]. Configuration and weight-file
//! problems are surfaced at model-load time; malformed runtime input fails
//! the single inference call without touching loaded weights.

use thiserror::Error;

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum ClasificarError {
    /// Tensor shape is invalid for the requested operation
    #[error("Invalid shape: {reason}")]
    InvalidShape {
        /// Description of the shape violation
        reason: String,
    },

    /// Data buffer size does not match the declared shape
    #[error("Data size {data_size} doesn't match shape {shape:?} (expected {expected})")]
    DataShapeMismatch {
        /// Actual number of elements provided
        data_size: usize,
        /// Declared shape
        shape: Vec<usize>,
        /// Number of elements the shape requires
        expected: usize,
    },

    /// Configuration is invalid (fatal at model-load time)
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Description of the configuration violation
        reason: String,
    },

    /// Inference call failed on malformed runtime input
    #[error("Inference error: {reason}")]
    InferenceError {
        /// Description of the input problem
        reason: String,
    },

    /// Weight file is malformed or inconsistent with its header
    #[error("Format error: {reason}")]
    FormatError {
        /// Description of the format violation
        reason: String,
    },

    /// I/O failure while reading a weight file
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, ClasificarError>;
