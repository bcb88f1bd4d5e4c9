//! Error types for tensor and quantization operations

use thiserror::Error;

/// Errors raised by tensor construction and the quantization bridge
#[derive(Debug, Error)]
pub enum CoreError {
    /// Element count does not match the tensor's fixed shape
    #[error("Shape mismatch for {tensor}: expected {expected} elements, got {actual}")]
    ShapeMismatch {
        tensor: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Buffer representation disagrees with the boundary's quantization state
    #[error("Representation mismatch: expected {expected} buffer, got {actual}")]
    RepresentationMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// Quantization parameters cannot be applied
    #[error("Invalid quantization parameters: {0}")]
    InvalidQuantParameters(String),
}

impl CoreError {
    /// Create a shape mismatch error.
    pub fn shape_mismatch(tensor: &'static str, expected: usize, actual: usize) -> Self {
        CoreError::ShapeMismatch {
            tensor,
            expected,
            actual,
        }
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
