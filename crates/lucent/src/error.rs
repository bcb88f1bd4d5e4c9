//! Error types for the sampling pipeline

use lucent_archive::ArchiveError;
use lucent_core::CoreError;
use lucent_solver::SolverError;
use thiserror::Error;

/// Errors raised while configuring or driving a sampling run
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Repository load or lookup failed
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// Solver configuration or stepping failed
    #[error(transparent)]
    Solver(#[from] SolverError),

    /// Quantization or tensor shape failed
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Requested step count has no precomputed embeddings
    #[error("Unsupported step count {requested}: archive provides {supported:?}")]
    UnsupportedStepCount {
        requested: usize,
        supported: Vec<usize>,
    },

    /// Operation not valid in the current run state
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// Accelerator execution failed
    #[error("Accelerator error: {0}")]
    Accelerator(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Create an accelerator error.
    pub fn accelerator(message: impl Into<String>) -> Self {
        PipelineError::Accelerator(message.into())
    }

    /// Error category for logs.
    pub fn category(&self) -> &'static str {
        match self {
            PipelineError::Archive(_) => "archive",
            PipelineError::Solver(_) => "solver",
            PipelineError::Core(_) => "quantization",
            PipelineError::UnsupportedStepCount { .. } => "unsupported_step_count",
            PipelineError::InvalidState { .. } => "invalid_state",
            PipelineError::Accelerator(_) => "accelerator",
            PipelineError::Config(_) => "config",
            PipelineError::Io(_) => "io",
        }
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
