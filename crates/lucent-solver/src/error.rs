//! Error types for schedule construction and solver stepping

use thiserror::Error;

/// Errors raised by the noise schedule and the multistep solver
#[derive(Debug, Error)]
pub enum SolverError {
    /// Unknown prediction type name
    #[error("Invalid prediction type: {0}")]
    InvalidPredictionType(String),

    /// Unknown algorithm type name
    #[error("Invalid algorithm type: {0}")]
    InvalidAlgorithmType(String),

    /// Unknown solver type name
    #[error("Invalid solver type: {0}")]
    InvalidSolverType(String),

    /// Unknown beta schedule name
    #[error("Invalid beta schedule: {0}")]
    InvalidBetaSchedule(String),

    /// Solver order outside 1..=3
    #[error("Invalid solver order {0}: must be 1, 2 or 3")]
    InvalidSolverOrder(usize),

    /// Trained sequence length disagrees with the training timestep count
    #[error("{name} has {actual} values, expected {expected}")]
    ScheduleLength {
        name: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Inference step count cannot be spaced over the training schedule
    #[error("Cannot run {requested} inference steps over {max} training timesteps")]
    InvalidInferenceSteps { requested: usize, max: usize },

    /// `step` called before `set_timesteps`
    #[error("Inference timesteps not set")]
    TimestepsNotSet,

    /// Timestep outside the training schedule
    #[error("Timestep {timestep} outside [0, {num_train_timesteps})")]
    TimestepOutOfRange {
        timestep: i32,
        num_train_timesteps: usize,
    },

    /// Hyperparameters cannot produce a schedule
    #[error("Invalid solver configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for solver operations
pub type Result<T> = std::result::Result<T, SolverError>;
