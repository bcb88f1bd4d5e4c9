//! Noise Schedules and Multistep Sampling
//!
//! DPM-Solver and DPM-Solver++ of order 1 to 3 over a discrete training
//! noise schedule, with classifier-free guidance applied inside each step.
//!
//! # Step Flow
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │  uncond ─┐                                                     │
//! │          ├─> fuse(g) ─> convert ─> history ring ─┐             │
//! │  cond  ──┘                         [m2 m1 m0]    │             │
//! │                                                  ↓             │
//! │  sample ───────────────────────────────> order 1 / 2 / 3 update │
//! │                                                  │             │
//! │                                                  ↓             │
//! │                                             next sample        │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Order Selection
//!
//! | Condition                                   | Order |
//! |---------------------------------------------|-------|
//! | `solver_order == 1` or no prior step        | 1     |
//! | final step of a run shorter than 15 steps   | 1     |
//! | `solver_order == 2` or one prior step       | 2     |
//! | second-to-last step of a short run          | 2     |
//! | otherwise                                   | 3     |

mod config;
mod error;
pub mod schedule;
mod solver;

pub use config::{AlgorithmType, BetaSchedule, PredictionType, SolverConfig, SolverType};
pub use error::{Result, SolverError};
pub use schedule::{Coefficients, NoiseSchedule};
pub use solver::{
    convert_value, GuidedPrediction, MultistepSolver, SolverPhase, StepOrder, EXP_BASE,
    LOWER_ORDER_FINAL_MAX_STEPS, MAX_ORDER,
};

/// Default number of training timesteps
pub const DEFAULT_TRAIN_TIMESTEPS: usize = 1000;

/// Prelude for common imports
pub mod prelude {
    pub use super::{GuidedPrediction, MultistepSolver, Result, SolverConfig, SolverError};
}
