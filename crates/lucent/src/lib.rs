//! # Lucent
//!
//! Diffusion sampling engine for fixed-point accelerators.
//!
//! Lucent drives the host side of a latent diffusion run. It loads the
//! precomputed inputs from a tensor archive, steps a multistep DPM-Solver
//! with classifier-free guidance, and moves every tensor across the
//! accelerator boundary through the 16-bit quantization bridge. The
//! networks themselves run behind the [`Accelerator`] trait.
//!
//! ## Quick Start
//!
//! ```ignore
//! use lucent::{DecodeCadence, EngineConfig, GenerationRequest, Pipeline};
//!
//! let config = EngineConfig::from_json_file("engine.json")?;
//! let mut pipeline = Pipeline::from_config(&config, my_accelerator)?;
//!
//! let request = GenerationRequest::new("a lighthouse at dusk", 42, 20);
//! let latent = pipeline.run(&request, DecodeCadence::default(), |frame| {
//!     println!("decoded step {}/{}", frame.step, frame.total_steps);
//! })?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Pipeline                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  TensorRepository ──> initial latent, timestep embeddings,      │
//! │   (lucent-archive)     unconditional text embedding             │
//! │                                                                 │
//! │        ┌──────────── quantize ────────────┐                     │
//! │        ↓                                  │                     │
//! │  ┌─────────────┐  uncond / cond   ┌──────────────┐              │
//! │  │ Accelerator │ ───────────────> │ dequantize   │              │
//! │  │  (denoise)  │                  └──────┬───────┘              │
//! │  └─────────────┘                         ↓                      │
//! │                                 MultistepSolver::step           │
//! │                                   (lucent-solver)               │
//! │                                          │                      │
//! │                     DecodeCadence ──> Accelerator::decode       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod accelerator;
mod cadence;
mod config;
mod error;
mod pipeline;

pub use accelerator::{Accelerator, BoundaryQuant, GuidancePass, UnetInputs};
pub use cadence::{DecodeCadence, DEFAULT_DECODE_INTERVAL, DEFAULT_DECODE_START};
pub use config::{EngineConfig, DEFAULT_GUIDANCE_SCALE, DEFAULT_STEP_COUNT};
pub use error::{PipelineError, Result};
pub use pipeline::{
    DecodedFrame, GenerationRequest, Pipeline, PipelineStats, RunState, StepReport,
};

pub use lucent_archive;
pub use lucent_core;
pub use lucent_solver;

/// Prelude for common imports
pub mod prelude {
    pub use super::{
        Accelerator, BoundaryQuant, DecodeCadence, EngineConfig, GenerationRequest, Pipeline,
        PipelineError, Result, RunState, UnetInputs,
    };
    pub use lucent_core::{DeviceBuffer, Latent, QuantParameters};
}
