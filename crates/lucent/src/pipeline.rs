//! Per-request sampling orchestration

use crate::{
    Accelerator, BoundaryQuant, DecodeCadence, EngineConfig, GuidancePass, PipelineError, Result,
    UnetInputs,
};
use lucent_archive::TensorRepository;
use lucent_core::{dequantize_into, quantize_tensor, requantize_tensor, DeviceBuffer, Latent};
use lucent_solver::{GuidedPrediction, MultistepSolver, SolverConfig, StepOrder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// One sampling request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Prompt for the conditional branch
    pub prompt: String,
    /// Seed selecting the precomputed initial latent
    pub seed: i32,
    /// Inference steps; must have precomputed embeddings
    pub step_count: usize,
    /// Classifier-free guidance scale
    pub guidance_scale: f32,
}

impl GenerationRequest {
    /// Request with the default guidance scale.
    pub fn new(prompt: impl Into<String>, seed: i32, step_count: usize) -> Self {
        Self {
            prompt: prompt.into(),
            seed,
            step_count,
            guidance_scale: crate::DEFAULT_GUIDANCE_SCALE,
        }
    }

    /// Request using the configured step count and guidance scale.
    pub fn from_config(config: &EngineConfig, prompt: impl Into<String>, seed: i32) -> Self {
        Self {
            prompt: prompt.into(),
            seed,
            step_count: config.default_step_count,
            guidance_scale: config.default_guidance_scale,
        }
    }

    pub fn with_guidance_scale(mut self, guidance_scale: f32) -> Self {
        self.guidance_scale = guidance_scale;
        self
    }
}

/// State of the current run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// No run prepared
    Idle,
    /// Inputs prepared, no step taken
    PreProcessed,
    /// Steps taken, more remaining
    Stepping { next_step: usize },
    /// All steps taken
    Complete,
    /// A step failed; call `pre_process` again
    Failed,
}

impl RunState {
    fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::PreProcessed => "pre-processed",
            RunState::Stepping { .. } => "stepping",
            RunState::Complete => "complete",
            RunState::Failed => "failed",
        }
    }
}

/// Outcome of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepReport {
    /// 0-based index of the step just taken
    pub step_index: usize,
    /// Training timestep the step started from
    pub timestep: i32,
    /// Update order the solver used
    pub order: StepOrder,
    /// Whether this was the last step of the run
    pub is_final: bool,
}

/// Decoder output handed to a run callback
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    /// 1-based step number
    pub step: usize,
    /// Steps in the run
    pub total_steps: usize,
    /// Raw decoder output
    pub output: DeviceBuffer,
}

impl DecodedFrame {
    pub fn is_final(&self) -> bool {
        self.step == self.total_steps
    }
}

/// Pipeline statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    /// Runs prepared
    pub runs_started: u64,
    /// Runs whose last step completed
    pub runs_completed: u64,
    /// Steps completed
    pub steps: u64,
    /// Accelerator calls issued
    pub accelerator_calls: u64,
    /// Decodes issued
    pub decodes: u64,
    /// Average step latency in ms
    pub avg_step_ms: f64,
    /// Min step latency in ms
    pub min_step_ms: f64,
    /// Max step latency in ms
    pub max_step_ms: f64,
}

impl PipelineStats {
    /// Record a completed step
    pub fn record_step(&mut self, latency_ms: f64) {
        if self.steps == 0 {
            self.min_step_ms = latency_ms;
            self.max_step_ms = latency_ms;
            self.avg_step_ms = latency_ms;
        } else {
            self.min_step_ms = self.min_step_ms.min(latency_ms);
            self.max_step_ms = self.max_step_ms.max(latency_ms);
            self.avg_step_ms =
                (self.avg_step_ms * self.steps as f64 + latency_ms) / (self.steps + 1) as f64;
        }
        self.steps += 1;
    }
}

#[derive(Debug)]
struct ActiveRun {
    step_count: usize,
    seed: i32,
    latent: Latent,
    conditional_text: DeviceBuffer,
    next_step: usize,
}

/// Drives sampling runs against an accelerator.
///
/// The repository is shared read-only; the solver, the working latent and
/// the conditional embedding belong to the pipeline and are replaced on each
/// [`pre_process`](Self::pre_process).
pub struct Pipeline<A: Accelerator> {
    repository: Arc<TensorRepository>,
    accelerator: A,
    quant: BoundaryQuant,
    solver: MultistepSolver,
    unconditional_text: DeviceBuffer,
    run: Option<ActiveRun>,
    state: RunState,
    stats: PipelineStats,
}

impl<A: Accelerator> Pipeline<A> {
    /// Build a pipeline. The unconditional text embedding is quantized once
    /// here and reused by every run.
    pub fn new(
        repository: Arc<TensorRepository>,
        accelerator: A,
        quant: BoundaryQuant,
        solver_config: SolverConfig,
    ) -> Result<Self> {
        quant.validate()?;
        let solver = MultistepSolver::new(solver_config)?;
        let unconditional_text = quantize_tensor(
            repository.unconditional_text_embedding()?.as_slice(),
            &quant.unet_text_in,
        );
        let step_counts = repository.supported_step_counts()?;
        let seeds = repository.initial_latent_count()?;
        info!(?step_counts, seeds, "Pipeline ready");
        Ok(Self {
            repository,
            accelerator,
            quant,
            solver,
            unconditional_text,
            run: None,
            state: RunState::Idle,
            stats: PipelineStats::default(),
        })
    }

    /// Load the archive and trained schedule files named by `config`.
    pub fn from_config(config: &EngineConfig, accelerator: A) -> Result<Self> {
        config.validate()?;
        let repository = Arc::new(config.open_repository()?);
        Self::new(
            repository,
            accelerator,
            config.quant,
            config.resolved_solver_config()?,
        )
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn solver(&self) -> &MultistepSolver {
        &self.solver
    }

    pub fn repository(&self) -> &Arc<TensorRepository> {
        &self.repository
    }

    pub fn accelerator(&self) -> &A {
        &self.accelerator
    }

    pub fn accelerator_mut(&mut self) -> &mut A {
        &mut self.accelerator
    }

    /// Working latent of the current run
    pub fn latent(&self) -> Option<&Latent> {
        self.run.as_ref().map(|run| &run.latent)
    }

    /// Prepare a run: validate the request, set up the solver, encode the
    /// prompt and copy the seed's initial latent.
    ///
    /// Any previous run is discarded, even when preparation fails.
    pub fn pre_process(&mut self, request: &GenerationRequest) -> Result<()> {
        self.run = None;
        self.state = RunState::Idle;

        let supported = self.repository.supported_step_counts()?;
        if !supported.contains(&request.step_count) {
            error!(requested = request.step_count, ?supported, "Unsupported step count");
            return Err(PipelineError::UnsupportedStepCount {
                requested: request.step_count,
                supported,
            });
        }
        let mut latent = self.repository.initial_latent(request.seed)?.clone();

        self.solver.set_timesteps(request.step_count)?;
        self.solver.set_guidance_scale(request.guidance_scale);
        let init_sigma = self.solver.init_noise_sigma();
        latent.iter_mut().for_each(|v| *v *= init_sigma);
        self.check_timesteps(request.step_count)?;

        let encoded = self.accelerator.encode_prompt(&request.prompt)?;
        self.stats.accelerator_calls += 1;
        let conditional_text =
            requantize_tensor(&encoded, &self.quant.text_encoder_out, &self.quant.unet_text_in)?;
        if conditional_text.len() != self.unconditional_text.len() {
            return Err(PipelineError::accelerator(format!(
                "text encoder produced {} values, expected {}",
                conditional_text.len(),
                self.unconditional_text.len()
            )));
        }

        info!(
            seed = request.seed,
            step_count = request.step_count,
            guidance_scale = request.guidance_scale,
            "Run prepared"
        );
        self.run = Some(ActiveRun {
            step_count: request.step_count,
            seed: request.seed,
            latent,
            conditional_text,
            next_step: 0,
        });
        self.state = RunState::PreProcessed;
        self.stats.runs_started += 1;
        Ok(())
    }

    /// Precomputed timesteps should match the solver's spacing; when they do
    /// not, the solver treats unknown timesteps as the final step.
    fn check_timesteps(&self, step_count: usize) -> Result<()> {
        let Some(group) = self.repository.step_group(step_count)? else {
            return Ok(());
        };
        if group.timesteps() != self.solver.timesteps() {
            warn!(
                step_count,
                archive = ?group.timesteps(),
                solver = ?self.solver.timesteps(),
                "Archive timesteps differ from solver timesteps"
            );
        }
        Ok(())
    }

    /// Take the next denoising step.
    ///
    /// On failure the run is discarded and the state becomes
    /// [`RunState::Failed`].
    pub fn step(&mut self) -> Result<StepReport> {
        match self.state {
            RunState::PreProcessed | RunState::Stepping { .. } => {}
            other => {
                return Err(PipelineError::InvalidState {
                    expected: "pre-processed or stepping",
                    actual: other.as_str(),
                })
            }
        }
        let Some(mut run) = self.run.take() else {
            return Err(PipelineError::InvalidState {
                expected: "active run",
                actual: self.state.as_str(),
            });
        };

        match self.execute_step(&mut run) {
            Ok(report) => {
                self.state = if report.is_final {
                    self.stats.runs_completed += 1;
                    info!(seed = run.seed, steps = run.step_count, "Run complete");
                    RunState::Complete
                } else {
                    RunState::Stepping {
                        next_step: run.next_step,
                    }
                };
                self.run = Some(run);
                Ok(report)
            }
            Err(e) => {
                error!(step = run.next_step, category = e.category(), error = %e, "Step failed, run aborted");
                self.state = RunState::Failed;
                Err(e)
            }
        }
    }

    fn execute_step(&mut self, run: &mut ActiveRun) -> Result<StepReport> {
        let start = Instant::now();
        let step_index = run.next_step;

        let repository = Arc::clone(&self.repository);
        let group = repository
            .step_group(run.step_count)?
            .ok_or_else(|| PipelineError::UnsupportedStepCount {
                requested: run.step_count,
                supported: repository.supported_step_counts().unwrap_or_default(),
            })?;
        let timestep = group.timestep(step_index);
        let timestep_in = quantize_tensor(group.embedding(step_index), &self.quant.unet_timestep_in);
        let latent_in = quantize_tensor(&run.latent, &self.quant.unet_latent_in);

        let unconditional_out = self.accelerator.denoise(UnetInputs {
            pass: GuidancePass::Unconditional,
            text_embedding: &self.unconditional_text,
            timestep_embedding: &timestep_in,
            latent: &latent_in,
        })?;
        let conditional_out = self.accelerator.denoise(UnetInputs {
            pass: GuidancePass::Conditional,
            text_embedding: &run.conditional_text,
            timestep_embedding: &timestep_in,
            latent: &latent_in,
        })?;
        self.stats.accelerator_calls += 2;

        let prediction = GuidedPrediction {
            unconditional: dequantize_into(&unconditional_out, &self.quant.unet_out)?,
            conditional: dequantize_into(&conditional_out, &self.quant.unet_out)?,
        };
        run.latent = self.solver.step(&prediction, timestep, &run.latent)?;
        run.next_step += 1;

        let order = self.solver.last_order().unwrap_or(StepOrder::First);
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.stats.record_step(latency_ms);
        debug!(step_index, timestep, order = order.as_usize(), latency_ms, "Step complete");

        Ok(StepReport {
            step_index,
            timestep,
            order,
            is_final: run.next_step >= run.step_count,
        })
    }

    /// Quantize the working latent for the decoder and return its raw output.
    pub fn decode(&mut self) -> Result<DeviceBuffer> {
        let run = self.run.as_ref().ok_or(PipelineError::InvalidState {
            expected: "active run",
            actual: self.state.as_str(),
        })?;
        let decoder_in = quantize_tensor(&run.latent, &self.quant.decoder_in);
        let output = self.accelerator.decode(&decoder_in)?;
        self.stats.accelerator_calls += 1;
        self.stats.decodes += 1;
        debug!(step = run.next_step, bytes = output.size_bytes(), "Latent decoded");
        Ok(output)
    }

    /// Run every step of `request`, decoding according to `cadence`.
    ///
    /// Returns the final latent.
    pub fn run<F>(
        &mut self,
        request: &GenerationRequest,
        cadence: DecodeCadence,
        mut on_decode: F,
    ) -> Result<Latent>
    where
        F: FnMut(DecodedFrame),
    {
        self.pre_process(request)?;
        let total_steps = request.step_count;
        for step in 1..=total_steps {
            self.step()?;
            if cadence.should_decode(step, total_steps) {
                let output = self.decode()?;
                on_decode(DecodedFrame {
                    step,
                    total_steps,
                    output,
                });
            }
        }
        self.latent().cloned().ok_or(PipelineError::InvalidState {
            expected: "complete",
            actual: self.state.as_str(),
        })
    }

    /// Discard the current run.
    pub fn abort(&mut self) {
        if self.run.take().is_some() {
            info!("Run aborted");
        }
        self.state = RunState::Idle;
    }
}

impl<A: Accelerator + std::fmt::Debug> std::fmt::Debug for Pipeline<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("accelerator", &self.accelerator)
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish()
    }
}
