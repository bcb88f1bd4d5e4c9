//! Multistep DPM-Solver / DPM-Solver++
//!
//! Advances a latent from high noise to low noise over the inference
//! timesteps. Each call to [`MultistepSolver::step`] fuses the guided
//! predictions, converts them to the algorithm's internal representation,
//! records the result in a short history and applies a first, second or
//! third order update depending on how much history is available.

use crate::schedule::{linspace, Coefficients, NoiseSchedule};
use crate::{AlgorithmType, PredictionType, Result, SolverConfig, SolverError, SolverType};
use lucent_core::Latent;
use rayon::prelude::*;
use smallvec::SmallVec;
use tracing::{debug, warn};

/// Base of the exponential used in update weights
pub const EXP_BASE: f64 = 2.71828185;

/// Runs shorter than this drop to lower orders on their final steps
pub const LOWER_ORDER_FINAL_MAX_STEPS: usize = 15;

/// Highest supported solver order
pub const MAX_ORDER: usize = 3;

#[inline]
fn exp(x: f32) -> f32 {
    EXP_BASE.powf(x as f64) as f32
}

/// Unconditional and conditional predictions for the same timestep.
#[derive(Debug, Clone, PartialEq)]
pub struct GuidedPrediction {
    pub unconditional: Latent,
    pub conditional: Latent,
}

impl GuidedPrediction {
    /// Classifier-free guidance: `uncond + scale * (cond - uncond)`.
    pub fn fuse(&self, guidance_scale: f32) -> Latent {
        let mut fused = Latent::zeros();
        fused
            .par_iter_mut()
            .zip(self.unconditional.par_iter())
            .zip(self.conditional.par_iter())
            .for_each(|((out, &u), &c)| *out = u + guidance_scale * (c - u));
        fused
    }
}

/// Update order applied by a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StepOrder {
    First = 1,
    Second = 2,
    Third = 3,
}

impl StepOrder {
    pub fn as_usize(&self) -> usize {
        *self as usize
    }
}

/// Solver lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverPhase {
    /// Schedule built, no inference timesteps yet
    Constructed,
    /// Timesteps set, no step taken
    TimestepsSet,
    /// At least one step taken
    Stepping,
    /// Final inference timestep consumed
    Done,
}

/// Convert one element of a model output.
#[inline]
pub fn convert_value(
    algorithm: AlgorithmType,
    prediction: PredictionType,
    raw: f32,
    sample: f32,
    alpha: f32,
    sigma: f32,
) -> f32 {
    match (algorithm, prediction) {
        (AlgorithmType::DpmSolverPlusPlus, PredictionType::Epsilon) => {
            (sample - sigma * raw) * (1.0 / alpha)
        }
        (AlgorithmType::DpmSolverPlusPlus, PredictionType::Sample) => raw,
        (AlgorithmType::DpmSolverPlusPlus, PredictionType::VPrediction) => alpha * sample - sigma * raw,
        (AlgorithmType::DpmSolver, PredictionType::Epsilon) => raw,
        (AlgorithmType::DpmSolver, PredictionType::Sample) => (sample - alpha * raw) * (1.0 / sigma),
        (AlgorithmType::DpmSolver, PredictionType::VPrediction) => alpha * raw + sigma * sample,
    }
}

/// Variable-order multistep sampler.
///
/// ```text
/// Constructed ── set_timesteps ──> TimestepsSet ── step ──> Stepping ── last step ──> Done
///      ^                                                                               │
///      └──────────────────────────────── set_timesteps ────────────────────────────────┘
/// ```
#[derive(Debug)]
pub struct MultistepSolver {
    config: SolverConfig,
    schedule: NoiseSchedule,
    timesteps: Vec<i32>,
    /// Ring of converted outputs, `solver_order` slots.
    history: SmallVec<[Latent; MAX_ORDER]>,
    /// Slot holding the newest entry
    newest: usize,
    /// Occupied slots
    filled: usize,
    lower_order_nums: usize,
    guidance_scale: f32,
    phase: SolverPhase,
    last_order: Option<StepOrder>,
}

impl MultistepSolver {
    /// Build the noise schedule and an empty history.
    pub fn new(config: SolverConfig) -> Result<Self> {
        config.validate()?;
        let schedule = NoiseSchedule::from_config(&config)?;
        let history = (0..config.solver_order).map(|_| Latent::zeros()).collect();
        debug!(
            order = config.solver_order,
            algorithm = %config.algorithm_type,
            prediction = %config.prediction_type,
            solver_type = %config.solver_type,
            "Multistep solver created"
        );
        Ok(Self {
            config,
            schedule,
            timesteps: Vec::new(),
            history,
            newest: 0,
            filled: 0,
            lower_order_nums: 0,
            guidance_scale: 1.0,
            phase: SolverPhase::Constructed,
            last_order: None,
        })
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    /// Inference timesteps, noisiest first
    pub fn timesteps(&self) -> &[i32] {
        &self.timesteps
    }

    pub fn phase(&self) -> SolverPhase {
        self.phase
    }

    pub fn guidance_scale(&self) -> f32 {
        self.guidance_scale
    }

    /// Order used by the most recent step
    pub fn last_order(&self) -> Option<StepOrder> {
        self.last_order
    }

    /// Occupied history slots
    pub fn history_len(&self) -> usize {
        self.filled
    }

    /// Scale of the initial noise
    pub fn init_noise_sigma(&self) -> f32 {
        1.0
    }

    /// Space `num_inference_steps` timesteps over the training schedule and
    /// reset the history.
    ///
    /// `num_inference_steps + 1` points are spaced over `[0, N - 1]`, rounded,
    /// reversed, and the trailing `t = 0` point is dropped.
    pub fn set_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        let max = self.config.num_train_timesteps;
        if num_inference_steps == 0 || num_inference_steps > max {
            return Err(SolverError::InvalidInferenceSteps {
                requested: num_inference_steps,
                max,
            });
        }

        let mut timesteps: Vec<i32> = linspace(0.0, (max - 1) as f64, num_inference_steps + 1)
            .into_iter()
            .map(|t| (t as f32).round() as i32)
            .collect();
        timesteps.reverse();
        timesteps.pop();

        debug!(num_inference_steps, first = timesteps[0], "Inference timesteps set");
        self.timesteps = timesteps;
        self.newest = 0;
        self.filled = 0;
        self.lower_order_nums = 0;
        self.last_order = None;
        self.phase = SolverPhase::TimestepsSet;
        Ok(())
    }

    pub fn set_guidance_scale(&mut self, guidance_scale: f32) {
        self.guidance_scale = guidance_scale;
    }

    /// Convert a fused model output at `timestep` into the algorithm's
    /// internal representation.
    pub fn convert_model_output(
        &self,
        model_output: &Latent,
        timestep: i32,
        sample: &Latent,
    ) -> Result<Latent> {
        let Coefficients { alpha, sigma, .. } = self.schedule.coefficients(timestep)?;
        let (algorithm, prediction) = (self.config.algorithm_type, self.config.prediction_type);
        let mut converted = Latent::zeros();
        converted
            .par_iter_mut()
            .zip(model_output.par_iter())
            .zip(sample.par_iter())
            .for_each(|((out, &raw), &s)| {
                *out = convert_value(algorithm, prediction, raw, s, alpha, sigma)
            });
        Ok(converted)
    }

    /// Advance `sample` from `timestep` to the next inference timestep.
    pub fn step(
        &mut self,
        prediction: &GuidedPrediction,
        timestep: i32,
        sample: &Latent,
    ) -> Result<Latent> {
        if self.timesteps.is_empty() {
            return Err(SolverError::TimestepsNotSet);
        }

        let fused = prediction.fuse(self.guidance_scale);
        let converted = self.convert_model_output(&fused, timestep, sample)?;
        self.push_history(converted);

        let n = self.timesteps.len();
        let step_index = match self.timesteps.iter().position(|&t| t == timestep) {
            Some(index) => index,
            None => {
                warn!(timestep, "Timestep not in inference schedule, treating as final step");
                n - 1
            }
        };
        let prev_timestep = if step_index == n - 1 {
            0
        } else {
            self.timesteps[step_index + 1]
        };

        let short_run = self.config.lower_order_final && n < LOWER_ORDER_FINAL_MAX_STEPS;
        let lower_order_final = step_index == n - 1 && short_run;
        let lower_order_second = step_index + 2 == n && short_run;

        let order = if self.config.solver_order == 1 || self.lower_order_nums < 1 || lower_order_final {
            StepOrder::First
        } else if self.config.solver_order == 2 || self.lower_order_nums < 2 || lower_order_second {
            StepOrder::Second
        } else {
            StepOrder::Third
        };

        let next = match order {
            StepOrder::First => self.first_order_update(timestep, prev_timestep, sample)?,
            StepOrder::Second => {
                let previous = self.timesteps[(step_index + n - 1) % n];
                self.second_order_update([previous, timestep], prev_timestep, sample)?
            }
            StepOrder::Third => {
                let list = [
                    self.timesteps[(step_index + 2 * n - 2) % n],
                    self.timesteps[(step_index + n - 1) % n],
                    timestep,
                ];
                self.third_order_update(list, prev_timestep, sample)?
            }
        };

        if self.lower_order_nums < self.config.solver_order {
            self.lower_order_nums += 1;
        }
        self.last_order = Some(order);
        self.phase = if step_index == n - 1 {
            SolverPhase::Done
        } else {
            SolverPhase::Stepping
        };
        debug!(step_index, timestep, prev_timestep, order = order.as_usize(), "Solver step");
        Ok(next)
    }

    fn push_history(&mut self, converted: Latent) {
        let capacity = self.history.len();
        self.newest = (self.newest + 1) % capacity;
        self.history[self.newest] = converted;
        self.filled = (self.filled + 1).min(capacity);
    }

    /// History entry `age` steps back, 0 being the newest.
    fn recent(&self, age: usize) -> &Latent {
        let capacity = self.history.len();
        &self.history[(self.newest + capacity - age) % capacity]
    }

    fn first_order_update(&self, timestep: i32, prev_timestep: i32, sample: &Latent) -> Result<Latent> {
        let t = self.schedule.coefficients(prev_timestep)?;
        let s0 = self.schedule.coefficients(timestep)?;
        let h = t.lambda - s0.lambda;

        let (w0, w1) = match self.config.algorithm_type {
            AlgorithmType::DpmSolverPlusPlus => (t.sigma / s0.sigma, t.alpha * (exp(-h) - 1.0)),
            AlgorithmType::DpmSolver => (t.alpha / s0.alpha, t.sigma * (exp(h) - 1.0)),
        };

        let d0 = self.recent(0);
        Ok(combine(|i| w0 * sample[i] - w1 * d0[i]))
    }

    fn second_order_update(
        &self,
        timestep_list: [i32; 2],
        prev_timestep: i32,
        sample: &Latent,
    ) -> Result<Latent> {
        let t = self.schedule.coefficients(prev_timestep)?;
        let s0 = self.schedule.coefficients(timestep_list[1])?;
        let s1 = self.schedule.coefficients(timestep_list[0])?;

        let h = t.lambda - s0.lambda;
        let h0 = s0.lambda - s1.lambda;
        let r0 = h0 / h;

        let (w0, w1, w2) = match (self.config.algorithm_type, self.config.solver_type) {
            (AlgorithmType::DpmSolverPlusPlus, solver_type) => {
                let phi = exp(-h) - 1.0;
                let w2 = match solver_type {
                    SolverType::Midpoint => 0.5 * t.alpha * phi,
                    SolverType::Heun => -(t.alpha * (phi / h + 1.0)),
                };
                (t.sigma / s0.sigma, t.alpha * phi, w2)
            }
            (AlgorithmType::DpmSolver, solver_type) => {
                let phi = exp(h) - 1.0;
                let w2 = match solver_type {
                    SolverType::Midpoint => 0.5 * t.sigma * phi,
                    SolverType::Heun => t.sigma * (phi / h - 1.0),
                };
                (t.alpha / s0.alpha, t.sigma * phi, w2)
            }
        };

        let inv_r0 = 1.0 / r0;
        let m0 = self.recent(0);
        let m1 = self.recent(1);
        Ok(combine(|i| {
            let d1 = inv_r0 * (m0[i] - m1[i]);
            w0 * sample[i] - w1 * m0[i] - w2 * d1
        }))
    }

    fn third_order_update(
        &self,
        timestep_list: [i32; 3],
        prev_timestep: i32,
        sample: &Latent,
    ) -> Result<Latent> {
        let t = self.schedule.coefficients(prev_timestep)?;
        let s0 = self.schedule.coefficients(timestep_list[2])?;
        let s1 = self.schedule.coefficients(timestep_list[1])?;
        let s2 = self.schedule.coefficients(timestep_list[0])?;

        let h = t.lambda - s0.lambda;
        let h0 = s0.lambda - s1.lambda;
        let h1 = s1.lambda - s2.lambda;
        let r0 = h0 / h;
        let r1 = h1 / h;

        let (w0, w1, w2, w3) = match self.config.algorithm_type {
            AlgorithmType::DpmSolverPlusPlus => {
                let phi = exp(-h) - 1.0;
                (
                    t.sigma / s0.sigma,
                    t.alpha * phi,
                    -(t.alpha * (phi / h + 1.0)),
                    t.alpha * ((phi + h) / (h * h) - 0.5),
                )
            }
            AlgorithmType::DpmSolver => {
                let phi = exp(h) - 1.0;
                (
                    t.alpha / s0.alpha,
                    t.sigma * phi,
                    t.sigma * (phi / h - 1.0),
                    t.sigma * ((phi - h) / (h * h) - 0.5),
                )
            }
        };

        let (inv_r0, inv_r1) = (1.0 / r0, 1.0 / r1);
        let blend = r0 / (r0 + r1);
        let inv_r_sum = 1.0 / (r0 + r1);
        let m0 = self.recent(0);
        let m1 = self.recent(1);
        let m2 = self.recent(2);
        Ok(combine(|i| {
            let d1_0 = inv_r0 * (m0[i] - m1[i]);
            let d1_1 = inv_r1 * (m1[i] - m2[i]);
            let d1 = d1_0 + blend * (d1_0 - d1_1);
            let d2 = inv_r_sum * (d1_0 - d1_1);
            w0 * sample[i] - w1 * m0[i] - w2 * d1 - w3 * d2
        }))
    }
}

/// Build a latent elementwise.
fn combine<F>(f: F) -> Latent
where
    F: Fn(usize) -> f32 + Sync,
{
    let mut out = Latent::zeros();
    out.par_iter_mut()
        .enumerate()
        .for_each(|(i, x)| *x = f(i));
    out
}
