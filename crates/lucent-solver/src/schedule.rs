//! Training noise schedule
//!
//! Per-timestep coefficients derived from the beta sequence:
//!
//! ```text
//! alphas_cumprod[i] = prod_{k <= i} (1 - beta[k])
//! alpha_t[i]        = sqrt(alphas_cumprod[i])
//! sigma_t[i]        = sqrt(1 - alphas_cumprod[i])
//! lambda_t[i]       = ln(alpha_t[i]) - ln(sigma_t[i])
//! ```

use crate::{BetaSchedule, Result, SolverConfig, SolverError};
use std::f64::consts::PI;

/// Largest beta produced by the cosine schedule
pub const MAX_BETA: f64 = 0.999;

const COSINE_OFFSET: f64 = 0.008;

/// `n` evenly spaced points from `start` to `end` inclusive.
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            let mut points: Vec<f64> = (0..n).map(|i| start + step * i as f64).collect();
            points[n - 1] = end;
            points
        }
    }
}

/// Betas for a named schedule.
pub fn betas_for(schedule: BetaSchedule, n: usize, beta_start: f32, beta_end: f32) -> Vec<f32> {
    let (start, end) = (beta_start as f64, beta_end as f64);
    match schedule {
        BetaSchedule::Linear => linspace(start, end, n).into_iter().map(|b| b as f32).collect(),
        BetaSchedule::ScaledLinear => linspace(start.sqrt(), end.sqrt(), n)
            .into_iter()
            .map(|b| {
                let b = b as f32;
                b * b
            })
            .collect(),
        BetaSchedule::SquaredCosCapV2 => {
            let alpha_bar = |t: f64| ((t + COSINE_OFFSET) / (1.0 + COSINE_OFFSET) * PI / 2.0).cos().powi(2);
            (0..n)
                .map(|i| {
                    let t1 = i as f64 / n as f64;
                    let t2 = (i + 1) as f64 / n as f64;
                    (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(MAX_BETA) as f32
                })
                .collect()
        }
    }
}

/// Per-training-timestep schedule coefficients.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseSchedule {
    betas: Vec<f32>,
    alphas_cumprod: Vec<f32>,
    alpha_t: Vec<f32>,
    sigma_t: Vec<f32>,
    lambda_t: Vec<f32>,
}

impl NoiseSchedule {
    /// Build from a named schedule.
    pub fn new(
        num_train_timesteps: usize,
        beta_start: f32,
        beta_end: f32,
        schedule: BetaSchedule,
    ) -> Self {
        Self::build(betas_for(schedule, num_train_timesteps, beta_start, beta_end), None)
    }

    /// Build from solver configuration, honouring trained betas and lambdas.
    pub fn from_config(config: &SolverConfig) -> Result<Self> {
        let n = config.num_train_timesteps;
        let betas = match &config.trained_betas {
            Some(betas) => {
                check_len("trained betas", n, betas.len())?;
                betas.clone()
            }
            None => betas_for(config.beta_schedule, n, config.beta_start, config.beta_end),
        };
        if let Some(lambdas) = &config.trained_lambdas {
            check_len("trained lambdas", n, lambdas.len())?;
        }
        Ok(Self::build(betas, config.trained_lambdas.clone()))
    }

    /// Build from explicit betas, optionally overriding lambdas.
    pub fn from_betas(betas: Vec<f32>, lambdas: Option<Vec<f32>>) -> Result<Self> {
        if betas.is_empty() {
            return Err(SolverError::InvalidConfig("beta sequence is empty".into()));
        }
        if let Some(lambdas) = &lambdas {
            check_len("trained lambdas", betas.len(), lambdas.len())?;
        }
        Ok(Self::build(betas, lambdas))
    }

    fn build(betas: Vec<f32>, lambdas: Option<Vec<f32>>) -> Self {
        let n = betas.len();
        let mut alphas_cumprod = Vec::with_capacity(n);
        let mut alpha_t = Vec::with_capacity(n);
        let mut sigma_t = Vec::with_capacity(n);
        let mut lambda_t = Vec::with_capacity(n);

        // The running product stays in f64; coefficients derive from its f32 rounding.
        let mut cumprod = 1.0f64;
        for &beta in &betas {
            let alpha_step = (1.0 - beta as f64) as f32;
            cumprod *= alpha_step as f64;
            let rounded = cumprod as f32;
            let alpha = rounded.sqrt();
            let sigma = (1.0 - rounded).sqrt();
            alphas_cumprod.push(rounded);
            alpha_t.push(alpha);
            sigma_t.push(sigma);
            lambda_t.push(alpha.ln() - sigma.ln());
        }

        Self {
            betas,
            alphas_cumprod,
            alpha_t,
            sigma_t,
            lambda_t: lambdas.unwrap_or(lambda_t),
        }
    }

    /// Number of training timesteps
    pub fn len(&self) -> usize {
        self.betas.len()
    }

    /// True for a zero-length schedule
    pub fn is_empty(&self) -> bool {
        self.betas.is_empty()
    }

    pub fn betas(&self) -> &[f32] {
        &self.betas
    }

    pub fn alphas_cumprod(&self) -> &[f32] {
        &self.alphas_cumprod
    }

    pub fn alpha_ts(&self) -> &[f32] {
        &self.alpha_t
    }

    pub fn sigma_ts(&self) -> &[f32] {
        &self.sigma_t
    }

    pub fn lambda_ts(&self) -> &[f32] {
        &self.lambda_t
    }

    /// `(alpha_t, sigma_t, lambda_t)` at a training timestep.
    pub fn coefficients(&self, timestep: i32) -> Result<Coefficients> {
        let index = usize::try_from(timestep)
            .ok()
            .filter(|&i| i < self.len())
            .ok_or(SolverError::TimestepOutOfRange {
                timestep,
                num_train_timesteps: self.len(),
            })?;
        Ok(Coefficients {
            alpha: self.alpha_t[index],
            sigma: self.sigma_t[index],
            lambda: self.lambda_t[index],
        })
    }
}

/// Schedule coefficients at one timestep
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coefficients {
    pub alpha: f32,
    pub sigma: f32,
    pub lambda: f32,
}

fn check_len(name: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(SolverError::ScheduleLength {
            name,
            expected,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEDULES: [BetaSchedule; 3] = [
        BetaSchedule::Linear,
        BetaSchedule::ScaledLinear,
        BetaSchedule::SquaredCosCapV2,
    ];

    #[test]
    fn test_linspace() {
        assert_eq!(linspace(0.0, 1.0, 5), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(linspace(3.0, 9.0, 1), vec![3.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
        assert_eq!(*linspace(0.1, 0.7, 7).last().unwrap(), 0.7);
    }

    #[test]
    fn test_linear_betas_endpoints() {
        let betas = betas_for(BetaSchedule::Linear, 1000, 0.0001, 0.02);
        assert_eq!(betas.len(), 1000);
        assert_eq!(betas[0], 0.0001);
        assert_eq!(betas[999], 0.02);
    }

    #[test]
    fn test_scaled_linear_betas_endpoints() {
        let betas = betas_for(BetaSchedule::ScaledLinear, 1000, 0.00085, 0.012);
        assert!((betas[0] - 0.00085).abs() < 1e-9);
        assert!((betas[999] - 0.012).abs() < 1e-8);
        // Squared spacing sits below the straight line in the middle.
        assert!(betas[500] < (0.00085 + 0.012) / 2.0);
    }

    #[test]
    fn test_cosine_betas_are_capped() {
        let betas = betas_for(BetaSchedule::SquaredCosCapV2, 1000, 0.0, 0.0);
        assert!(betas.iter().all(|&b| b > 0.0 && b <= MAX_BETA as f32));
        assert_eq!(betas[999], MAX_BETA as f32);
    }

    #[test]
    fn test_alpha_sigma_identity() {
        for schedule in SCHEDULES {
            let s = NoiseSchedule::new(1000, 0.00085, 0.012, schedule);
            for (i, (a, sg)) in s.alpha_ts().iter().zip(s.sigma_ts()).enumerate() {
                let total = a * a + sg * sg;
                assert!((total - 1.0).abs() < 1e-5, "{schedule:?}[{i}]: {total}");
            }
        }
    }

    #[test]
    fn test_lambda_strictly_decreasing_default() {
        let s = NoiseSchedule::from_config(&SolverConfig::default()).unwrap();
        for pair in s.lambda_ts().windows(2) {
            assert!(pair[1] < pair[0], "{} !< {}", pair[1], pair[0]);
        }
    }

    #[test]
    fn test_cumprod_decreasing() {
        let s = NoiseSchedule::new(1000, 0.0001, 0.02, BetaSchedule::Linear);
        assert!(s.alphas_cumprod().windows(2).all(|p| p[1] < p[0]));
        assert!((s.alphas_cumprod()[0] - 0.9999).abs() < 1e-7);
    }

    #[test]
    fn test_coefficients_follow_rounded_cumprod() {
        let s = NoiseSchedule::new(1000, 0.00085, 0.012, BetaSchedule::ScaledLinear);
        for i in [0, 1, 500, 999] {
            let cumprod = s.alphas_cumprod()[i];
            assert_eq!(s.alpha_ts()[i], cumprod.sqrt());
            assert_eq!(s.sigma_ts()[i], (1.0 - cumprod).sqrt());
            assert_eq!(s.lambda_ts()[i], cumprod.sqrt().ln() - (1.0 - cumprod).sqrt().ln());
        }
    }

    #[test]
    fn test_scaled_linear_squares_rounded_roots() {
        let roots = linspace((0.00085f32 as f64).sqrt(), (0.012f32 as f64).sqrt(), 1000);
        let betas = betas_for(BetaSchedule::ScaledLinear, 1000, 0.00085, 0.012);
        for i in [0, 333, 999] {
            let root = roots[i] as f32;
            assert_eq!(betas[i], root * root);
        }
    }

    #[test]
    fn test_trained_lambdas_used_verbatim() {
        let lambdas: Vec<f32> = (0..1000).map(|i| 5.0 - i as f32 * 0.01).collect();
        let config = SolverConfig {
            trained_lambdas: Some(lambdas.clone()),
            ..SolverConfig::default()
        };
        let s = NoiseSchedule::from_config(&config).unwrap();
        assert_eq!(s.lambda_ts(), &lambdas[..]);
        // alpha and sigma still come from the betas
        let plain = NoiseSchedule::from_config(&SolverConfig::default()).unwrap();
        assert_eq!(s.alpha_ts(), plain.alpha_ts());
    }

    #[test]
    fn test_trained_betas_replace_schedule() {
        let config = SolverConfig {
            num_train_timesteps: 4,
            trained_betas: Some(vec![0.5; 4]),
            ..SolverConfig::default()
        };
        let s = NoiseSchedule::from_config(&config).unwrap();
        assert_eq!(s.alphas_cumprod(), &[0.5, 0.25, 0.125, 0.0625]);
    }

    #[test]
    fn test_trained_length_mismatch() {
        let config = SolverConfig {
            trained_betas: Some(vec![0.01; 10]),
            ..SolverConfig::default()
        };
        assert!(matches!(
            NoiseSchedule::from_config(&config),
            Err(SolverError::ScheduleLength { name: "trained betas", expected: 1000, actual: 10 })
        ));

        assert!(matches!(
            NoiseSchedule::from_betas(vec![0.1; 3], Some(vec![0.0; 2])),
            Err(SolverError::ScheduleLength { .. })
        ));
    }

    #[test]
    fn test_coefficients_range() {
        let s = NoiseSchedule::new(1000, 0.00085, 0.012, BetaSchedule::ScaledLinear);
        let c = s.coefficients(999).unwrap();
        assert_eq!(c.alpha, s.alpha_ts()[999]);
        assert!(matches!(
            s.coefficients(1000),
            Err(SolverError::TimestepOutOfRange { timestep: 1000, .. })
        ));
        assert!(s.coefficients(-1).is_err());
    }
}
