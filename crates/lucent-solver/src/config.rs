//! Solver configuration

use crate::{Result, SolverError, DEFAULT_TRAIN_TIMESTEPS};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How betas are spaced across the training timesteps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BetaSchedule {
    #[serde(rename = "linear")]
    Linear,
    #[default]
    #[serde(rename = "scaled_linear")]
    ScaledLinear,
    #[serde(rename = "squaredcos_cap_v2")]
    SquaredCosCapV2,
}

/// Solver family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AlgorithmType {
    /// Data-prediction formulation
    #[default]
    #[serde(rename = "dpmsolver++")]
    DpmSolverPlusPlus,
    /// Noise-prediction formulation
    #[serde(rename = "dpmsolver")]
    DpmSolver,
}

/// What the network predicts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PredictionType {
    #[default]
    #[serde(rename = "epsilon")]
    Epsilon,
    #[serde(rename = "sample")]
    Sample,
    #[serde(rename = "v_prediction")]
    VPrediction,
}

/// Second-order weighting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SolverType {
    #[default]
    #[serde(rename = "midpoint")]
    Midpoint,
    #[serde(rename = "heun")]
    Heun,
}

macro_rules! named_enum {
    ($ty:ident, $err:ident, { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            /// Canonical configuration name
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $name,)+
                }
            }
        }

        impl FromStr for $ty {
            type Err = SolverError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($name => Ok($ty::$variant),)+
                    other => Err(SolverError::$err(other.to_string())),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

named_enum!(BetaSchedule, InvalidBetaSchedule, {
    Linear => "linear",
    ScaledLinear => "scaled_linear",
    SquaredCosCapV2 => "squaredcos_cap_v2",
});

named_enum!(AlgorithmType, InvalidAlgorithmType, {
    DpmSolverPlusPlus => "dpmsolver++",
    DpmSolver => "dpmsolver",
});

named_enum!(PredictionType, InvalidPredictionType, {
    Epsilon => "epsilon",
    Sample => "sample",
    VPrediction => "v_prediction",
});

named_enum!(SolverType, InvalidSolverType, {
    Midpoint => "midpoint",
    Heun => "heun",
});

/// Multistep solver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Length of the training noise schedule
    pub num_train_timesteps: usize,
    /// First beta
    pub beta_start: f32,
    /// Last beta
    pub beta_end: f32,
    /// Beta spacing
    pub beta_schedule: BetaSchedule,
    /// Betas used verbatim instead of `beta_schedule`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trained_betas: Option<Vec<f32>>,
    /// Lambdas used verbatim instead of `ln(alpha) - ln(sigma)`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trained_lambdas: Option<Vec<f32>>,
    /// History length used by updates (1 to 3)
    pub solver_order: usize,
    /// What the network predicts
    pub prediction_type: PredictionType,
    /// Solver family
    pub algorithm_type: AlgorithmType,
    /// Second-order weighting
    pub solver_type: SolverType,
    /// Drop to lower orders on the final steps of short runs
    pub lower_order_final: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: DEFAULT_TRAIN_TIMESTEPS,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            trained_betas: None,
            trained_lambdas: None,
            solver_order: 2,
            prediction_type: PredictionType::Epsilon,
            algorithm_type: AlgorithmType::DpmSolverPlusPlus,
            solver_type: SolverType::Midpoint,
            lower_order_final: true,
        }
    }
}

impl SolverConfig {
    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        if !(1..=3).contains(&self.solver_order) {
            return Err(SolverError::InvalidSolverOrder(self.solver_order));
        }
        if self.num_train_timesteps == 0 {
            return Err(SolverError::InvalidConfig(
                "num_train_timesteps must be positive".into(),
            ));
        }
        let uses_beta_range =
            self.trained_betas.is_none() && self.beta_schedule != BetaSchedule::SquaredCosCapV2;
        if uses_beta_range
            && !(self.beta_start > 0.0 && self.beta_start <= self.beta_end && self.beta_end < 1.0)
        {
            return Err(SolverError::InvalidConfig(format!(
                "beta range [{}, {}] must satisfy 0 < start <= end < 1",
                self.beta_start, self.beta_end
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!("dpmsolver++".parse::<AlgorithmType>().unwrap(), AlgorithmType::DpmSolverPlusPlus);
        assert_eq!("v_prediction".parse::<PredictionType>().unwrap(), PredictionType::VPrediction);
        assert_eq!("heun".parse::<SolverType>().unwrap(), SolverType::Heun);
        assert_eq!(
            "squaredcos_cap_v2".parse::<BetaSchedule>().unwrap(),
            BetaSchedule::SquaredCosCapV2
        );
    }

    #[test]
    fn test_parse_unknown_names() {
        assert!(matches!(
            "x_start".parse::<PredictionType>(),
            Err(SolverError::InvalidPredictionType(name)) if name == "x_start"
        ));
        assert!(matches!(
            "deis".parse::<AlgorithmType>(),
            Err(SolverError::InvalidAlgorithmType(_))
        ));
        assert!(matches!(
            "rk4".parse::<SolverType>(),
            Err(SolverError::InvalidSolverType(_))
        ));
        assert!(matches!(
            "cosine".parse::<BetaSchedule>(),
            Err(SolverError::InvalidBetaSchedule(_))
        ));
    }

    #[test]
    fn test_display_matches_serde() {
        let json = serde_json::to_string(&AlgorithmType::DpmSolverPlusPlus).unwrap();
        assert_eq!(json, format!("\"{}\"", AlgorithmType::DpmSolverPlusPlus));
        let json = serde_json::to_string(&BetaSchedule::SquaredCosCapV2).unwrap();
        assert_eq!(json, "\"squaredcos_cap_v2\"");
    }

    #[test]
    fn test_default_config() {
        let config = SolverConfig::default();
        assert_eq!(config.num_train_timesteps, DEFAULT_TRAIN_TIMESTEPS);
        assert_eq!(DEFAULT_TRAIN_TIMESTEPS, 1000);
        assert_eq!(config.solver_order, 2);
        assert_eq!(config.beta_schedule, BetaSchedule::ScaledLinear);
        assert!(config.lower_order_final);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SolverConfig =
            serde_json::from_str(r#"{"solver_order": 3, "algorithm_type": "dpmsolver"}"#).unwrap();
        assert_eq!(config.solver_order, 3);
        assert_eq!(config.algorithm_type, AlgorithmType::DpmSolver);
        assert_eq!(config.prediction_type, PredictionType::Epsilon);
    }

    #[test]
    fn test_unknown_json_name_rejected() {
        let result: std::result::Result<SolverConfig, _> =
            serde_json::from_str(r#"{"prediction_type": "x0"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate() {
        let config = SolverConfig {
            solver_order: 4,
            ..SolverConfig::default()
        };
        assert!(matches!(config.validate(), Err(SolverError::InvalidSolverOrder(4))));

        let config = SolverConfig {
            beta_start: 0.02,
            beta_end: 0.01,
            ..SolverConfig::default()
        };
        assert!(matches!(config.validate(), Err(SolverError::InvalidConfig(_))));

        let config = SolverConfig {
            beta_start: 0.02,
            beta_end: 0.01,
            trained_betas: Some(vec![0.01; 1000]),
            ..SolverConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cosine_schedule_ignores_beta_range() {
        let config = SolverConfig {
            beta_schedule: BetaSchedule::SquaredCosCapV2,
            beta_start: 0.0,
            beta_end: 0.0,
            ..SolverConfig::default()
        };
        assert!(config.validate().is_ok());
        assert!(crate::MultistepSolver::new(config).is_ok());

        let config = SolverConfig {
            beta_start: 0.0,
            beta_end: 0.0,
            ..SolverConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
