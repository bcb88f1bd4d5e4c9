//! Engine configuration

use crate::{BoundaryQuant, DecodeCadence, PipelineError, Result};
use lucent_archive::{read_f32_file, TensorRepository};
use lucent_core::TextEncoderVariant;
use lucent_solver::SolverConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Default inference step count
pub const DEFAULT_STEP_COUNT: usize = 20;

/// Default classifier-free guidance scale
pub const DEFAULT_GUIDANCE_SCALE: f32 = 7.5;

/// Everything needed to build a [`Pipeline`](crate::Pipeline) apart from the accelerator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Tensor archive with latents, timestep embeddings and the unconditional embedding
    pub archive_path: PathBuf,
    /// Text encoder family
    pub text_encoder: TextEncoderVariant,
    /// Solver hyperparameters
    pub solver: SolverConfig,
    /// Raw `f32` betas replacing the named schedule
    pub trained_betas_path: Option<PathBuf>,
    /// Raw `f32` lambdas replacing the computed ones
    pub trained_lambdas_path: Option<PathBuf>,
    /// Tensor boundary quantization
    pub quant: BoundaryQuant,
    /// Step count used when a request does not name one
    pub default_step_count: usize,
    /// Guidance scale used when a request does not name one
    pub default_guidance_scale: f32,
    /// Decode cadence for full runs
    pub decode_cadence: DecodeCadence,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            archive_path: PathBuf::from("tensors.tar"),
            text_encoder: TextEncoderVariant::Sd15,
            solver: SolverConfig::default(),
            trained_betas_path: None,
            trained_lambdas_path: None,
            quant: BoundaryQuant::default(),
            default_step_count: DEFAULT_STEP_COUNT,
            default_guidance_scale: DEFAULT_GUIDANCE_SCALE,
            decode_cadence: DecodeCadence::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON file. Relative paths inside it resolve against its directory.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_json_str(&text)?;
        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        Ok(config)
    }

    /// Serialize as pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| PipelineError::Config(e.to_string()))
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.archive_path);
        if let Some(p) = self.trained_betas_path.as_mut() {
            resolve(p);
        }
        if let Some(p) = self.trained_lambdas_path.as_mut() {
            resolve(p);
        }
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        self.solver.validate()?;
        self.quant.validate()?;
        if self.default_step_count == 0 {
            return Err(PipelineError::Config(
                "default_step_count must be positive".into(),
            ));
        }
        if !self.default_guidance_scale.is_finite() {
            return Err(PipelineError::Config(format!(
                "default_guidance_scale must be finite, got {}",
                self.default_guidance_scale
            )));
        }
        Ok(())
    }

    /// Solver configuration with trained betas and lambdas read from disk.
    pub fn resolved_solver_config(&self) -> Result<SolverConfig> {
        let mut solver = self.solver.clone();
        let n = solver.num_train_timesteps;
        if let Some(path) = &self.trained_betas_path {
            info!(path = %path.display(), "Loading trained betas");
            solver.trained_betas = Some(read_f32_file(path, n)?);
        }
        if let Some(path) = &self.trained_lambdas_path {
            info!(path = %path.display(), "Loading trained lambdas");
            solver.trained_lambdas = Some(read_f32_file(path, n)?);
        }
        Ok(solver)
    }

    /// Load the configured tensor archive.
    pub fn open_repository(&self) -> Result<TensorRepository> {
        Ok(TensorRepository::open(&self.archive_path, self.text_encoder)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lucent_solver::{AlgorithmType, SolverType};
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.default_step_count, 20);
        assert_eq!(config.default_guidance_scale, 7.5);
        assert_eq!(config.solver.algorithm_type, AlgorithmType::DpmSolverPlusPlus);
        assert_eq!(config.solver.solver_type, SolverType::Midpoint);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config = EngineConfig::from_json_str(
            r#"{
                "archive_path": "/data/sd21.tar",
                "text_encoder": "sd21",
                "solver": { "solver_order": 3 },
                "decode_cadence": { "mode": "every_step" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.text_encoder, TextEncoderVariant::Sd21);
        assert_eq!(config.solver.solver_order, 3);
        assert_eq!(config.solver.beta_end, 0.012);
        assert_eq!(config.decode_cadence, DecodeCadence::EveryStep);
    }

    #[test]
    fn test_invalid_json() {
        let err = EngineConfig::from_json_str(r#"{"solver": {"algorithm_type": "ddim"}}"#)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));

        let err = EngineConfig::from_json_str(r#"{"solver": {"solver_order": 5}}"#).unwrap_err();
        assert!(matches!(err, PipelineError::Solver(_)));
    }

    #[test]
    fn test_json_file_resolves_relative_paths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(
            &path,
            r#"{"archive_path": "bundle.tar", "trained_betas_path": "betas.bin"}"#,
        )
        .unwrap();

        let config = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.archive_path, dir.path().join("bundle.tar"));
        assert_eq!(config.trained_betas_path, Some(dir.path().join("betas.bin")));
    }

    #[test]
    fn test_resolved_solver_config_reads_trained_values() {
        let dir = tempdir().unwrap();
        let betas_path = dir.path().join("betas.bin");
        let lambdas_path = dir.path().join("lambdas.bin");
        let betas: Vec<u8> = (0..4).flat_map(|_| 0.01f32.to_le_bytes()).collect();
        let lambdas: Vec<u8> = (0..4).flat_map(|i| (2.0f32 - i as f32).to_le_bytes()).collect();
        std::fs::write(&betas_path, betas).unwrap();
        std::fs::write(&lambdas_path, lambdas).unwrap();

        let mut config = EngineConfig {
            trained_betas_path: Some(betas_path),
            trained_lambdas_path: Some(lambdas_path),
            ..EngineConfig::default()
        };
        config.solver.num_train_timesteps = 4;

        let solver = config.resolved_solver_config().unwrap();
        assert_eq!(solver.trained_betas, Some(vec![0.01; 4]));
        assert_eq!(solver.trained_lambdas, Some(vec![2.0, 1.0, 0.0, -1.0]));
    }

    #[test]
    fn test_roundtrip_json() {
        let config = EngineConfig::default();
        let text = config.to_json().unwrap();
        assert_eq!(EngineConfig::from_json_str(&text).unwrap(), config);
    }
}
