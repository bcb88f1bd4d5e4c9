//! Accelerator execution seam
//!
//! The engine never runs the networks itself. It hands fixed-point (or
//! bypassed float) buffers to an [`Accelerator`] and reads its outputs back
//! through the quantization bridge.

use crate::{PipelineError, Result};
use lucent_core::{DeviceBuffer, QuantParameters};
use serde::{Deserialize, Serialize};

/// Which guidance branch a denoiser call computes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuidancePass {
    /// Empty-prompt branch
    Unconditional,
    /// Prompt branch
    Conditional,
}

/// Inputs to one denoiser execution
#[derive(Debug, Clone, Copy)]
pub struct UnetInputs<'a> {
    pub pass: GuidancePass,
    pub text_embedding: &'a DeviceBuffer,
    pub timestep_embedding: &'a DeviceBuffer,
    pub latent: &'a DeviceBuffer,
}

/// External executor for the text encoder, denoiser and decoder.
pub trait Accelerator {
    /// Tokenize and encode a prompt, returning the text encoder output.
    fn encode_prompt(&mut self, prompt: &str) -> Result<DeviceBuffer>;

    /// Run the denoiser once.
    fn denoise(&mut self, inputs: UnetInputs<'_>) -> Result<DeviceBuffer>;

    /// Decode a latent into the decoder's raw output.
    fn decode(&mut self, latent: &DeviceBuffer) -> Result<DeviceBuffer>;
}

impl<A: Accelerator + ?Sized> Accelerator for Box<A> {
    fn encode_prompt(&mut self, prompt: &str) -> Result<DeviceBuffer> {
        (**self).encode_prompt(prompt)
    }

    fn denoise(&mut self, inputs: UnetInputs<'_>) -> Result<DeviceBuffer> {
        (**self).denoise(inputs)
    }

    fn decode(&mut self, latent: &DeviceBuffer) -> Result<DeviceBuffer> {
        (**self).decode(latent)
    }
}

/// Quantization parameters for every tensor boundary the engine crosses
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BoundaryQuant {
    /// Text encoder output
    pub text_encoder_out: QuantParameters,
    /// Denoiser text-embedding input
    pub unet_text_in: QuantParameters,
    /// Denoiser timestep-embedding input
    pub unet_timestep_in: QuantParameters,
    /// Denoiser latent input
    pub unet_latent_in: QuantParameters,
    /// Denoiser output
    pub unet_out: QuantParameters,
    /// Decoder latent input
    pub decoder_in: QuantParameters,
}

impl BoundaryQuant {
    /// Every boundary in float pass-through.
    pub fn bypass() -> Self {
        Self::default()
    }

    /// Same parameters at every boundary.
    pub fn uniform(params: QuantParameters) -> Self {
        Self {
            text_encoder_out: params,
            unet_text_in: params,
            unet_timestep_in: params,
            unet_latent_in: params,
            unet_out: params,
            decoder_in: params,
        }
    }

    /// Check every boundary.
    pub fn validate(&self) -> Result<()> {
        for (name, params) in self.named() {
            params
                .validate()
                .map_err(|e| PipelineError::Config(format!("{name}: {e}")))?;
        }
        Ok(())
    }

    fn named(&self) -> [(&'static str, &QuantParameters); 6] {
        [
            ("text_encoder_out", &self.text_encoder_out),
            ("unet_text_in", &self.unet_text_in),
            ("unet_timestep_in", &self.unet_timestep_in),
            ("unet_latent_in", &self.unet_latent_in),
            ("unet_out", &self.unet_out),
            ("decoder_in", &self.decoder_in),
        ]
    }
}
