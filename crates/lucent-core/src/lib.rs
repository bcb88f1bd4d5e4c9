//! Core tensor types and the quantization bridge for Lucent
//!
//! The sampler works in `f32` on fixed-shape tensors; the accelerator works
//! on `u16` fixed-point buffers. This crate owns both representations and
//! the affine transform between them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Quantization Bridge                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │   Tensor<N> (f32)                          DeviceBuffer      │
//! │  ┌────────────┐   quantize_tensor()    ┌────────────────┐   │
//! │  │  Latent    │ ─────────────────────> │ Fixed(Vec<u16>)│   │
//! │  │  Embedding │ <───────────────────── │ Float(Vec<f32>)│   │
//! │  └────────────┘   dequantize_tensor()  └────────────────┘   │
//! │                                                              │
//! │   q = clamp(round(v / scale - offset), 0, 65535)             │
//! │   v = (q + offset) * scale                                   │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod error;
pub mod quant;
mod tensor;

pub use error::{CoreError, Result};
pub use quant::{
    dequantize, dequantize_into, dequantize_tensor, max_abs_error, quantize, quantize_tensor,
    requantize_tensor, DeviceBuffer, QuantParameters,
};
pub use tensor::{
    Latent, Tensor, TextEmbedding, TextEncoderVariant, TimestepEmbedding, LATENT_CHANNELS,
    LATENT_HEIGHT, LATENT_LEN, LATENT_WIDTH, TEXT_TOKENS, TIMESTEP_EMBEDDING_LEN,
};

/// Prelude for common imports
pub mod prelude {
    pub use super::{
        CoreError, DeviceBuffer, Latent, QuantParameters, Result, Tensor, TextEncoderVariant,
        TimestepEmbedding,
    };
}
