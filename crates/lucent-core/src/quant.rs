//! Affine fixed-point quantization at accelerator boundaries
//!
//! The accelerator consumes and produces `u16` tensors. A boundary is
//! described by [`QuantParameters`]; when it is inactive the tensor crosses
//! in float form untouched.

use crate::{CoreError, Result, Tensor};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Smallest representable fixed-point value
pub const QUANT_MIN: f64 = 0.0;
/// Largest representable fixed-point value
pub const QUANT_MAX: f64 = u16::MAX as f64;

/// Affine quantization parameters for one tensor boundary
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantParameters {
    /// Real value of one fixed-point step
    pub scale: f64,
    /// Zero-point offset in fixed-point steps
    pub offset: i32,
    /// Whether the boundary is quantized at all
    pub active: bool,
}

impl Default for QuantParameters {
    fn default() -> Self {
        Self {
            scale: 1.0,
            offset: 0,
            active: false,
        }
    }
}

impl QuantParameters {
    /// Active parameters
    pub fn new(scale: f64, offset: i32) -> Self {
        Self {
            scale,
            offset,
            active: true,
        }
    }

    /// Float pass-through
    pub fn bypass() -> Self {
        Self::default()
    }

    /// Check that the scale can be divided by.
    pub fn validate(&self) -> Result<()> {
        if self.active && (!self.scale.is_finite() || self.scale == 0.0) {
            return Err(CoreError::InvalidQuantParameters(format!(
                "scale must be finite and non-zero, got {}",
                self.scale
            )));
        }
        Ok(())
    }

    /// Real values covered by the fixed-point range
    pub fn representable_range(&self) -> (f64, f64) {
        (
            dequantize(QUANT_MIN as u16, self),
            dequantize(QUANT_MAX as u16, self),
        )
    }
}

/// A tensor as exchanged with the accelerator.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceBuffer {
    /// Quantized values
    Fixed(Vec<u16>),
    /// Unquantized values (bypass)
    Float(Vec<f32>),
}

impl DeviceBuffer {
    /// Number of elements
    pub fn len(&self) -> usize {
        match self {
            DeviceBuffer::Fixed(v) => v.len(),
            DeviceBuffer::Float(v) => v.len(),
        }
    }

    /// True when the buffer holds no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Representation name used in errors and logs
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceBuffer::Fixed(_) => "fixed-point",
            DeviceBuffer::Float(_) => "float",
        }
    }

    /// Size in bytes as laid out in device memory
    pub fn size_bytes(&self) -> usize {
        match self {
            DeviceBuffer::Fixed(v) => v.len() * std::mem::size_of::<u16>(),
            DeviceBuffer::Float(v) => v.len() * std::mem::size_of::<f32>(),
        }
    }
}

/// Quantize one value, rounding to nearest and clamping to `u16`.
#[inline]
pub fn quantize(value: f64, params: &QuantParameters) -> u16 {
    let raw = (value / params.scale - params.offset as f64).round();
    raw.clamp(QUANT_MIN, QUANT_MAX) as u16
}

/// Recover the real value of a fixed-point element.
#[inline]
pub fn dequantize(raw: u16, params: &QuantParameters) -> f64 {
    (raw as f64 + params.offset as f64) * params.scale
}

/// Quantize a whole tensor for an accelerator input.
pub fn quantize_tensor(values: &[f32], params: &QuantParameters) -> DeviceBuffer {
    if !params.active {
        return DeviceBuffer::Float(values.to_vec());
    }
    DeviceBuffer::Fixed(
        values
            .par_iter()
            .map(|&v| quantize(v as f64, params))
            .collect(),
    )
}

/// Dequantize an accelerator output into float values.
pub fn dequantize_tensor(buffer: &DeviceBuffer, params: &QuantParameters) -> Result<Vec<f32>> {
    match (buffer, params.active) {
        (DeviceBuffer::Fixed(raw), true) => Ok(raw
            .par_iter()
            .map(|&r| dequantize(r, params) as f32)
            .collect()),
        (DeviceBuffer::Float(values), false) => Ok(values.clone()),
        (buffer, active) => Err(CoreError::RepresentationMismatch {
            expected: if active { "fixed-point" } else { "float" },
            actual: buffer.kind(),
        }),
    }
}

/// Dequantize directly into a fixed-shape tensor.
pub fn dequantize_into<const N: usize>(
    buffer: &DeviceBuffer,
    params: &QuantParameters,
) -> Result<Tensor<N>> {
    if buffer.len() != N {
        return Err(CoreError::shape_mismatch("device buffer", N, buffer.len()));
    }
    Tensor::from_vec(dequantize_tensor(buffer, params)?)
}

/// Move a tensor from one boundary's encoding to another's.
pub fn requantize_tensor(
    buffer: &DeviceBuffer,
    from: &QuantParameters,
    to: &QuantParameters,
) -> Result<DeviceBuffer> {
    if from == to {
        dequantize_tensor(buffer, from)?;
        return Ok(buffer.clone());
    }
    let values = dequantize_tensor(buffer, from)?;
    Ok(quantize_tensor(&values, to))
}

/// Largest elementwise absolute difference between two tensors.
pub fn max_abs_error(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0f32, f32::max)
}
