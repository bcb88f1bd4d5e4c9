//! Fixed-shape float tensors
//!
//! Every tensor the sampler touches has a shape fixed by the model, so the
//! element count is carried in the type. Storage is boxed to keep large
//! latents off the stack when they are moved between owners.

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Deref, DerefMut};

/// Latent height in elements
pub const LATENT_HEIGHT: usize = 64;
/// Latent width in elements
pub const LATENT_WIDTH: usize = 64;
/// Latent channels (channel-last)
pub const LATENT_CHANNELS: usize = 4;
/// Elements in one latent
pub const LATENT_LEN: usize = LATENT_HEIGHT * LATENT_WIDTH * LATENT_CHANNELS;
/// Elements in one timestep embedding
pub const TIMESTEP_EMBEDDING_LEN: usize = 1280;
/// Tokens in a text embedding
pub const TEXT_TOKENS: usize = 77;

/// A dense `f32` tensor with a compile-time element count.
#[derive(Clone, PartialEq)]
pub struct Tensor<const N: usize> {
    data: Box<[f32; N]>,
}

/// A 64x64x4 latent image
pub type Latent = Tensor<LATENT_LEN>;

/// A per-step timestep embedding
pub type TimestepEmbedding = Tensor<TIMESTEP_EMBEDDING_LEN>;

impl<const N: usize> Tensor<N> {
    /// Number of elements
    pub const LEN: usize = N;

    /// Tensor filled with zeros.
    pub fn zeros() -> Self {
        Self::filled(0.0)
    }

    /// Tensor with every element set to `value`.
    pub fn filled(value: f32) -> Self {
        Self {
            data: Box::new([value; N]),
        }
    }

    /// Build from an owned vector, checking the element count.
    pub fn from_vec(values: Vec<f32>) -> Result<Self> {
        let actual = values.len();
        let data: Box<[f32; N]> = values
            .into_boxed_slice()
            .try_into()
            .map_err(|_| CoreError::shape_mismatch(std::any::type_name::<Self>(), N, actual))?;
        Ok(Self { data })
    }

    /// Build by copying a slice, checking the element count.
    pub fn from_slice(values: &[f32]) -> Result<Self> {
        if values.len() != N {
            return Err(CoreError::shape_mismatch(
                std::any::type_name::<Self>(),
                N,
                values.len(),
            ));
        }
        let mut tensor = Self::zeros();
        tensor.data.copy_from_slice(values);
        Ok(tensor)
    }

    /// Borrow the elements
    pub fn as_slice(&self) -> &[f32] {
        &self.data[..]
    }

    /// Borrow the elements mutably
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data[..]
    }

    /// Copy the elements into a vector
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.to_vec()
    }
}

impl<const N: usize> Deref for Tensor<N> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        self.as_slice()
    }
}

impl<const N: usize> DerefMut for Tensor<N> {
    fn deref_mut(&mut self) -> &mut [f32] {
        self.as_mut_slice()
    }
}

impl<const N: usize> fmt::Debug for Tensor<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head = &self.data[..N.min(4)];
        f.debug_struct("Tensor")
            .field("len", &N)
            .field("head", &head)
            .finish()
    }
}

/// Text encoder family, which fixes the embedding width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextEncoderVariant {
    /// Stable Diffusion 1.5 (77x768)
    #[default]
    Sd15,
    /// Stable Diffusion 2.1 (77x1024)
    Sd21,
}

impl TextEncoderVariant {
    /// Hidden size of one token
    pub fn hidden_size(&self) -> usize {
        match self {
            TextEncoderVariant::Sd15 => 768,
            TextEncoderVariant::Sd21 => 1024,
        }
    }

    /// Elements in a full text embedding
    pub fn embedding_len(&self) -> usize {
        TEXT_TOKENS * self.hidden_size()
    }
}

/// A prompt embedding whose length is fixed by the encoder variant.
#[derive(Debug, Clone, PartialEq)]
pub struct TextEmbedding {
    variant: TextEncoderVariant,
    values: Vec<f32>,
}

impl TextEmbedding {
    /// Wrap values, checking the length against the variant.
    pub fn new(variant: TextEncoderVariant, values: Vec<f32>) -> Result<Self> {
        if values.len() != variant.embedding_len() {
            return Err(CoreError::shape_mismatch(
                "text embedding",
                variant.embedding_len(),
                values.len(),
            ));
        }
        Ok(Self { variant, values })
    }

    /// Encoder variant
    pub fn variant(&self) -> TextEncoderVariant {
        self.variant
    }

    /// Borrow the elements
    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }
}
