//! Headerless little-endian `f32` arrays (trained betas, lambdas)

use crate::{ArchiveError, Result};
use bytes::{Buf, Bytes};
use std::path::Path;

/// Read exactly `expected_len` floats from `path`.
pub fn read_f32_file(path: impl AsRef<Path>, expected_len: usize) -> Result<Vec<f32>> {
    let path = path.as_ref();
    let mut data = Bytes::from(std::fs::read(path)?);
    let expected_bytes = expected_len * std::mem::size_of::<f32>();
    if data.len() != expected_bytes {
        return Err(ArchiveError::size_mismatch(
            path.display().to_string(),
            data.len(),
            expected_bytes,
        ));
    }
    Ok((0..expected_len).map(|_| data.get_f32_le()).collect())
}
