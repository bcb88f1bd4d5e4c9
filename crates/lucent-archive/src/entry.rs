//! Typed payloads of archive entries
//!
//! Entries are classified by file-name suffix and decoded once into a
//! [`ParsedEntry`]. All integers and floats are little-endian.
//!
//! | Suffix  | Layout                                                       |
//! |---------|--------------------------------------------------------------|
//! | `.rand` | `i32 count`, `count x i32 seed`, `count x 16384 f32 latent`  |
//! | `.ts`   | `i32 steps`, `steps x i32 timestep`, `steps x 1280 f32 embed`|
//! | `.cte`  | `77 x hidden f32` unconditional text embedding               |
//! | `.txt`  | free text, logged and skipped                                |

use crate::tarball::TarEntry;
use crate::{ArchiveError, Result};
use bytes::{Buf, BufMut, Bytes};
use lucent_core::{
    Latent, TextEmbedding, TextEncoderVariant, TimestepEmbedding, LATENT_LEN,
    TIMESTEP_EMBEDDING_LEN,
};
use tracing::{debug, info, warn};

const I32_SIZE: usize = std::mem::size_of::<i32>();
const F32_SIZE: usize = std::mem::size_of::<f32>();

/// Entry classification by suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// `.rand` initial latents
    Latents,
    /// `.ts` timestep embeddings
    TimestepEmbeddings,
    /// `.cte` unconditional text embedding
    ConstEmbedding,
    /// `.txt` notes
    Text,
    /// Anything else
    Unknown,
}

impl EntryKind {
    /// Classify an entry name.
    pub fn classify(name: &str) -> Self {
        match std::path::Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
        {
            Some("rand") => EntryKind::Latents,
            Some("ts") => EntryKind::TimestepEmbeddings,
            Some("cte") => EntryKind::ConstEmbedding,
            Some("txt") => EntryKind::Text,
            _ => EntryKind::Unknown,
        }
    }

    /// Suffix including the dot
    pub fn suffix(&self) -> &'static str {
        match self {
            EntryKind::Latents => ".rand",
            EntryKind::TimestepEmbeddings => ".ts",
            EntryKind::ConstEmbedding => ".cte",
            EntryKind::Text => ".txt",
            EntryKind::Unknown => "",
        }
    }
}

/// Seeds and their initial latents from one `.rand` entry
#[derive(Debug, Clone)]
pub struct LatentBatch {
    pub seeds: Vec<i32>,
    pub latents: Vec<Latent>,
}

/// One step-count group from a `.ts` entry
#[derive(Debug, Clone)]
pub struct StepBatch {
    pub step_count: usize,
    pub timesteps: Vec<i32>,
    pub embeddings: Vec<TimestepEmbedding>,
}

/// A decoded binary entry
#[derive(Debug, Clone)]
pub enum ParsedEntry {
    Latents(LatentBatch),
    TimestepEmbeddings(StepBatch),
    ConstEmbedding(TextEmbedding),
}

/// Decode an entry. Text and unrecognised entries are logged and yield `None`.
pub fn parse_entry(entry: &TarEntry, variant: TextEncoderVariant) -> Result<Option<ParsedEntry>> {
    match EntryKind::classify(&entry.name) {
        EntryKind::Latents => parse_latents(&entry.name, &entry.data).map(|b| Some(ParsedEntry::Latents(b))),
        EntryKind::TimestepEmbeddings => parse_timestep_embeddings(&entry.name, &entry.data)
            .map(|b| Some(ParsedEntry::TimestepEmbeddings(b))),
        EntryKind::ConstEmbedding => parse_const_embedding(&entry.name, &entry.data, variant)
            .map(|e| Some(ParsedEntry::ConstEmbedding(e))),
        EntryKind::Text => {
            info!(entry = %entry.name, bytes = entry.size(), "Skipping text entry");
            debug!(entry = %entry.name, "{}", String::from_utf8_lossy(&entry.data).trim_end());
            Ok(None)
        }
        EntryKind::Unknown => {
            warn!(entry = %entry.name, bytes = entry.size(), "Skipping entry with unknown suffix");
            Ok(None)
        }
    }
}

/// Decode a `.rand` payload.
pub fn parse_latents(name: &str, data: &Bytes) -> Result<LatentBatch> {
    let mut buf = data.clone();
    let count = read_count(name, &mut buf)?;
    check_size(name, data.len(), count, LATENT_LEN)?;

    let seeds: Vec<i32> = (0..count).map(|_| buf.get_i32_le()).collect();
    let latents = (0..count)
        .map(|_| Latent::from_vec(take_f32s(&mut buf, LATENT_LEN)))
        .collect::<lucent_core::Result<Vec<_>>>()?;

    debug!(entry = %name, count, "Parsed initial latents");
    Ok(LatentBatch { seeds, latents })
}

/// Decode a `.ts` payload.
pub fn parse_timestep_embeddings(name: &str, data: &Bytes) -> Result<StepBatch> {
    let mut buf = data.clone();
    let step_count = read_count(name, &mut buf)?;
    if step_count == 0 {
        return Err(ArchiveError::malformed(name, "step count must be positive"));
    }
    check_size(name, data.len(), step_count, TIMESTEP_EMBEDDING_LEN)?;

    let timesteps: Vec<i32> = (0..step_count).map(|_| buf.get_i32_le()).collect();
    let embeddings = (0..step_count)
        .map(|_| TimestepEmbedding::from_vec(take_f32s(&mut buf, TIMESTEP_EMBEDDING_LEN)))
        .collect::<lucent_core::Result<Vec<_>>>()?;

    debug!(entry = %name, step_count, "Parsed timestep embeddings");
    Ok(StepBatch {
        step_count,
        timesteps,
        embeddings,
    })
}

/// Decode a `.cte` payload for the given encoder variant.
pub fn parse_const_embedding(
    name: &str,
    data: &Bytes,
    variant: TextEncoderVariant,
) -> Result<TextEmbedding> {
    let expected = variant.embedding_len() * F32_SIZE;
    if data.len() != expected {
        return Err(ArchiveError::size_mismatch(name, data.len(), expected));
    }
    let mut buf = data.clone();
    let values = take_f32s(&mut buf, variant.embedding_len());
    debug!(entry = %name, ?variant, "Parsed unconditional text embedding");
    Ok(TextEmbedding::new(variant, values)?)
}

/// Encode a `.rand` payload.
pub fn encode_latents(seeds: &[i32], latents: &[Latent]) -> Vec<u8> {
    let count = seeds.len().min(latents.len());
    let mut out = Vec::with_capacity(I32_SIZE + count * (I32_SIZE + LATENT_LEN * F32_SIZE));
    out.put_i32_le(count as i32);
    for &seed in &seeds[..count] {
        out.put_i32_le(seed);
    }
    for latent in &latents[..count] {
        put_f32s(&mut out, latent);
    }
    out
}

/// Encode a `.ts` payload.
pub fn encode_timestep_embeddings(timesteps: &[i32], embeddings: &[TimestepEmbedding]) -> Vec<u8> {
    let count = timesteps.len().min(embeddings.len());
    let mut out =
        Vec::with_capacity(I32_SIZE + count * (I32_SIZE + TIMESTEP_EMBEDDING_LEN * F32_SIZE));
    out.put_i32_le(count as i32);
    for &t in &timesteps[..count] {
        out.put_i32_le(t);
    }
    for embedding in &embeddings[..count] {
        put_f32s(&mut out, embedding);
    }
    out
}

/// Encode a `.cte` payload.
pub fn encode_const_embedding(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * F32_SIZE);
    put_f32s(&mut out, values);
    out
}

fn read_count(name: &str, buf: &mut Bytes) -> Result<usize> {
    if buf.remaining() < I32_SIZE {
        return Err(ArchiveError::size_mismatch(name, buf.remaining(), I32_SIZE));
    }
    let count = buf.get_i32_le();
    usize::try_from(count)
        .map_err(|_| ArchiveError::malformed(name, format!("negative record count {count}")))
}

/// Declared size must equal the header plus `count` keys and `count` records.
fn check_size(name: &str, declared: usize, count: usize, record_len: usize) -> Result<()> {
    let expected = count
        .checked_mul(I32_SIZE + record_len * F32_SIZE)
        .and_then(|body| body.checked_add(I32_SIZE))
        .ok_or_else(|| ArchiveError::malformed(name, format!("record count {count} overflows")))?;
    if declared != expected {
        return Err(ArchiveError::size_mismatch(name, declared, expected));
    }
    Ok(())
}

fn take_f32s(buf: &mut Bytes, len: usize) -> Vec<f32> {
    (0..len).map(|_| buf.get_f32_le()).collect()
}

fn put_f32s(out: &mut Vec<u8>, values: &[f32]) {
    for &v in values {
        out.put_f32_le(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(EntryKind::classify("seeds.rand"), EntryKind::Latents);
        assert_eq!(EntryKind::classify("dir/20.ts"), EntryKind::TimestepEmbeddings);
        assert_eq!(EntryKind::classify("uncond.cte"), EntryKind::ConstEmbedding);
        assert_eq!(EntryKind::classify("README.txt"), EntryKind::Text);
        assert_eq!(EntryKind::classify("weights.bin"), EntryKind::Unknown);
        assert_eq!(EntryKind::classify("noext"), EntryKind::Unknown);
    }

    #[test]
    fn test_parse_latents() {
        let latents = vec![Latent::filled(1.0), Latent::filled(-2.0)];
        let data = Bytes::from(encode_latents(&[7, 42], &latents));
        let batch = parse_latents("a.rand", &data).unwrap();
        assert_eq!(batch.seeds, vec![7, 42]);
        assert_eq!(batch.latents, latents);
    }

    #[test]
    fn test_parse_latents_rejects_trailing_bytes() {
        let mut raw = encode_latents(&[1], &[Latent::zeros()]);
        raw.extend_from_slice(&[0, 0, 0, 0]);
        let declared = raw.len();
        let err = parse_latents("a.rand", &Bytes::from(raw)).unwrap_err();
        match err {
            ArchiveError::SizeMismatch {
                declared: d,
                consumed,
                ..
            } => {
                assert_eq!(d, declared);
                assert_eq!(consumed, declared - 4);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parse_latents_rejects_short_payload() {
        let mut raw = encode_latents(&[1, 2], &[Latent::zeros(), Latent::zeros()]);
        raw.truncate(raw.len() - 8);
        assert!(matches!(
            parse_latents("a.rand", &Bytes::from(raw)),
            Err(ArchiveError::SizeMismatch { .. })
        ));
        assert!(matches!(
            parse_latents("a.rand", &Bytes::from_static(&[1, 0])),
            Err(ArchiveError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_negative_count() {
        let data = Bytes::from((-1i32).to_le_bytes().to_vec());
        assert!(matches!(
            parse_latents("a.rand", &data),
            Err(ArchiveError::MalformedEntry { .. })
        ));
    }

    #[test]
    fn test_parse_timestep_embeddings() {
        let embeddings: Vec<TimestepEmbedding> = (0..3)
            .map(|i| TimestepEmbedding::filled(i as f32))
            .collect();
        let data = Bytes::from(encode_timestep_embeddings(&[999, 666, 333], &embeddings));
        let batch = parse_timestep_embeddings("3.ts", &data).unwrap();
        assert_eq!(batch.step_count, 3);
        assert_eq!(batch.timesteps, vec![999, 666, 333]);
        assert_eq!(batch.embeddings[2], TimestepEmbedding::filled(2.0));
    }

    #[test]
    fn test_zero_step_group_is_malformed() {
        let data = Bytes::from(0i32.to_le_bytes().to_vec());
        assert!(matches!(
            parse_timestep_embeddings("0.ts", &data),
            Err(ArchiveError::MalformedEntry { .. })
        ));
    }

    #[test]
    fn test_parse_const_embedding_by_variant() {
        let values = vec![0.25f32; TextEncoderVariant::Sd15.embedding_len()];
        let data = Bytes::from(encode_const_embedding(&values));

        let embedding = parse_const_embedding("u.cte", &data, TextEncoderVariant::Sd15).unwrap();
        assert_eq!(embedding.as_slice(), &values[..]);

        let err = parse_const_embedding("u.cte", &data, TextEncoderVariant::Sd21).unwrap_err();
        assert!(matches!(err, ArchiveError::SizeMismatch { .. }));
    }

    #[test]
    fn test_parse_entry_skips_text_and_unknown() {
        let text = TarEntry {
            name: "notes.txt".into(),
            data: Bytes::from_static(b"generated for sd15"),
        };
        let unknown = TarEntry {
            name: "blob.bin".into(),
            data: Bytes::from_static(&[1, 2, 3]),
        };
        assert!(parse_entry(&text, TextEncoderVariant::Sd15).unwrap().is_none());
        assert!(parse_entry(&unknown, TextEncoderVariant::Sd15).unwrap().is_none());
    }
}
