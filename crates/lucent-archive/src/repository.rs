//! In-memory repository of precomputed sampling tensors

use crate::entry::{parse_entry, EntryKind, LatentBatch, ParsedEntry, StepBatch};
use crate::tarball::{TarEntry, TarReader};
use crate::{ArchiveError, Result};
use lucent_core::{Latent, TextEmbedding, TextEncoderVariant, TimestepEmbedding};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{error, info, warn};

/// Timesteps and embeddings precomputed for one inference step count
#[derive(Debug, Clone)]
struct StepData {
    timesteps: Vec<i32>,
    embeddings: Vec<TimestepEmbedding>,
}

#[derive(Debug)]
struct Contents {
    seeds: Vec<i32>,
    latents: Vec<Latent>,
    seed_index: HashMap<i32, usize>,
    groups: BTreeMap<usize, StepData>,
    unconditional: TextEmbedding,
    active_step_count: usize,
}

/// Read-only view of one step-count group.
#[derive(Debug, Clone, Copy)]
pub struct StepGroup<'a> {
    step_count: usize,
    data: &'a StepData,
}

impl<'a> StepGroup<'a> {
    /// Step count this group was precomputed for
    pub fn step_count(&self) -> usize {
        self.step_count
    }

    /// Number of steps in the group
    pub fn len(&self) -> usize {
        self.data.timesteps.len()
    }

    /// Always false for a loaded group
    pub fn is_empty(&self) -> bool {
        self.data.timesteps.is_empty()
    }

    /// All timesteps in stepping order
    pub fn timesteps(&self) -> &'a [i32] {
        &self.data.timesteps
    }

    /// Timestep at `step_index`, clamped to the last step.
    pub fn timestep(&self, step_index: usize) -> i32 {
        self.data.timesteps[self.clamp(step_index)]
    }

    /// Embedding at `step_index`, clamped to the last step.
    pub fn embedding(&self, step_index: usize) -> &'a TimestepEmbedding {
        &self.data.embeddings[self.clamp(step_index)]
    }

    fn clamp(&self, step_index: usize) -> usize {
        let last = self.len() - 1;
        if step_index > last {
            warn!(
                step_index,
                step_count = self.step_count,
                "Step index out of range, using last step"
            );
            last
        } else {
            step_index
        }
    }
}

/// Precomputed latents, timestep embeddings and the unconditional text
/// embedding, loaded once from a tensor archive.
///
/// Every accessor returns [`ArchiveError::NotLoaded`] until a load succeeds.
/// A failed load leaves earlier contents in place.
#[derive(Debug)]
pub struct TensorRepository {
    variant: TextEncoderVariant,
    contents: Option<Contents>,
}

impl TensorRepository {
    /// Create an empty repository for the given text encoder.
    pub fn new(variant: TextEncoderVariant) -> Self {
        Self {
            variant,
            contents: None,
        }
    }

    /// Create and load in one call.
    pub fn open(path: impl AsRef<Path>, variant: TextEncoderVariant) -> Result<Self> {
        let mut repository = Self::new(variant);
        repository.load(path)?;
        Ok(repository)
    }

    /// Load an archive from disk.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading tensor archive");
        let file = File::open(path)?;
        self.load_from_reader(BufReader::new(file))
    }

    /// Load an archive from any byte source.
    pub fn load_from_reader<R: Read>(&mut self, reader: R) -> Result<()> {
        let mut reader = TarReader::new(reader);
        let contents = build_contents(reader.entries()?, self.variant)?;
        info!(
            seeds = contents.seeds.len(),
            step_counts = ?contents.groups.keys().collect::<Vec<_>>(),
            active_step_count = contents.active_step_count,
            "Tensor archive loaded"
        );
        self.contents = Some(contents);
        Ok(())
    }

    /// Whether a load has succeeded
    pub fn is_loaded(&self) -> bool {
        self.contents.is_some()
    }

    /// Text encoder variant the repository expects
    pub fn variant(&self) -> TextEncoderVariant {
        self.variant
    }

    fn contents(&self) -> Result<&Contents> {
        self.contents.as_ref().ok_or(ArchiveError::NotLoaded)
    }

    /// Step counts with precomputed data, ascending.
    pub fn supported_step_counts(&self) -> Result<Vec<usize>> {
        Ok(self.contents()?.groups.keys().copied().collect())
    }

    /// Select the group used by the index-based accessors.
    ///
    /// Returns `false`, leaving the selection unchanged, when no group exists
    /// for `step_count`.
    pub fn set_active_step_count(&mut self, step_count: usize) -> Result<bool> {
        let contents = self.contents.as_mut().ok_or(ArchiveError::NotLoaded)?;
        if !contents.groups.contains_key(&step_count) {
            error!(step_count, "Step count not present in archive");
            return Ok(false);
        }
        contents.active_step_count = step_count;
        Ok(true)
    }

    /// Currently selected step count
    pub fn active_step_count(&self) -> Result<usize> {
        Ok(self.contents()?.active_step_count)
    }

    /// View of the group for `step_count`, if present.
    pub fn step_group(&self, step_count: usize) -> Result<Option<StepGroup<'_>>> {
        Ok(self
            .contents()?
            .groups
            .get(&step_count)
            .map(|data| StepGroup { step_count, data }))
    }

    fn active_group(&self) -> Result<StepGroup<'_>> {
        let contents = self.contents()?;
        let step_count = contents.active_step_count;
        let data = contents
            .groups
            .get(&step_count)
            .ok_or(ArchiveError::NotLoaded)?;
        Ok(StepGroup { step_count, data })
    }

    /// Embedding for `step_index` within the active group.
    pub fn timestep_embedding(&self, step_index: usize) -> Result<&TimestepEmbedding> {
        Ok(self.active_group()?.embedding(step_index))
    }

    /// Timestep for `step_index` within the active group.
    pub fn timestep(&self, step_index: usize) -> Result<i32> {
        Ok(self.active_group()?.timestep(step_index))
    }

    /// All timesteps of the active group.
    pub fn timesteps(&self) -> Result<&[i32]> {
        Ok(self.active_group()?.timesteps())
    }

    /// Initial latent stored for `seed`.
    pub fn initial_latent(&self, seed: i32) -> Result<&Latent> {
        let contents = self.contents()?;
        contents
            .seed_index
            .get(&seed)
            .map(|&i| &contents.latents[i])
            .ok_or(ArchiveError::NotFound { seed })
    }

    /// Seed and latent at archive position `index`, clamped to the last one.
    pub fn initial_latent_at(&self, index: usize) -> Result<(i32, &Latent)> {
        let contents = self.contents()?;
        let last = contents.latents.len() - 1;
        let index = if index > last {
            warn!(index, count = contents.latents.len(), "Latent index out of range, using last latent");
            last
        } else {
            index
        };
        Ok((contents.seeds[index], &contents.latents[index]))
    }

    /// Number of stored initial latents
    pub fn initial_latent_count(&self) -> Result<usize> {
        Ok(self.contents()?.latents.len())
    }

    /// Seeds in archive order
    pub fn seeds(&self) -> Result<&[i32]> {
        Ok(&self.contents()?.seeds)
    }

    /// Empty-prompt text embedding
    pub fn unconditional_text_embedding(&self) -> Result<&TextEmbedding> {
        Ok(&self.contents()?.unconditional)
    }

    /// Describe the loaded contents, previewing `preview_len` leading values.
    pub fn summary(&self, preview_len: usize) -> Result<RepositorySummary> {
        let contents = self.contents()?;
        let active = self.active_group()?;
        Ok(RepositorySummary {
            variant: self.variant,
            seeds: contents.seeds.clone(),
            active_step_count: contents.active_step_count,
            groups: contents
                .groups
                .iter()
                .map(|(&step_count, data)| GroupSummary {
                    step_count,
                    timesteps: data.timesteps.clone(),
                })
                .collect(),
            latent_preview: preview(&contents.latents[0], preview_len),
            embedding_preview: preview(active.embedding(0), preview_len),
            unconditional_preview: preview(contents.unconditional.as_slice(), preview_len),
        })
    }
}

fn preview(values: &[f32], len: usize) -> Vec<f32> {
    values[..len.min(values.len())].to_vec()
}

fn build_contents<I>(entries: I, variant: TextEncoderVariant) -> Result<Contents>
where
    I: Iterator<Item = Result<TarEntry>>,
{
    let mut seeds = Vec::new();
    let mut latents = Vec::new();
    let mut seed_index = HashMap::new();
    let mut groups = BTreeMap::new();
    let mut unconditional: Option<(String, TextEmbedding)> = None;

    for entry in entries {
        let entry = entry?;
        match parse_entry(&entry, variant)? {
            Some(ParsedEntry::Latents(LatentBatch {
                seeds: batch_seeds,
                latents: batch_latents,
            })) => {
                for (seed, latent) in batch_seeds.into_iter().zip(batch_latents) {
                    if seed_index.insert(seed, latents.len()).is_some() {
                        return Err(ArchiveError::DuplicateKey {
                            kind: "seed",
                            key: seed as i64,
                        });
                    }
                    seeds.push(seed);
                    latents.push(latent);
                }
            }
            Some(ParsedEntry::TimestepEmbeddings(StepBatch {
                step_count,
                timesteps,
                embeddings,
            })) => {
                let data = StepData {
                    timesteps,
                    embeddings,
                };
                if groups.insert(step_count, data).is_some() {
                    return Err(ArchiveError::DuplicateKey {
                        kind: "step count",
                        key: step_count as i64,
                    });
                }
            }
            Some(ParsedEntry::ConstEmbedding(embedding)) => {
                if let Some((first, _)) = &unconditional {
                    return Err(ArchiveError::DuplicateEntry {
                        kind: EntryKind::ConstEmbedding.suffix(),
                        entry: format!("{} (already loaded {first})", entry.name),
                    });
                }
                unconditional = Some((entry.name.clone(), embedding));
            }
            None => {}
        }
    }

    if latents.is_empty() {
        return Err(ArchiveError::MissingEntry {
            kind: EntryKind::Latents.suffix(),
        });
    }
    let Some(&active_step_count) = groups.keys().next() else {
        return Err(ArchiveError::MissingEntry {
            kind: EntryKind::TimestepEmbeddings.suffix(),
        });
    };
    let Some((_, unconditional)) = unconditional else {
        return Err(ArchiveError::MissingEntry {
            kind: EntryKind::ConstEmbedding.suffix(),
        });
    };

    Ok(Contents {
        seeds,
        latents,
        seed_index,
        groups,
        unconditional,
        active_step_count,
    })
}

/// Timesteps of one group, for [`RepositorySummary`]
#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub step_count: usize,
    pub timesteps: Vec<i32>,
}

/// Debug description of a loaded repository
#[derive(Debug, Clone, Serialize)]
pub struct RepositorySummary {
    pub variant: TextEncoderVariant,
    pub seeds: Vec<i32>,
    pub active_step_count: usize,
    pub groups: Vec<GroupSummary>,
    pub latent_preview: Vec<f32>,
    pub embedding_preview: Vec<f32>,
    pub unconditional_preview: Vec<f32>,
}

impl fmt::Display for RepositorySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "text encoder: {:?}", self.variant)?;
        writeln!(f, "seeds ({}): {:?}", self.seeds.len(), self.seeds)?;
        writeln!(f, "active step count: {}", self.active_step_count)?;
        for group in &self.groups {
            writeln!(f, "steps {:>3}: {:?}", group.step_count, group.timesteps)?;
        }
        writeln!(f, "first latent: {:?}", self.latent_preview)?;
        writeln!(f, "first embedding: {:?}", self.embedding_preview)?;
        write!(f, "unconditional: {:?}", self.unconditional_preview)
    }
}
