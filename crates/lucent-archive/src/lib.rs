//! Precomputed Tensor Archives
//!
//! Loads the per-model bundle of precomputed sampling inputs: initial
//! latents keyed by seed, timestep embeddings grouped by inference step
//! count, and the unconditional text embedding.
//!
//! # Archive Layout
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ header (512) │ latents.rand data ... pad to 512            │
//! ├────────────────────────────────────────────────────────────┤
//! │ header (512) │ 20.ts data ... pad to 512                   │
//! ├────────────────────────────────────────────────────────────┤
//! │ header (512) │ 50.ts data ... pad to 512                   │
//! ├────────────────────────────────────────────────────────────┤
//! │ header (512) │ unconditional.cte data ... pad to 512       │
//! ├────────────────────────────────────────────────────────────┤
//! │ zero block (end marker)                                    │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only regular-file entries are accepted, and each payload must match its
//! declared size.

mod error;
pub mod entry;
mod raw;
mod repository;
pub mod tarball;

pub use entry::{
    encode_const_embedding, encode_latents, encode_timestep_embeddings, EntryKind, ParsedEntry,
};
pub use error::{ArchiveError, Result};
pub use raw::read_f32_file;
pub use repository::{GroupSummary, RepositorySummary, StepGroup, TensorRepository};
pub use tarball::{TarEntries, TarEntry, TarReader, TarWriter};

/// Number of leading values shown by default in a repository summary
pub const DEFAULT_PREVIEW_LEN: usize = 8;

/// Prelude for common imports
pub mod prelude {
    pub use super::{ArchiveError, Result, StepGroup, TensorRepository};
}
