//! Error types for archive loading and repository lookups

use thiserror::Error;

/// Errors raised while loading or querying the tensor repository
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Repository queried before a successful load
    #[error("Repository not loaded")]
    NotLoaded,

    /// No initial latent was stored for this seed
    #[error("No initial latent for seed {seed}")]
    NotFound { seed: i32 },

    /// Entry size disagrees with the bytes its layout requires
    #[error("Size mismatch in {entry}: declared {declared} bytes, parsed {consumed}")]
    SizeMismatch {
        entry: String,
        declared: usize,
        consumed: usize,
    },

    /// Entry is not a regular file
    #[error("Unsupported entry type {type_flag:?} for {entry}")]
    UnsupportedEntryType { entry: String, type_flag: char },

    /// Header block could not be decoded
    #[error("Malformed header at offset {offset}: {reason}")]
    MalformedHeader { offset: u64, reason: String },

    /// Entry payload has an impossible value
    #[error("Malformed entry {entry}: {reason}")]
    MalformedEntry { entry: String, reason: String },

    /// A required entry kind is absent from the archive
    #[error("Archive has no {kind} entry")]
    MissingEntry { kind: &'static str },

    /// A single-instance entry kind appears twice
    #[error("Duplicate {kind} entry: {entry}")]
    DuplicateEntry { kind: &'static str, entry: String },

    /// A repository key appears twice
    #[error("Duplicate {kind} {key}")]
    DuplicateKey { kind: &'static str, key: i64 },

    /// Tensor construction failed
    #[error(transparent)]
    Core(#[from] lucent_core::CoreError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArchiveError {
    /// Create a malformed entry error.
    pub fn malformed(entry: impl Into<String>, reason: impl Into<String>) -> Self {
        ArchiveError::MalformedEntry {
            entry: entry.into(),
            reason: reason.into(),
        }
    }

    /// Create a size mismatch error.
    pub fn size_mismatch(entry: impl Into<String>, declared: usize, consumed: usize) -> Self {
        ArchiveError::SizeMismatch {
            entry: entry.into(),
            declared,
            consumed,
        }
    }

    /// Whether the error came from archive contents rather than usage.
    pub fn is_integrity_error(&self) -> bool {
        matches!(
            self,
            ArchiveError::SizeMismatch { .. }
                | ArchiveError::UnsupportedEntryType { .. }
                | ArchiveError::MalformedHeader { .. }
                | ArchiveError::MalformedEntry { .. }
                | ArchiveError::MissingEntry { .. }
                | ArchiveError::DuplicateEntry { .. }
                | ArchiveError::DuplicateKey { .. }
        )
    }
}

/// Result type for archive operations
pub type Result<T> = std::result::Result<T, ArchiveError>;
