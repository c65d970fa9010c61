//! Error types for engine operations.

use crate::model::{CharacterId, CheckpointId, EntryId};
use crate::storage::StorageError;
use thiserror::Error;

/// Errors from story engine operations.
///
/// Precondition variants signal API misuse and are raised synchronously to
/// the caller; they are never retried internally. Background persistence
/// failures are logged instead and do not appear here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no story loaded")]
    NoStoryLoaded,

    #[error("character not found: {0}")]
    CharacterNotFound(String),

    #[error("location not found: {0}")]
    LocationNotFound(String),

    #[error("entry not found: {0}")]
    EntryNotFound(EntryId),

    #[error("invalid protagonist swap: {0}")]
    InvalidProtagonistSwap(String),

    #[error("cannot delete the protagonist ({0}); swap protagonists before deleting")]
    ProtagonistDeletion(CharacterId),

    #[error("invalid chapter range: end index {end} must be within ({start}, {len}]")]
    InvalidChapterRange {
        start: usize,
        end: usize,
        len: usize,
    },

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(CheckpointId),

    #[error("no retry backup exists for this story")]
    NoRetryBackup,

    #[error("cannot create a checkpoint for a story with no entries")]
    EmptyStory,

    #[error("story not found in storage")]
    StoryNotFound,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("summarizer failed: {0}")]
    Summarizer(String),
}
