//! Narrative state engine for interactive fiction.
//!
//! This crate provides:
//! - An append-only entry ledger with cached token counts
//! - World entities (characters, locations, items, plot beats) kept
//!   consistent under AI-driven bulk updates
//! - Chapter compression of old entries behind a moving boundary
//! - Checkpoints and retry/undo backups with durable persistence
//! - An in-game time tracker with carry/borrow normalization
//!
//! # Quick Start
//!
//! ```ignore
//! use story_core::{Story, StoryEngine, StoryMode, EntryType, MemoryStorage};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = Arc::new(MemoryStorage::new());
//!     let mut engine = StoryEngine::new(storage, Arc::new(MyTokenizer));
//!
//!     engine.create_story(Story::new("My Story", StoryMode::Adventure)).await?;
//!     engine.add_entry(EntryType::UserAction, "I open the door", None).await?;
//!
//!     let protagonist = engine.protagonist();
//!     Ok(())
//! }
//! ```

pub mod chapters;
pub mod checkpoint;
pub mod engine;
pub mod error;
pub mod events;
pub mod ledger;
pub mod merge;
pub mod model;
pub mod persist;
pub mod retry;
pub mod storage;
pub mod testing;
pub mod time;
pub mod world;

// Primary public API
pub use chapters::{ChapterSummary, Summarizer, SummarizerError, SummaryRequest};
pub use engine::{StoryEngine, Tokenizer};
pub use error::EngineError;
pub use events::StateUpdated;
pub use merge::{
    BeatUpdate, CharacterUpdate, ClassificationResult, ItemUpdate, LocationUpdate, NewBeat,
    NewCharacter, NewItem, NewLocation, TimePassed, VisualUpdate,
};
pub use model::{
    BeatStatus, Chapter, Character, Checkpoint, EmbeddedImage, EntryType, Item, Location,
    LorebookEntry, MemoryConfig, NarrativeSettings, Story, StoryBeat, StoryEntry, StoryMode,
    StorySnapshot, SELF_RELATIONSHIP,
};
pub use persist::JsonStorage;
pub use retry::{CharacterFieldSnapshot, DurableRetryState, RetryBackup};
pub use storage::{MemoryStorage, Storage, StorageError, StoryCollections};
pub use time::{TimeTracker, TrackerRestore};
pub use world::CharacterPatch;
