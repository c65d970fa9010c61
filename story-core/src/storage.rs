//! Persistence contract and the in-memory reference implementation.
//!
//! The engine issues one storage call per mutated record and assumes each
//! call applies atomically; it never batches multi-record transactions
//! itself. Implementations are free to back this with a database, the
//! JSON snapshot store in [`crate::persist`], or plain memory.

use crate::model::{
    BeatId, Chapter, ChapterId, Character, CharacterId, Checkpoint, CheckpointId, EmbeddedImage,
    EntryId, ImageId, Item, ItemId, Location, LocationId, LorebookEntry, LorebookId, Story,
    StoryBeat, StoryEntry, StoryId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use thiserror::Error;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Everything stored for one story, as loaded at open time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoryCollections {
    pub entries: Vec<StoryEntry>,
    pub characters: Vec<Character>,
    pub locations: Vec<Location>,
    pub items: Vec<Item>,
    pub beats: Vec<StoryBeat>,
    pub chapters: Vec<Chapter>,
    pub lorebook: Vec<LorebookEntry>,
    pub images: Vec<EmbeddedImage>,
    pub checkpoints: Vec<Checkpoint>,
}

/// Abstract persistence layer consumed by the engine.
///
/// All methods return `Send` futures so callers can run storage work on a
/// multithreaded runtime and queue writes onto background tasks.
pub trait Storage: Send + Sync + 'static {
    // ---- stories -----------------------------------------------------------

    fn put_story(&self, story: &Story) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn get_story(
        &self,
        id: StoryId,
    ) -> impl Future<Output = Result<Option<Story>, StorageError>> + Send;

    /// Load every collection belonging to a story, entries ordered by
    /// position and chapters by number.
    fn load_collections(
        &self,
        story_id: StoryId,
    ) -> impl Future<Output = Result<StoryCollections, StorageError>> + Send;

    // ---- entries -----------------------------------------------------------

    fn put_entry(&self, entry: &StoryEntry)
        -> impl Future<Output = Result<(), StorageError>> + Send;

    fn delete_entry(&self, id: EntryId) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Next gap-free, per-story unique ledger position.
    fn next_entry_position(
        &self,
        story_id: StoryId,
    ) -> impl Future<Output = Result<u64, StorageError>> + Send;

    // ---- world entities ----------------------------------------------------

    fn put_character(
        &self,
        character: &Character,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn delete_character(
        &self,
        id: CharacterId,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn put_location(
        &self,
        location: &Location,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn delete_location(
        &self,
        id: LocationId,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn put_item(&self, item: &Item) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn delete_item(&self, id: ItemId) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn put_beat(&self, beat: &StoryBeat) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn delete_beat(&self, id: BeatId) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn put_lorebook_entry(
        &self,
        entry: &LorebookEntry,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn delete_lorebook_entry(
        &self,
        id: LorebookId,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn put_image(
        &self,
        image: &EmbeddedImage,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn delete_image(&self, id: ImageId) -> impl Future<Output = Result<(), StorageError>> + Send;

    // ---- chapters ----------------------------------------------------------

    fn put_chapter(&self, chapter: &Chapter)
        -> impl Future<Output = Result<(), StorageError>> + Send;

    fn delete_chapter(
        &self,
        id: ChapterId,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Next per-story chapter number. Monotonic across deletions: a deleted
    /// chapter's number is never reissued.
    fn next_chapter_number(
        &self,
        story_id: StoryId,
    ) -> impl Future<Output = Result<u32, StorageError>> + Send;

    // ---- checkpoints -------------------------------------------------------

    fn put_checkpoint(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn delete_checkpoint(
        &self,
        id: CheckpointId,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    // ---- keyed records -----------------------------------------------------

    fn put_value(
        &self,
        key: &str,
        value: serde_json::Value,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn get_value(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<serde_json::Value>, StorageError>> + Send;

    fn delete_value(&self, key: &str) -> impl Future<Output = Result<(), StorageError>> + Send;
}

// ============================================================================
// In-Memory Storage
// ============================================================================

#[derive(Debug, Default)]
struct MemoryInner {
    stories: HashMap<StoryId, Story>,
    entries: HashMap<EntryId, StoryEntry>,
    characters: HashMap<CharacterId, Character>,
    locations: HashMap<LocationId, Location>,
    items: HashMap<ItemId, Item>,
    beats: HashMap<BeatId, StoryBeat>,
    lorebook: HashMap<LorebookId, LorebookEntry>,
    images: HashMap<ImageId, EmbeddedImage>,
    chapters: HashMap<ChapterId, Chapter>,
    checkpoints: HashMap<CheckpointId, Checkpoint>,
    /// Highest chapter number ever issued per story.
    chapter_highwater: HashMap<StoryId, u32>,
    values: HashMap<String, serde_json::Value>,
}

/// In-memory [`Storage`] implementation.
///
/// The reference backend for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        // Lock poisoning only happens if another test thread panicked while
        // holding the guard; recover the data rather than cascading.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of stored entries for a story (test inspection).
    pub fn entry_count(&self, story_id: StoryId) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|e| e.story_id == story_id)
            .count()
    }

    /// Number of stored chapters for a story (test inspection).
    pub fn chapter_count(&self, story_id: StoryId) -> usize {
        self.lock()
            .chapters
            .values()
            .filter(|c| c.story_id == story_id)
            .count()
    }

    /// Number of stored characters for a story (test inspection).
    pub fn character_count(&self, story_id: StoryId) -> usize {
        self.lock()
            .characters
            .values()
            .filter(|c| c.story_id == story_id)
            .count()
    }

    /// Fetch a keyed record synchronously (test inspection).
    pub fn peek_value(&self, key: &str) -> Option<serde_json::Value> {
        self.lock().values.get(key).cloned()
    }
}

impl Storage for MemoryStorage {
    async fn put_story(&self, story: &Story) -> Result<(), StorageError> {
        self.lock().stories.insert(story.id, story.clone());
        Ok(())
    }

    async fn get_story(&self, id: StoryId) -> Result<Option<Story>, StorageError> {
        Ok(self.lock().stories.get(&id).cloned())
    }

    async fn load_collections(&self, story_id: StoryId) -> Result<StoryCollections, StorageError> {
        let inner = self.lock();
        let mut collections = StoryCollections {
            entries: inner
                .entries
                .values()
                .filter(|e| e.story_id == story_id)
                .cloned()
                .collect(),
            characters: inner
                .characters
                .values()
                .filter(|c| c.story_id == story_id)
                .cloned()
                .collect(),
            locations: inner
                .locations
                .values()
                .filter(|l| l.story_id == story_id)
                .cloned()
                .collect(),
            items: inner
                .items
                .values()
                .filter(|i| i.story_id == story_id)
                .cloned()
                .collect(),
            beats: inner
                .beats
                .values()
                .filter(|b| b.story_id == story_id)
                .cloned()
                .collect(),
            chapters: inner
                .chapters
                .values()
                .filter(|c| c.story_id == story_id)
                .cloned()
                .collect(),
            lorebook: inner
                .lorebook
                .values()
                .filter(|l| l.story_id == story_id)
                .cloned()
                .collect(),
            images: inner
                .images
                .values()
                .filter(|i| i.story_id == story_id)
                .cloned()
                .collect(),
            checkpoints: inner
                .checkpoints
                .values()
                .filter(|c| c.story_id == story_id)
                .cloned()
                .collect(),
        };
        collections.entries.sort_by_key(|e| e.position);
        collections.chapters.sort_by_key(|c| c.number);
        collections.checkpoints.sort_by_key(|c| c.created_at);
        Ok(collections)
    }

    async fn put_entry(&self, entry: &StoryEntry) -> Result<(), StorageError> {
        self.lock().entries.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn delete_entry(&self, id: EntryId) -> Result<(), StorageError> {
        self.lock().entries.remove(&id);
        Ok(())
    }

    async fn next_entry_position(&self, story_id: StoryId) -> Result<u64, StorageError> {
        let inner = self.lock();
        let next = inner
            .entries
            .values()
            .filter(|e| e.story_id == story_id)
            .map(|e| e.position + 1)
            .max()
            .unwrap_or(0);
        Ok(next)
    }

    async fn put_character(&self, character: &Character) -> Result<(), StorageError> {
        self.lock()
            .characters
            .insert(character.id, character.clone());
        Ok(())
    }

    async fn delete_character(&self, id: CharacterId) -> Result<(), StorageError> {
        self.lock().characters.remove(&id);
        Ok(())
    }

    async fn put_location(&self, location: &Location) -> Result<(), StorageError> {
        self.lock().locations.insert(location.id, location.clone());
        Ok(())
    }

    async fn delete_location(&self, id: LocationId) -> Result<(), StorageError> {
        self.lock().locations.remove(&id);
        Ok(())
    }

    async fn put_item(&self, item: &Item) -> Result<(), StorageError> {
        self.lock().items.insert(item.id, item.clone());
        Ok(())
    }

    async fn delete_item(&self, id: ItemId) -> Result<(), StorageError> {
        self.lock().items.remove(&id);
        Ok(())
    }

    async fn put_beat(&self, beat: &StoryBeat) -> Result<(), StorageError> {
        self.lock().beats.insert(beat.id, beat.clone());
        Ok(())
    }

    async fn delete_beat(&self, id: BeatId) -> Result<(), StorageError> {
        self.lock().beats.remove(&id);
        Ok(())
    }

    async fn put_lorebook_entry(&self, entry: &LorebookEntry) -> Result<(), StorageError> {
        self.lock().lorebook.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn delete_lorebook_entry(&self, id: LorebookId) -> Result<(), StorageError> {
        self.lock().lorebook.remove(&id);
        Ok(())
    }

    async fn put_image(&self, image: &EmbeddedImage) -> Result<(), StorageError> {
        self.lock().images.insert(image.id, image.clone());
        Ok(())
    }

    async fn delete_image(&self, id: ImageId) -> Result<(), StorageError> {
        self.lock().images.remove(&id);
        Ok(())
    }

    async fn put_chapter(&self, chapter: &Chapter) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let highwater = inner.chapter_highwater.entry(chapter.story_id).or_default();
        *highwater = (*highwater).max(chapter.number);
        inner.chapters.insert(chapter.id, chapter.clone());
        Ok(())
    }

    async fn delete_chapter(&self, id: ChapterId) -> Result<(), StorageError> {
        self.lock().chapters.remove(&id);
        Ok(())
    }

    async fn next_chapter_number(&self, story_id: StoryId) -> Result<u32, StorageError> {
        let mut inner = self.lock();
        let highwater = inner.chapter_highwater.entry(story_id).or_default();
        *highwater += 1;
        Ok(*highwater)
    }

    async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        self.lock()
            .checkpoints
            .insert(checkpoint.id, checkpoint.clone());
        Ok(())
    }

    async fn delete_checkpoint(&self, id: CheckpointId) -> Result<(), StorageError> {
        self.lock().checkpoints.remove(&id);
        Ok(())
    }

    async fn put_value(&self, key: &str, value: serde_json::Value) -> Result<(), StorageError> {
        self.lock().values.insert(key.to_string(), value);
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        Ok(self.lock().values.get(key).cloned())
    }

    async fn delete_value(&self, key: &str) -> Result<(), StorageError> {
        self.lock().values.remove(key);
        Ok(())
    }
}
