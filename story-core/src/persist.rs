//! Durable storage backed by a single JSON document.
//!
//! The whole store is one human-readable file, rewritten on every mutation.
//! Stories here are small (thousands of entries, not millions), so a full
//! rewrite is simpler and safer than an incremental format. A version field
//! guards against loading saves from an incompatible build.

use crate::model::{
    BeatId, Chapter, ChapterId, Character, CharacterId, Checkpoint, CheckpointId, EmbeddedImage,
    EntryId, ImageId, Item, ItemId, Location, LocationId, LorebookEntry, LorebookId, Story,
    StoryBeat, StoryEntry, StoryId,
};
use crate::storage::{Storage, StorageError, StoryCollections};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

/// Current store file version.
const STORE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct StoreDocument {
    version: u32,
    stories: Vec<Story>,
    entries: Vec<StoryEntry>,
    characters: Vec<Character>,
    locations: Vec<Location>,
    items: Vec<Item>,
    beats: Vec<StoryBeat>,
    chapters: Vec<Chapter>,
    lorebook: Vec<LorebookEntry>,
    images: Vec<EmbeddedImage>,
    checkpoints: Vec<Checkpoint>,
    /// Highest chapter number ever issued per story.
    chapter_highwater: HashMap<StoryId, u32>,
    values: HashMap<String, serde_json::Value>,
}

impl Default for StoreDocument {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            stories: Vec::new(),
            entries: Vec::new(),
            characters: Vec::new(),
            locations: Vec::new(),
            items: Vec::new(),
            beats: Vec::new(),
            chapters: Vec::new(),
            lorebook: Vec::new(),
            images: Vec::new(),
            checkpoints: Vec::new(),
            chapter_highwater: HashMap::new(),
            values: HashMap::new(),
        }
    }
}

/// File-backed [`Storage`] implementation.
pub struct JsonStorage {
    path: PathBuf,
    inner: Mutex<StoreDocument>,
}

impl JsonStorage {
    /// Open a store file, creating a fresh document if it does not exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let document = match fs::read_to_string(&path).await {
            Ok(content) => {
                let document: StoreDocument = serde_json::from_str(&content)?;
                if document.version != STORE_VERSION {
                    return Err(StorageError::VersionMismatch {
                        expected: STORE_VERSION,
                        found: document.version,
                    });
                }
                document
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StoreDocument::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            inner: Mutex::new(document),
        })
    }

    /// List the stories in a store file without loading any collections.
    pub async fn peek_stories(path: impl AsRef<Path>) -> Result<Vec<Story>, StorageError> {
        #[derive(Deserialize)]
        struct Partial {
            version: u32,
            stories: Vec<Story>,
        }
        let content = fs::read_to_string(path).await?;
        let partial: Partial = serde_json::from_str(&content)?;
        if partial.version != STORE_VERSION {
            return Err(StorageError::VersionMismatch {
                expected: STORE_VERSION,
                found: partial.version,
            });
        }
        Ok(partial.stories)
    }

    async fn flush(&self, document: &StoreDocument) -> Result<(), StorageError> {
        let content = serde_json::to_string_pretty(document)?;
        fs::write(&self.path, content).await?;
        Ok(())
    }
}

/// Replace the element with a matching id, or append.
fn upsert<T: Clone>(items: &mut Vec<T>, item: &T, same: impl Fn(&T) -> bool) {
    match items.iter_mut().find(|existing| same(existing)) {
        Some(existing) => *existing = item.clone(),
        None => items.push(item.clone()),
    }
}

impl Storage for JsonStorage {
    async fn put_story(&self, story: &Story) -> Result<(), StorageError> {
        let mut doc = self.inner.lock().await;
        upsert(&mut doc.stories, story, |s| s.id == story.id);
        self.flush(&doc).await
    }

    async fn get_story(&self, story_id: StoryId) -> Result<Option<Story>, StorageError> {
        let doc = self.inner.lock().await;
        Ok(doc.stories.iter().find(|s| s.id == story_id).cloned())
    }

    async fn load_collections(&self, story_id: StoryId) -> Result<StoryCollections, StorageError> {
        let doc = self.inner.lock().await;
        let mut collections = StoryCollections {
            entries: doc
                .entries
                .iter()
                .filter(|e| e.story_id == story_id)
                .cloned()
                .collect(),
            characters: doc
                .characters
                .iter()
                .filter(|c| c.story_id == story_id)
                .cloned()
                .collect(),
            locations: doc
                .locations
                .iter()
                .filter(|l| l.story_id == story_id)
                .cloned()
                .collect(),
            items: doc
                .items
                .iter()
                .filter(|i| i.story_id == story_id)
                .cloned()
                .collect(),
            beats: doc
                .beats
                .iter()
                .filter(|b| b.story_id == story_id)
                .cloned()
                .collect(),
            chapters: doc
                .chapters
                .iter()
                .filter(|c| c.story_id == story_id)
                .cloned()
                .collect(),
            lorebook: doc
                .lorebook
                .iter()
                .filter(|l| l.story_id == story_id)
                .cloned()
                .collect(),
            images: doc
                .images
                .iter()
                .filter(|i| i.story_id == story_id)
                .cloned()
                .collect(),
            checkpoints: doc
                .checkpoints
                .iter()
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
        let mut doc = self.inner.lock().await;
        upsert(&mut doc.entries, entry, |e| e.id == entry.id);
        self.flush(&doc).await
    }

    async fn delete_entry(&self, id: EntryId) -> Result<(), StorageError> {
        let mut doc = self.inner.lock().await;
        doc.entries.retain(|e| e.id != id);
        self.flush(&doc).await
    }

    async fn next_entry_position(&self, story_id: StoryId) -> Result<u64, StorageError> {
        let doc = self.inner.lock().await;
        Ok(doc
            .entries
            .iter()
            .filter(|e| e.story_id == story_id)
            .map(|e| e.position + 1)
            .max()
            .unwrap_or(0))
    }

    async fn put_character(&self, character: &Character) -> Result<(), StorageError> {
        let mut doc = self.inner.lock().await;
        upsert(&mut doc.characters, character, |c| c.id == character.id);
        self.flush(&doc).await
    }

    async fn delete_character(&self, id: CharacterId) -> Result<(), StorageError> {
        let mut doc = self.inner.lock().await;
        doc.characters.retain(|c| c.id != id);
        self.flush(&doc).await
    }

    async fn put_location(&self, location: &Location) -> Result<(), StorageError> {
        let mut doc = self.inner.lock().await;
        upsert(&mut doc.locations, location, |l| l.id == location.id);
        self.flush(&doc).await
    }

    async fn delete_location(&self, id: LocationId) -> Result<(), StorageError> {
        let mut doc = self.inner.lock().await;
        doc.locations.retain(|l| l.id != id);
        self.flush(&doc).await
    }

    async fn put_item(&self, item: &Item) -> Result<(), StorageError> {
        let mut doc = self.inner.lock().await;
        upsert(&mut doc.items, item, |i| i.id == item.id);
        self.flush(&doc).await
    }

    async fn delete_item(&self, id: ItemId) -> Result<(), StorageError> {
        let mut doc = self.inner.lock().await;
        doc.items.retain(|i| i.id != id);
        self.flush(&doc).await
    }

    async fn put_beat(&self, beat: &StoryBeat) -> Result<(), StorageError> {
        let mut doc = self.inner.lock().await;
        upsert(&mut doc.beats, beat, |b| b.id == beat.id);
        self.flush(&doc).await
    }

    async fn delete_beat(&self, id: BeatId) -> Result<(), StorageError> {
        let mut doc = self.inner.lock().await;
        doc.beats.retain(|b| b.id != id);
        self.flush(&doc).await
    }

    async fn put_lorebook_entry(&self, entry: &LorebookEntry) -> Result<(), StorageError> {
        let mut doc = self.inner.lock().await;
        upsert(&mut doc.lorebook, entry, |l| l.id == entry.id);
        self.flush(&doc).await
    }

    async fn delete_lorebook_entry(&self, id: LorebookId) -> Result<(), StorageError> {
        let mut doc = self.inner.lock().await;
        doc.lorebook.retain(|l| l.id != id);
        self.flush(&doc).await
    }

    async fn put_image(&self, image: &EmbeddedImage) -> Result<(), StorageError> {
        let mut doc = self.inner.lock().await;
        upsert(&mut doc.images, image, |i| i.id == image.id);
        self.flush(&doc).await
    }

    async fn delete_image(&self, id: ImageId) -> Result<(), StorageError> {
        let mut doc = self.inner.lock().await;
        doc.images.retain(|i| i.id != id);
        self.flush(&doc).await
    }

    async fn put_chapter(&self, chapter: &Chapter) -> Result<(), StorageError> {
        let mut doc = self.inner.lock().await;
        let highwater = doc.chapter_highwater.entry(chapter.story_id).or_default();
        *highwater = (*highwater).max(chapter.number);
        upsert(&mut doc.chapters, chapter, |c| c.id == chapter.id);
        self.flush(&doc).await
    }

    async fn delete_chapter(&self, id: ChapterId) -> Result<(), StorageError> {
        let mut doc = self.inner.lock().await;
        doc.chapters.retain(|c| c.id != id);
        self.flush(&doc).await
    }

    async fn next_chapter_number(&self, story_id: StoryId) -> Result<u32, StorageError> {
        let mut doc = self.inner.lock().await;
        let highwater = doc.chapter_highwater.entry(story_id).or_default();
        *highwater += 1;
        let number = *highwater;
        self.flush(&doc).await?;
        Ok(number)
    }

    async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        let mut doc = self.inner.lock().await;
        upsert(&mut doc.checkpoints, checkpoint, |c| c.id == checkpoint.id);
        self.flush(&doc).await
    }

    async fn delete_checkpoint(&self, id: CheckpointId) -> Result<(), StorageError> {
        let mut doc = self.inner.lock().await;
        doc.checkpoints.retain(|c| c.id != id);
        self.flush(&doc).await
    }

    async fn put_value(&self, key: &str, value: serde_json::Value) -> Result<(), StorageError> {
        let mut doc = self.inner.lock().await;
        doc.values.insert(key.to_string(), value);
        self.flush(&doc).await
    }

    async fn get_value(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        let doc = self.inner.lock().await;
        Ok(doc.values.get(key).cloned())
    }

    async fn delete_value(&self, key: &str) -> Result<(), StorageError> {
        let mut doc = self.inner.lock().await;
        doc.values.remove(key);
        self.flush(&doc).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StoryEngine;
    use crate::model::{EntryType, StoryMode};
    use crate::testing::WordTokenizer;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stories.json");

        let story_id;
        {
            let storage = Arc::new(JsonStorage::open(&path).await.unwrap());
            let mut engine = StoryEngine::new(storage, Arc::new(WordTokenizer));
            engine
                .create_story(Story::new("Durable", StoryMode::Adventure))
                .await
                .unwrap();
            story_id = engine.story().unwrap().id;
            engine
                .add_entry(EntryType::Narration, "written to disk", None)
                .await
                .unwrap();
            engine.add_character("Aria", "self").await.unwrap();
        }

        let storage = Arc::new(JsonStorage::open(&path).await.unwrap());
        let mut engine = StoryEngine::new(storage, Arc::new(WordTokenizer));
        engine.open_story(story_id).await.unwrap();
        assert_eq!(engine.entries().len(), 1);
        assert_eq!(engine.entries()[0].content, "written to disk");
        assert_eq!(engine.characters()[0].name, "Aria");
    }

    #[tokio::test]
    async fn test_chapter_numbers_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stories.json");
        let story_id = StoryId::new();

        {
            let storage = JsonStorage::open(&path).await.unwrap();
            assert_eq!(storage.next_chapter_number(story_id).await.unwrap(), 1);
            assert_eq!(storage.next_chapter_number(story_id).await.unwrap(), 2);
        }

        // Deleted chapters or not, numbering keeps climbing after a reopen.
        let storage = JsonStorage::open(&path).await.unwrap();
        assert_eq!(storage.next_chapter_number(story_id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stories.json");
        tokio::fs::write(&path, r#"{"version": 99, "stories": []}"#)
            .await
            .unwrap();

        let err = JsonStorage::open(&path).await;
        assert!(matches!(
            err,
            Err(StorageError::VersionMismatch {
                expected: STORE_VERSION,
                found: 99
            })
        ));
    }

    #[tokio::test]
    async fn test_peek_stories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stories.json");

        let storage = JsonStorage::open(&path).await.unwrap();
        storage
            .put_story(&Story::new("One", StoryMode::Adventure))
            .await
            .unwrap();
        storage
            .put_story(&Story::new("Two", StoryMode::CreativeWriting))
            .await
            .unwrap();

        let stories = JsonStorage::peek_stories(&path).await.unwrap();
        assert_eq!(stories.len(), 2);
    }

    #[tokio::test]
    async fn test_values_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stories.json");

        {
            let storage = JsonStorage::open(&path).await.unwrap();
            storage
                .put_value("retry_state:test", serde_json::json!({"kept": true}))
                .await
                .unwrap();
        }

        let storage = JsonStorage::open(&path).await.unwrap();
        assert_eq!(
            storage.get_value("retry_state:test").await.unwrap(),
            Some(serde_json::json!({"kept": true}))
        );
        storage.delete_value("retry_state:test").await.unwrap();
        assert_eq!(storage.get_value("retry_state:test").await.unwrap(), None);
    }
}
