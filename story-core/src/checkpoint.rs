//! Named checkpoints: on-demand full snapshots of the story state.

use crate::engine::StoryEngine;
use crate::error::EngineError;
use crate::model::{now_millis, Checkpoint, CheckpointId, StorySnapshot};
use crate::storage::Storage;
use crate::time::TrackerRestore;
use std::collections::HashSet;
use std::sync::Arc;

impl<S: Storage> StoryEngine<S> {
    /// Checkpoints of the loaded story, oldest first.
    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    /// Snapshot the loaded story under a name.
    ///
    /// Everything is copied by value, including the time tracker; a story
    /// with no entries has nothing worth checkpointing and is rejected.
    pub async fn create_checkpoint(
        &mut self,
        name: impl Into<String>,
    ) -> Result<CheckpointId, EngineError> {
        let state = self.state()?;
        if state.entries.is_empty() {
            return Err(EngineError::EmptyStory);
        }
        let checkpoint = Checkpoint {
            id: CheckpointId::new(),
            story_id: state.story.id,
            name: name.into(),
            created_at: now_millis(),
            snapshot: StorySnapshot {
                entries: (*state.entries).clone(),
                characters: state.characters.clone(),
                locations: state.locations.clone(),
                items: state.items.clone(),
                beats: state.beats.clone(),
                chapters: state.chapters.clone(),
                time_tracker: state.story.time_tracker,
            },
        };
        self.storage.put_checkpoint(&checkpoint).await?;
        let id = checkpoint.id;
        self.checkpoints.push(checkpoint);
        Ok(id)
    }

    /// Replace the loaded story's state with a checkpoint's snapshot.
    ///
    /// The replacement is persisted, chapters are re-sorted by number, and
    /// the tracker restore is explicit: a snapshot taken with a cleared
    /// tracker clears the live one.
    pub async fn restore_checkpoint(&mut self, id: CheckpointId) -> Result<(), EngineError> {
        let snapshot = self
            .checkpoints
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.snapshot.clone())
            .ok_or(EngineError::CheckpointNotFound(id))?;

        let tracker = TrackerRestore::from_captured(snapshot.time_tracker);
        let state = self.state_mut()?;
        state.entries = Arc::new(snapshot.entries);
        state.characters = snapshot.characters;
        state.locations = snapshot.locations;
        state.items = snapshot.items;
        state.beats = snapshot.beats;
        state.chapters = snapshot.chapters;
        state.chapters.sort_by_key(|c| c.number);

        self.persist_replacement().await?;
        self.restore_time_tracker_snapshot(tracker).await?;
        Ok(())
    }

    /// Delete a checkpoint from storage and memory.
    ///
    /// Works without a loaded story; deleting an unknown id is a no-op.
    pub async fn delete_checkpoint(&mut self, id: CheckpointId) -> Result<(), EngineError> {
        self.storage.delete_checkpoint(id).await?;
        self.checkpoints.retain(|c| c.id != id);
        Ok(())
    }

    /// Reconcile storage with the in-memory collections after a wholesale
    /// replacement (checkpoint or retry restore): delete what memory no
    /// longer has, then write everything it does.
    pub(crate) async fn persist_replacement(&mut self) -> Result<(), EngineError> {
        let story_id = self.state()?.story.id;
        let stored = self.storage.load_collections(story_id).await?;
        let state = self.state()?;

        let kept: HashSet<_> = state.entries.iter().map(|e| e.id).collect();
        for entry in stored.entries.iter().filter(|e| !kept.contains(&e.id)) {
            self.storage.delete_entry(entry.id).await?;
        }
        let kept: HashSet<_> = state.characters.iter().map(|c| c.id).collect();
        for character in stored.characters.iter().filter(|c| !kept.contains(&c.id)) {
            self.storage.delete_character(character.id).await?;
        }
        let kept: HashSet<_> = state.locations.iter().map(|l| l.id).collect();
        for location in stored.locations.iter().filter(|l| !kept.contains(&l.id)) {
            self.storage.delete_location(location.id).await?;
        }
        let kept: HashSet<_> = state.items.iter().map(|i| i.id).collect();
        for item in stored.items.iter().filter(|i| !kept.contains(&i.id)) {
            self.storage.delete_item(item.id).await?;
        }
        let kept: HashSet<_> = state.beats.iter().map(|b| b.id).collect();
        for beat in stored.beats.iter().filter(|b| !kept.contains(&b.id)) {
            self.storage.delete_beat(beat.id).await?;
        }
        let kept: HashSet<_> = state.chapters.iter().map(|c| c.id).collect();
        for chapter in stored.chapters.iter().filter(|c| !kept.contains(&c.id)) {
            self.storage.delete_chapter(chapter.id).await?;
        }
        let kept: HashSet<_> = state.lorebook.iter().map(|l| l.id).collect();
        for entry in stored.lorebook.iter().filter(|l| !kept.contains(&l.id)) {
            self.storage.delete_lorebook_entry(entry.id).await?;
        }
        let kept: HashSet<_> = state.images.iter().map(|i| i.id).collect();
        for image in stored.images.iter().filter(|i| !kept.contains(&i.id)) {
            self.storage.delete_image(image.id).await?;
        }

        for entry in state.entries.iter() {
            self.storage.put_entry(entry).await?;
        }
        for character in &state.characters {
            self.storage.put_character(character).await?;
        }
        for location in &state.locations {
            self.storage.put_location(location).await?;
        }
        for item in &state.items {
            self.storage.put_item(item).await?;
        }
        for beat in &state.beats {
            self.storage.put_beat(beat).await?;
        }
        for chapter in &state.chapters {
            self.storage.put_chapter(chapter).await?;
        }
        for entry in &state.lorebook {
            self.storage.put_lorebook_entry(entry).await?;
        }
        for image in &state.images {
            self.storage.put_image(image).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntryType, Story, StoryMode};
    use crate::storage::MemoryStorage;
    use crate::testing::WordTokenizer;
    use crate::time::TimeTracker;

    async fn engine_with_story() -> StoryEngine<MemoryStorage> {
        let mut engine =
            StoryEngine::new(Arc::new(MemoryStorage::new()), Arc::new(WordTokenizer));
        engine
            .create_story(Story::new("Test", StoryMode::Adventure))
            .await
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn test_checkpoint_requires_entries() {
        let mut engine = engine_with_story().await;
        let err = engine.create_checkpoint("too early").await;
        assert!(matches!(err, Err(EngineError::EmptyStory)));
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        let mut engine = engine_with_story().await;
        engine
            .add_entry(EntryType::Narration, "the calm", None)
            .await
            .unwrap();
        engine.add_character("Aria", "self").await.unwrap();
        engine.add_location("Harbor").await.unwrap();
        engine
            .set_time_tracker(TimeTracker::from_days(2))
            .await
            .unwrap();

        let id = engine.create_checkpoint("before the storm").await.unwrap();
        let saved = engine.checkpoints()[0].snapshot.clone();

        engine
            .add_entry(EntryType::Narration, "the storm", None)
            .await
            .unwrap();
        engine.add_character("Intruder", "enemy").await.unwrap();
        engine.clear_time_tracker().await.unwrap();

        engine.restore_checkpoint(id).await.unwrap();

        assert_eq!(engine.entries(), &saved.entries[..]);
        assert_eq!(
            engine.characters().len(),
            saved.characters.len()
        );
        assert_eq!(engine.locations().len(), saved.locations.len());
        assert_eq!(engine.time_tracker(), Some(TimeTracker::from_days(2)));
    }

    #[tokio::test]
    async fn test_restore_clears_tracker_when_snapshot_had_none() {
        let mut engine = engine_with_story().await;
        engine
            .add_entry(EntryType::Narration, "timeless", None)
            .await
            .unwrap();
        let id = engine.create_checkpoint("no clock").await.unwrap();

        engine
            .set_time_tracker(TimeTracker::from_hours(8))
            .await
            .unwrap();
        engine.restore_checkpoint(id).await.unwrap();
        assert_eq!(engine.time_tracker(), None);
    }

    #[tokio::test]
    async fn test_restore_unknown_checkpoint() {
        let mut engine = engine_with_story().await;
        let err = engine.restore_checkpoint(CheckpointId::new()).await;
        assert!(matches!(err, Err(EngineError::CheckpointNotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_without_loaded_story() {
        let storage = Arc::new(MemoryStorage::new());
        let mut engine = StoryEngine::new(Arc::clone(&storage), Arc::new(WordTokenizer));
        engine
            .create_story(Story::new("Test", StoryMode::Adventure))
            .await
            .unwrap();
        engine
            .add_entry(EntryType::Narration, "only entry", None)
            .await
            .unwrap();
        let story_id = engine.story().unwrap().id;
        let id = engine.create_checkpoint("kept around").await.unwrap();

        engine.close_story();
        engine.delete_checkpoint(id).await.unwrap();

        engine.open_story(story_id).await.unwrap();
        assert!(engine.checkpoints().is_empty());
    }

    #[tokio::test]
    async fn test_checkpoints_reload_with_story() {
        let storage = Arc::new(MemoryStorage::new());
        let mut engine = StoryEngine::new(Arc::clone(&storage), Arc::new(WordTokenizer));
        engine
            .create_story(Story::new("Test", StoryMode::Adventure))
            .await
            .unwrap();
        let story_id = engine.story().unwrap().id;
        engine
            .add_entry(EntryType::Narration, "entry", None)
            .await
            .unwrap();
        engine.create_checkpoint("first").await.unwrap();

        engine.close_story();
        assert!(engine.checkpoints().is_empty());
        engine.open_story(story_id).await.unwrap();
        assert_eq!(engine.checkpoints().len(), 1);
        assert_eq!(engine.checkpoints()[0].name, "first");
    }
}
