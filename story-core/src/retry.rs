//! Retry/undo subsystem.
//!
//! Before a risky action (usually re-rolling the last AI response) the
//! caller takes a backup of the story state; afterwards it either restores
//! or dismisses it. Per story the lifecycle is
//! `NoBackup -> BackedUp -> (Restored | Cleared)`.
//!
//! Two representations exist. A *full* backup holds the actual collections
//! and is only valid within the current session. The entry ledger is held
//! by `Arc`: mutators elsewhere only touch it through `Arc::make_mut`, so
//! the clone here is O(1) and the backed-up history can never be mutated
//! underneath us. A *durable* backup holds only entity-id sets plus minimal
//! per-character field snapshots, is written to key/value storage in the
//! background, and survives a restart.

use crate::engine::StoryEngine;
use crate::error::EngineError;
use crate::model::{
    BeatId, Chapter, Character, CharacterId, EmbeddedImage, ImageId, Item, ItemId, Location,
    LocationId, LorebookEntry, LorebookId, StoryBeat, StoryEntry, StoryId, SELF_RELATIONSHIP,
};
use crate::storage::Storage;
use crate::time::TrackerRestore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

fn retry_state_key(story_id: StoryId) -> String {
    format!("retry_state:{story_id}")
}

fn style_review_key(story_id: StoryId) -> String {
    format!("style_review:{story_id}")
}

/// The mutable character fields a durable backup can put back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterFieldSnapshot {
    pub id: CharacterId,
    pub status: String,
    pub relationship: String,
    pub traits: Vec<String>,
    pub visual_descriptors: Vec<String>,
    pub portrait: Option<String>,
}

impl CharacterFieldSnapshot {
    fn capture(character: &Character) -> Self {
        Self {
            id: character.id,
            status: character.status.clone(),
            relationship: character.relationship.clone(),
            traits: character.traits.clone(),
            visual_descriptors: character.visual_descriptors.clone(),
            portrait: character.portrait.clone(),
        }
    }
}

/// What survives a restart: id sets and character field snapshots, no
/// entity collections (those would be stale or unbounded).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableRetryState {
    pub story_id: StoryId,
    /// First ledger position NOT covered by the backup; restore deletes
    /// from here onward.
    pub entry_position: u64,
    pub character_ids: Vec<CharacterId>,
    pub location_ids: Vec<LocationId>,
    pub item_ids: Vec<ItemId>,
    pub beat_ids: Vec<BeatId>,
    pub lorebook_ids: Vec<LorebookId>,
    pub image_ids: Vec<ImageId>,
    pub character_fields: Vec<CharacterFieldSnapshot>,
}

/// In-session backup holding the real collections.
#[derive(Debug, Clone)]
pub struct FullBackup {
    pub(crate) entries: Arc<Vec<StoryEntry>>,
    pub(crate) characters: Vec<Character>,
    pub(crate) locations: Vec<Location>,
    pub(crate) items: Vec<Item>,
    pub(crate) beats: Vec<StoryBeat>,
    pub(crate) chapters: Vec<Chapter>,
    pub(crate) lorebook: Vec<LorebookEntry>,
    pub(crate) images: Vec<EmbeddedImage>,
    pub(crate) tracker: TrackerRestore,
}

/// A retry backup in one of its two representations.
///
/// Restore is a single exhaustive match over this enum; the two paths share
/// no ad hoc flags.
#[derive(Debug, Clone)]
pub enum RetryBackup {
    Full(FullBackup),
    ByIds(DurableRetryState),
}

impl RetryBackup {
    pub fn is_full(&self) -> bool {
        matches!(self, RetryBackup::Full(_))
    }
}

impl<S: Storage> StoryEngine<S> {
    /// True if a backup (of either kind) exists for the story.
    pub fn has_retry_backup(&self, story_id: StoryId) -> bool {
        self.retry_backups.contains_key(&story_id)
    }

    /// Capture a pre-action backup of the loaded story.
    ///
    /// The in-memory full backup is installed synchronously; the durable
    /// subset is queued onto the retry-state write queue and persisted in
    /// the background. A failing durable write is logged, never raised.
    pub fn create_retry_backup(&mut self) -> Result<(), EngineError> {
        let state = self.state()?;
        let story_id = state.story.id;

        let full = FullBackup {
            entries: Arc::clone(&state.entries),
            characters: state.characters.clone(),
            locations: state.locations.clone(),
            items: state.items.clone(),
            beats: state.beats.clone(),
            chapters: state.chapters.clone(),
            lorebook: state.lorebook.clone(),
            images: state.images.clone(),
            tracker: TrackerRestore::from_captured(state.story.time_tracker),
        };

        let durable = DurableRetryState {
            story_id,
            entry_position: state.entries.last().map(|e| e.position + 1).unwrap_or(0),
            character_ids: state.characters.iter().map(|c| c.id).collect(),
            location_ids: state.locations.iter().map(|l| l.id).collect(),
            item_ids: state.items.iter().map(|i| i.id).collect(),
            beat_ids: state.beats.iter().map(|b| b.id).collect(),
            lorebook_ids: state.lorebook.iter().map(|l| l.id).collect(),
            image_ids: state.images.iter().map(|i| i.id).collect(),
            character_fields: state
                .characters
                .iter()
                .map(CharacterFieldSnapshot::capture)
                .collect(),
        };

        self.retry_backups.insert(story_id, RetryBackup::Full(full));

        let storage = Arc::clone(&self.storage);
        self.retry_writes.enqueue(async move {
            let value = serde_json::to_value(&durable)?;
            storage.put_value(&retry_state_key(story_id), value).await
        });
        Ok(())
    }

    /// Install a durable backup left over from a previous session.
    ///
    /// Called at story load. An existing full in-memory backup always wins;
    /// it is strictly more complete than the durable subset. An unreadable
    /// durable record is discarded with a warning, not an error.
    pub(crate) async fn load_retry_backup_from_persistent(
        &mut self,
        story_id: StoryId,
    ) -> Result<(), EngineError> {
        if matches!(
            self.retry_backups.get(&story_id),
            Some(RetryBackup::Full(_))
        ) {
            return Ok(());
        }
        let Some(value) = self.storage.get_value(&retry_state_key(story_id)).await? else {
            return Ok(());
        };
        match serde_json::from_value::<DurableRetryState>(value) {
            Ok(durable) => {
                self.retry_backups
                    .insert(story_id, RetryBackup::ByIds(durable));
            }
            Err(err) => {
                tracing::warn!(story = %story_id, error = %err, "discarding unreadable durable retry state");
            }
        }
        Ok(())
    }

    /// Roll the loaded story back to its retry backup.
    ///
    /// A full backup is restored by direct assignment of the backed-up
    /// collections. A durable backup is restored by reconciliation: trailing
    /// entries are deleted, entities not named in the saved id sets are
    /// deleted, and surviving characters get their field snapshots back. An
    /// id in the backup with no matching entity is already consistent, not
    /// an error. Successful use clears both the in-memory entry and the
    /// durable copy.
    pub async fn restore_retry_backup(&mut self) -> Result<(), EngineError> {
        let story_id = self.state()?.story.id;
        let backup = self
            .retry_backups
            .remove(&story_id)
            .ok_or(EngineError::NoRetryBackup)?;

        match backup {
            RetryBackup::Full(full) => {
                let state = self.state_mut()?;
                state.entries = full.entries;
                state.characters = full.characters;
                state.locations = full.locations;
                state.items = full.items;
                state.beats = full.beats;
                state.chapters = full.chapters;
                state.lorebook = full.lorebook;
                state.images = full.images;
                self.persist_replacement().await?;
                self.restore_time_tracker_snapshot(full.tracker).await?;
            }
            RetryBackup::ByIds(durable) => {
                self.delete_entries_from_position(durable.entry_position)
                    .await?;
                self.reconcile_by_ids(&durable).await?;
                // The durable subset never captures the tracker.
                self.restore_time_tracker_snapshot(TrackerRestore::Skip)
                    .await?;
            }
        }

        self.clear_retry_backup(story_id, true);
        Ok(())
    }

    /// Drop the backup. Clearing the in-memory entry always happens;
    /// clearing the durable copy is opt-in, so a crash-triggered reload does
    /// not silently lose the undo point.
    pub fn clear_retry_backup(&mut self, story_id: StoryId, clear_durable: bool) {
        self.retry_backups.remove(&story_id);
        if clear_durable {
            let storage = Arc::clone(&self.storage);
            self.retry_writes.enqueue(async move {
                storage.delete_value(&retry_state_key(story_id)).await
            });
        }
    }

    async fn reconcile_by_ids(&mut self, durable: &DurableRetryState) -> Result<(), EngineError> {
        let saved: HashSet<CharacterId> = durable.character_ids.iter().copied().collect();
        let doomed: Vec<CharacterId> = self
            .state()?
            .characters
            .iter()
            .filter(|c| !saved.contains(&c.id))
            .map(|c| c.id)
            .collect();
        for id in &doomed {
            self.storage.delete_character(*id).await?;
        }
        self.state_mut()?.characters.retain(|c| saved.contains(&c.id));

        let saved: HashSet<LocationId> = durable.location_ids.iter().copied().collect();
        let doomed: Vec<LocationId> = self
            .state()?
            .locations
            .iter()
            .filter(|l| !saved.contains(&l.id))
            .map(|l| l.id)
            .collect();
        for id in &doomed {
            self.storage.delete_location(*id).await?;
        }
        self.state_mut()?.locations.retain(|l| saved.contains(&l.id));

        let saved: HashSet<ItemId> = durable.item_ids.iter().copied().collect();
        let doomed: Vec<ItemId> = self
            .state()?
            .items
            .iter()
            .filter(|i| !saved.contains(&i.id))
            .map(|i| i.id)
            .collect();
        for id in &doomed {
            self.storage.delete_item(*id).await?;
        }
        self.state_mut()?.items.retain(|i| saved.contains(&i.id));

        let saved: HashSet<BeatId> = durable.beat_ids.iter().copied().collect();
        let doomed: Vec<BeatId> = self
            .state()?
            .beats
            .iter()
            .filter(|b| !saved.contains(&b.id))
            .map(|b| b.id)
            .collect();
        for id in &doomed {
            self.storage.delete_beat(*id).await?;
        }
        self.state_mut()?.beats.retain(|b| saved.contains(&b.id));

        let saved: HashSet<LorebookId> = durable.lorebook_ids.iter().copied().collect();
        let doomed: Vec<LorebookId> = self
            .state()?
            .lorebook
            .iter()
            .filter(|l| !saved.contains(&l.id))
            .map(|l| l.id)
            .collect();
        for id in &doomed {
            self.storage.delete_lorebook_entry(*id).await?;
        }
        self.state_mut()?.lorebook.retain(|l| saved.contains(&l.id));

        let saved: HashSet<ImageId> = durable.image_ids.iter().copied().collect();
        let doomed: Vec<ImageId> = self
            .state()?
            .images
            .iter()
            .filter(|i| !saved.contains(&i.id))
            .map(|i| i.id)
            .collect();
        for id in &doomed {
            self.storage.delete_image(*id).await?;
        }
        self.state_mut()?.images.retain(|i| saved.contains(&i.id));

        // Put back the mutable character fields. The protagonist flag never
        // moves through a restore, same rule as the merge engine.
        let mut changed = Vec::new();
        let state = self.state_mut()?;
        for snapshot in &durable.character_fields {
            let Some(character) = state.characters.iter_mut().find(|c| c.id == snapshot.id)
            else {
                continue;
            };
            character.status = snapshot.status.clone();
            character.traits = snapshot.traits.clone();
            character.visual_descriptors = snapshot.visual_descriptors.clone();
            character.portrait = snapshot.portrait.clone();
            let demotes_self =
                character.is_protagonist() && snapshot.relationship != SELF_RELATIONSHIP;
            let promotes_self =
                !character.is_protagonist() && snapshot.relationship == SELF_RELATIONSHIP;
            if !demotes_self && !promotes_self {
                character.relationship = snapshot.relationship.clone();
            }
            changed.push(character.clone());
        }
        for character in &changed {
            self.storage.put_character(character).await?;
        }
        Ok(())
    }

    // ---- style-review state --------------------------------------------

    /// Queue a durable save of the story's style-review state.
    pub fn save_style_review_state(&self, story_id: StoryId, state: serde_json::Value) {
        let storage = Arc::clone(&self.storage);
        self.style_writes.enqueue(async move {
            storage.put_value(&style_review_key(story_id), state).await
        });
    }

    /// Read back the durable style-review state, if any.
    pub async fn load_style_review_state(
        &self,
        story_id: StoryId,
    ) -> Result<Option<serde_json::Value>, EngineError> {
        Ok(self.storage.get_value(&style_review_key(story_id)).await?)
    }

    /// Queue a durable delete of the story's style-review state.
    pub fn clear_style_review_state(&self, story_id: StoryId) {
        let storage = Arc::clone(&self.storage);
        self.style_writes.enqueue(async move {
            storage.delete_value(&style_review_key(story_id)).await
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntryType, Story, StoryMode};
    use crate::storage::MemoryStorage;
    use crate::testing::WordTokenizer;
    use crate::time::TimeTracker;

    async fn engine_on(storage: &Arc<MemoryStorage>) -> StoryEngine<MemoryStorage> {
        StoryEngine::new(Arc::clone(storage), Arc::new(WordTokenizer))
    }

    #[tokio::test]
    async fn test_full_restore_rolls_back_everything() {
        let storage = Arc::new(MemoryStorage::new());
        let mut engine = engine_on(&storage).await;
        engine
            .create_story(Story::new("Test", StoryMode::Adventure))
            .await
            .unwrap();
        engine
            .add_entry(EntryType::Narration, "before", None)
            .await
            .unwrap();
        engine.add_character("Aria", "self").await.unwrap();
        engine
            .set_time_tracker(TimeTracker::from_hours(1))
            .await
            .unwrap();

        engine.create_retry_backup().unwrap();

        engine
            .add_entry(EntryType::Narration, "rolled back", None)
            .await
            .unwrap();
        engine.add_character("Intruder", "enemy").await.unwrap();
        engine.add_time(TimeTracker::from_days(2)).await.unwrap();

        engine.restore_retry_backup().await.unwrap();

        assert_eq!(engine.entries().len(), 1);
        assert_eq!(engine.entries()[0].content, "before");
        assert_eq!(engine.characters().len(), 1);
        assert_eq!(engine.time_tracker(), Some(TimeTracker::from_hours(1)));

        // Storage matches memory after the restore.
        let story_id = engine.story().unwrap().id;
        assert_eq!(storage.entry_count(story_id), 1);
        assert_eq!(storage.character_count(story_id), 1);
    }

    #[tokio::test]
    async fn test_restore_deletes_exactly_the_extras() {
        let storage = Arc::new(MemoryStorage::new());
        let mut engine = engine_on(&storage).await;
        engine
            .create_story(Story::new("Test", StoryMode::Adventure))
            .await
            .unwrap();
        let a = engine.add_character("A", "self").await.unwrap();
        let b = engine.add_character("B", "ally").await.unwrap();

        engine.create_retry_backup().unwrap();
        let c = engine.add_character("C", "enemy").await.unwrap();

        engine.restore_retry_backup().await.unwrap();

        let ids: Vec<_> = engine.characters().iter().map(|ch| ch.id).collect();
        assert!(ids.contains(&a));
        assert!(ids.contains(&b));
        assert!(!ids.contains(&c));
    }

    #[tokio::test]
    async fn test_durable_backup_survives_restart() {
        let storage = Arc::new(MemoryStorage::new());
        let story_id;
        {
            let mut engine = engine_on(&storage).await;
            engine
                .create_story(Story::new("Test", StoryMode::Adventure))
                .await
                .unwrap();
            story_id = engine.story().unwrap().id;
            engine
                .add_entry(EntryType::Narration, "kept", None)
                .await
                .unwrap();
            let id = engine.add_character("Aria", "self").await.unwrap();
            engine
                .update_character(
                    id,
                    crate::world::CharacterPatch {
                        status: Some("healthy".to_string()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            engine.create_retry_backup().unwrap();
            engine.flush_pending_writes().await;
        }

        // New engine on the same storage: only the durable subset exists.
        let mut engine = engine_on(&storage).await;
        engine.open_story(story_id).await.unwrap();
        assert!(engine.has_retry_backup(story_id));

        engine
            .add_entry(EntryType::Narration, "dropped", None)
            .await
            .unwrap();
        engine.add_character("Intruder", "enemy").await.unwrap();
        let id = engine.characters()[0].id;
        engine
            .update_character(
                id,
                crate::world::CharacterPatch {
                    status: Some("wounded".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        engine.restore_retry_backup().await.unwrap();

        assert_eq!(engine.entries().len(), 1);
        assert_eq!(engine.characters().len(), 1);
        assert_eq!(engine.characters()[0].status, "healthy");
        assert!(engine.characters()[0].is_protagonist());
    }

    #[tokio::test]
    async fn test_in_memory_backup_wins_over_durable() {
        let storage = Arc::new(MemoryStorage::new());
        let mut engine = engine_on(&storage).await;
        engine
            .create_story(Story::new("Test", StoryMode::Adventure))
            .await
            .unwrap();
        let story_id = engine.story().unwrap().id;
        engine.create_retry_backup().unwrap();
        engine.flush_pending_writes().await;

        // A reload must not replace the richer full backup.
        engine.close_story();
        engine.open_story(story_id).await.unwrap();
        assert!(engine.retry_backups.get(&story_id).unwrap().is_full());
    }

    #[tokio::test]
    async fn test_clearing_is_two_tier() {
        let storage = Arc::new(MemoryStorage::new());
        let mut engine = engine_on(&storage).await;
        engine
            .create_story(Story::new("Test", StoryMode::Adventure))
            .await
            .unwrap();
        let story_id = engine.story().unwrap().id;
        engine.create_retry_backup().unwrap();
        engine.flush_pending_writes().await;

        // Keep the durable copy: a reload reinstalls it.
        engine.clear_retry_backup(story_id, false);
        assert!(!engine.has_retry_backup(story_id));
        engine.close_story();
        engine.open_story(story_id).await.unwrap();
        assert!(engine.has_retry_backup(story_id));

        // Explicit dismissal removes it for good.
        engine.clear_retry_backup(story_id, true);
        engine.flush_pending_writes().await;
        assert!(storage.peek_value(&retry_state_key(story_id)).is_none());
    }

    #[tokio::test]
    async fn test_successful_restore_clears_durable_copy() {
        let storage = Arc::new(MemoryStorage::new());
        let mut engine = engine_on(&storage).await;
        engine
            .create_story(Story::new("Test", StoryMode::Adventure))
            .await
            .unwrap();
        let story_id = engine.story().unwrap().id;
        engine.create_retry_backup().unwrap();
        engine.restore_retry_backup().await.unwrap();
        engine.flush_pending_writes().await;

        assert!(!engine.has_retry_backup(story_id));
        assert!(storage.peek_value(&retry_state_key(story_id)).is_none());
    }

    #[tokio::test]
    async fn test_restore_without_backup_fails() {
        let storage = Arc::new(MemoryStorage::new());
        let mut engine = engine_on(&storage).await;
        engine
            .create_story(Story::new("Test", StoryMode::Adventure))
            .await
            .unwrap();
        let err = engine.restore_retry_backup().await;
        assert!(matches!(err, Err(EngineError::NoRetryBackup)));
    }

    #[tokio::test]
    async fn test_style_review_state_round_trip() {
        let storage = Arc::new(MemoryStorage::new());
        let engine = engine_on(&storage).await;
        let story_id = StoryId::new();

        engine.save_style_review_state(story_id, serde_json::json!({"phase": "review"}));
        engine.flush_pending_writes().await;
        let loaded = engine.load_style_review_state(story_id).await.unwrap();
        assert_eq!(loaded, Some(serde_json::json!({"phase": "review"})));

        engine.clear_style_review_state(story_id);
        engine.flush_pending_writes().await;
        assert!(engine
            .load_style_review_state(story_id)
            .await
            .unwrap()
            .is_none());
    }
}
