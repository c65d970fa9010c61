//! The entry ledger: an append-only, position-indexed log of story beats.
//!
//! Positions are allocated by the persistence layer and are gap-free and
//! unique per story. An entry's position never changes after creation;
//! content and metadata may be edited in place.

use crate::engine::StoryEngine;
use crate::error::EngineError;
use crate::model::{ChapterId, EntryId, EntryMetadata, EntryType, StoryEntry};
use crate::storage::Storage;
use std::collections::HashSet;
use std::sync::Arc;

impl<S: Storage> StoryEngine<S> {
    /// Look up an entry by id.
    pub fn entry(&self, id: EntryId) -> Option<&StoryEntry> {
        self.entries().iter().find(|e| e.id == id)
    }

    /// Append an entry to the ledger.
    ///
    /// The current time tracker value is snapshotted as both `time_start`
    /// and `time_end`; the token count is computed once and cached.
    pub async fn add_entry(
        &mut self,
        entry_type: EntryType,
        content: impl Into<String>,
        extra: Option<serde_json::Value>,
    ) -> Result<EntryId, EngineError> {
        let content = content.into();
        let story_id = self.state()?.story.id;
        let tracker = self.state()?.story.time_tracker;
        let position = self.storage.next_entry_position(story_id).await?;

        let entry = StoryEntry {
            id: EntryId::new(),
            story_id,
            entry_type,
            content: content.clone(),
            position,
            metadata: EntryMetadata {
                tokens: self.tokenizer.count_tokens(&content),
                time_start: tracker,
                time_end: tracker,
                extra,
            },
        };
        self.storage.put_entry(&entry).await?;

        let id = entry.id;
        let state = self.state_mut()?;
        Arc::make_mut(&mut state.entries).push(entry);
        Ok(id)
    }

    /// Replace an entry's content, recomputing the cached token count.
    /// The position is untouched.
    pub async fn update_entry(
        &mut self,
        id: EntryId,
        content: impl Into<String>,
    ) -> Result<(), EngineError> {
        let content = content.into();
        let tokens = self.tokenizer.count_tokens(&content);

        let state = self.state_mut()?;
        let entries = Arc::make_mut(&mut state.entries);
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(EngineError::EntryNotFound(id))?;
        entry.content = content;
        entry.metadata.tokens = tokens;
        let entry = entry.clone();
        self.storage.put_entry(&entry).await?;
        Ok(())
    }

    /// Stamp the entry's `time_end` with the current tracker value.
    pub async fn update_entry_time_end(&mut self, id: EntryId) -> Result<(), EngineError> {
        let tracker = self.state()?.story.time_tracker;
        let state = self.state_mut()?;
        let entries = Arc::make_mut(&mut state.entries);
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(EngineError::EntryNotFound(id))?;
        entry.metadata.time_end = tracker;
        let entry = entry.clone();
        self.storage.put_entry(&entry).await?;
        Ok(())
    }

    /// Delete a single entry.
    pub async fn delete_entry(&mut self, id: EntryId) -> Result<(), EngineError> {
        let state = self.state_mut()?;
        if !state.entries.iter().any(|e| e.id == id) {
            return Err(EngineError::EntryNotFound(id));
        }
        self.storage.delete_entry(id).await?;
        let state = self.state_mut()?;
        Arc::make_mut(&mut state.entries).retain(|e| e.id != id);
        Ok(())
    }

    /// Delete every entry with `position >= position`.
    ///
    /// Any chapter whose start or end entry falls in the deleted range is
    /// removed first, so no chapter is ever left referencing a missing
    /// entry.
    pub async fn delete_entries_from_position(
        &mut self,
        position: u64,
    ) -> Result<(), EngineError> {
        let state = self.state()?;
        let removed_ids: HashSet<EntryId> = state
            .entries
            .iter()
            .filter(|e| e.position >= position)
            .map(|e| e.id)
            .collect();
        if removed_ids.is_empty() {
            return Ok(());
        }

        let doomed_chapters: Vec<ChapterId> = state
            .chapters
            .iter()
            .filter(|c| {
                removed_ids.contains(&c.start_entry_id) || removed_ids.contains(&c.end_entry_id)
            })
            .map(|c| c.id)
            .collect();

        for chapter_id in &doomed_chapters {
            self.storage.delete_chapter(*chapter_id).await?;
        }
        for entry_id in &removed_ids {
            self.storage.delete_entry(*entry_id).await?;
        }

        let state = self.state_mut()?;
        state.chapters.retain(|c| !doomed_chapters.contains(&c.id));
        Arc::make_mut(&mut state.entries).retain(|e| e.position < position);
        Ok(())
    }
}
