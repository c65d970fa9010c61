//! World entity operations and read accessors.
//!
//! Direct creation, update, and deletion of characters, locations, items,
//! beats, lorebook entries, and embedded images. Bulk AI-driven mutation
//! goes through [`crate::merge`] instead; both paths share the same
//! invariants (single protagonist, single current location).

use crate::engine::{StoryEngine, StoryState};
use crate::error::EngineError;
use crate::model::{
    BeatId, Chapter, Character, CharacterId, EmbeddedImage, EntryId, ImageId, Item, ItemId,
    Location, LocationId, LorebookEntry, LorebookId, StoryBeat, StoryEntry, SELF_RELATIONSHIP,
};
use crate::storage::Storage;

/// Case-insensitive name equality, the match rule for all entity merging.
pub(crate) fn name_eq(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

/// Mark one location current, clearing the flag on all others.
///
/// Forces `visited` on the newly current location. Returns the indices of
/// every location whose record changed, for persistence.
pub(crate) fn make_current_location(state: &mut StoryState, index: usize) -> Vec<usize> {
    let mut changed = Vec::new();
    for (i, location) in state.locations.iter_mut().enumerate() {
        if i == index {
            if !location.current || !location.visited {
                changed.push(i);
            }
            location.current = true;
            location.visited = true;
        } else if location.current {
            location.current = false;
            changed.push(i);
        }
    }
    changed
}

/// Fields of a character a generic update may touch.
///
/// `relationship` is deliberately absent: the protagonist flag only moves
/// through [`StoryEngine::swap_protagonist`].
#[derive(Debug, Clone, Default)]
pub struct CharacterPatch {
    pub description: Option<String>,
    pub status: Option<String>,
    pub traits: Option<Vec<String>>,
    pub visual_descriptors: Option<Vec<String>>,
    pub portrait: Option<Option<String>>,
}

impl<S: Storage> StoryEngine<S> {
    // ---- read accessors ----------------------------------------------------

    /// All ledger entries of the loaded story, in position order.
    pub fn entries(&self) -> &[StoryEntry] {
        self.state.as_ref().map_or(&[], |s| s.entries.as_slice())
    }

    pub fn characters(&self) -> &[Character] {
        self.state.as_ref().map_or(&[], |s| &s.characters)
    }

    pub fn locations(&self) -> &[Location] {
        self.state.as_ref().map_or(&[], |s| &s.locations)
    }

    pub fn items(&self) -> &[Item] {
        self.state.as_ref().map_or(&[], |s| &s.items)
    }

    pub fn beats(&self) -> &[StoryBeat] {
        self.state.as_ref().map_or(&[], |s| &s.beats)
    }

    pub fn chapters(&self) -> &[Chapter] {
        self.state.as_ref().map_or(&[], |s| &s.chapters)
    }

    pub fn lorebook(&self) -> &[LorebookEntry] {
        self.state.as_ref().map_or(&[], |s| &s.lorebook)
    }

    pub fn images(&self) -> &[EmbeddedImage] {
        self.state.as_ref().map_or(&[], |s| &s.images)
    }

    /// The location currently flagged as `current`, if any.
    pub fn current_location(&self) -> Option<&Location> {
        self.locations().iter().find(|l| l.current)
    }

    /// The character with `relationship == "self"`.
    pub fn protagonist(&self) -> Option<&Character> {
        self.characters().iter().find(|c| c.is_protagonist())
    }

    /// Total word count across the ledger.
    pub fn word_count(&self) -> usize {
        self.entries().iter().map(|e| e.word_count()).sum()
    }

    // ---- characters --------------------------------------------------------

    /// Create a character.
    ///
    /// Creating a second protagonist is rejected; use
    /// [`Self::swap_protagonist`] to move the flag.
    pub async fn add_character(
        &mut self,
        name: impl Into<String>,
        relationship: impl Into<String>,
    ) -> Result<CharacterId, EngineError> {
        let relationship = relationship.into();
        let state = self.state_mut()?;
        if relationship == SELF_RELATIONSHIP && state.characters.iter().any(|c| c.is_protagonist())
        {
            return Err(EngineError::InvalidProtagonistSwap(
                "a protagonist already exists".to_string(),
            ));
        }
        let character = Character::new(state.story.id, name).with_relationship(relationship);
        let id = character.id;
        state.characters.push(character.clone());
        self.storage.put_character(&character).await?;
        Ok(id)
    }

    /// Apply a generic update to a character. Cannot move the protagonist
    /// flag.
    pub async fn update_character(
        &mut self,
        id: CharacterId,
        patch: CharacterPatch,
    ) -> Result<(), EngineError> {
        let state = self.state_mut()?;
        let character = state
            .characters
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| EngineError::CharacterNotFound(id.to_string()))?;

        if let Some(description) = patch.description {
            character.description = description;
        }
        if let Some(status) = patch.status {
            character.status = status;
        }
        if let Some(traits) = patch.traits {
            character.traits = traits;
        }
        if let Some(visuals) = patch.visual_descriptors {
            character.visual_descriptors = visuals;
        }
        if let Some(portrait) = patch.portrait {
            character.portrait = portrait;
        }
        let character = character.clone();
        self.storage.put_character(&character).await?;
        Ok(())
    }

    /// Move the protagonist flag to another character.
    ///
    /// The former protagonist takes `former_relationship`. This is the only
    /// path that may set or clear `relationship == "self"`.
    pub async fn swap_protagonist(
        &mut self,
        new_protagonist: CharacterId,
        former_relationship: impl Into<String>,
    ) -> Result<(), EngineError> {
        let former_relationship = former_relationship.into();
        if former_relationship == SELF_RELATIONSHIP {
            return Err(EngineError::InvalidProtagonistSwap(
                "the former protagonist must take a non-self relationship".to_string(),
            ));
        }
        let state = self.state_mut()?;
        if !state.characters.iter().any(|c| c.id == new_protagonist) {
            return Err(EngineError::CharacterNotFound(new_protagonist.to_string()));
        }

        let mut changed = Vec::new();
        for character in state.characters.iter_mut() {
            if character.id == new_protagonist {
                if !character.is_protagonist() {
                    character.relationship = SELF_RELATIONSHIP.to_string();
                    changed.push(character.clone());
                }
            } else if character.is_protagonist() {
                character.relationship = former_relationship.clone();
                changed.push(character.clone());
            }
        }
        for character in changed {
            self.storage.put_character(&character).await?;
        }
        Ok(())
    }

    /// Delete a character. Deleting the protagonist is rejected so the
    /// single-protagonist invariant cannot be broken by a stray delete.
    pub async fn delete_character(&mut self, id: CharacterId) -> Result<(), EngineError> {
        let state = self.state_mut()?;
        let Some(index) = state.characters.iter().position(|c| c.id == id) else {
            return Err(EngineError::CharacterNotFound(id.to_string()));
        };
        if state.characters[index].is_protagonist() {
            return Err(EngineError::ProtagonistDeletion(id));
        }
        state.characters.remove(index);
        self.storage.delete_character(id).await?;
        Ok(())
    }

    // ---- locations ---------------------------------------------------------

    pub async fn add_location(
        &mut self,
        name: impl Into<String>,
    ) -> Result<LocationId, EngineError> {
        let state = self.state_mut()?;
        let location = Location::new(state.story.id, name);
        let id = location.id;
        state.locations.push(location.clone());
        self.storage.put_location(&location).await?;
        Ok(id)
    }

    /// Make the named location current (case-insensitive), clearing the flag
    /// everywhere else and forcing `visited`.
    pub async fn set_current_location(&mut self, name: &str) -> Result<(), EngineError> {
        let state = self.state_mut()?;
        let Some(index) = state.locations.iter().position(|l| name_eq(&l.name, name)) else {
            return Err(EngineError::LocationNotFound(name.to_string()));
        };
        let changed = make_current_location(state, index);
        let records: Vec<Location> = changed
            .into_iter()
            .map(|i| state.locations[i].clone())
            .collect();
        for location in records {
            self.storage.put_location(&location).await?;
        }
        Ok(())
    }

    pub async fn delete_location(&mut self, id: LocationId) -> Result<(), EngineError> {
        let state = self.state_mut()?;
        state.locations.retain(|l| l.id != id);
        self.storage.delete_location(id).await?;
        Ok(())
    }

    // ---- items -------------------------------------------------------------

    pub async fn add_item(&mut self, name: impl Into<String>) -> Result<ItemId, EngineError> {
        let state = self.state_mut()?;
        let item = Item::new(state.story.id, name);
        let id = item.id;
        state.items.push(item.clone());
        self.storage.put_item(&item).await?;
        Ok(id)
    }

    pub async fn delete_item(&mut self, id: ItemId) -> Result<(), EngineError> {
        let state = self.state_mut()?;
        state.items.retain(|i| i.id != id);
        self.storage.delete_item(id).await?;
        Ok(())
    }

    // ---- story beats -------------------------------------------------------

    pub async fn add_beat(&mut self, name: impl Into<String>) -> Result<BeatId, EngineError> {
        let state = self.state_mut()?;
        let beat = StoryBeat::new(state.story.id, name);
        let id = beat.id;
        state.beats.push(beat.clone());
        self.storage.put_beat(&beat).await?;
        Ok(id)
    }

    pub async fn delete_beat(&mut self, id: BeatId) -> Result<(), EngineError> {
        let state = self.state_mut()?;
        state.beats.retain(|b| b.id != id);
        self.storage.delete_beat(id).await?;
        Ok(())
    }

    // ---- lorebook and images -----------------------------------------------

    pub async fn add_lorebook_entry(
        &mut self,
        name: impl Into<String>,
        keywords: Vec<String>,
        content: impl Into<String>,
    ) -> Result<LorebookId, EngineError> {
        let state = self.state_mut()?;
        let entry = LorebookEntry {
            id: LorebookId::new(),
            story_id: state.story.id,
            name: name.into(),
            keywords,
            content: content.into(),
        };
        let id = entry.id;
        state.lorebook.push(entry.clone());
        self.storage.put_lorebook_entry(&entry).await?;
        Ok(id)
    }

    pub async fn delete_lorebook_entry(&mut self, id: LorebookId) -> Result<(), EngineError> {
        let state = self.state_mut()?;
        state.lorebook.retain(|l| l.id != id);
        self.storage.delete_lorebook_entry(id).await?;
        Ok(())
    }

    pub async fn attach_image(
        &mut self,
        entry_id: Option<EntryId>,
        source: impl Into<String>,
    ) -> Result<ImageId, EngineError> {
        let state = self.state_mut()?;
        let image = EmbeddedImage {
            id: ImageId::new(),
            story_id: state.story.id,
            entry_id,
            source: source.into(),
        };
        let id = image.id;
        state.images.push(image.clone());
        self.storage.put_image(&image).await?;
        Ok(id)
    }

    pub async fn delete_image(&mut self, id: ImageId) -> Result<(), EngineError> {
        let state = self.state_mut()?;
        state.images.retain(|i| i.id != id);
        self.storage.delete_image(id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Story, StoryMode};
    use crate::storage::MemoryStorage;
    use crate::testing::WordTokenizer;
    use std::sync::Arc;

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
    async fn test_single_protagonist_enforced() {
        let mut engine = engine_with_story().await;
        engine
            .add_character("Aria", SELF_RELATIONSHIP)
            .await
            .unwrap();
        let err = engine.add_character("Bram", SELF_RELATIONSHIP).await;
        assert!(matches!(err, Err(EngineError::InvalidProtagonistSwap(_))));
        assert_eq!(engine.protagonist().unwrap().name, "Aria");
    }

    #[tokio::test]
    async fn test_swap_protagonist() {
        let mut engine = engine_with_story().await;
        let aria = engine
            .add_character("Aria", SELF_RELATIONSHIP)
            .await
            .unwrap();
        let bram = engine.add_character("Bram", "ally").await.unwrap();

        engine.swap_protagonist(bram, "companion").await.unwrap();

        let protagonists: Vec<_> = engine
            .characters()
            .iter()
            .filter(|c| c.is_protagonist())
            .collect();
        assert_eq!(protagonists.len(), 1);
        assert_eq!(protagonists[0].id, bram);
        let former = engine.characters().iter().find(|c| c.id == aria).unwrap();
        assert_eq!(former.relationship, "companion");
    }

    #[tokio::test]
    async fn test_swap_rejects_self_for_former() {
        let mut engine = engine_with_story().await;
        let bram = engine.add_character("Bram", "ally").await.unwrap();
        let err = engine.swap_protagonist(bram, SELF_RELATIONSHIP).await;
        assert!(matches!(err, Err(EngineError::InvalidProtagonistSwap(_))));
    }

    #[tokio::test]
    async fn test_protagonist_deletion_blocked() {
        let mut engine = engine_with_story().await;
        let aria = engine
            .add_character("Aria", SELF_RELATIONSHIP)
            .await
            .unwrap();
        let err = engine.delete_character(aria).await;
        assert!(matches!(err, Err(EngineError::ProtagonistDeletion(_))));

        let bram = engine.add_character("Bram", "ally").await.unwrap();
        engine.swap_protagonist(bram, "former hero").await.unwrap();
        engine.delete_character(aria).await.unwrap();
        assert_eq!(engine.characters().len(), 1);
    }

    #[tokio::test]
    async fn test_current_location_exclusive() {
        let mut engine = engine_with_story().await;
        engine.add_location("Harbor").await.unwrap();
        engine.add_location("Market").await.unwrap();

        engine.set_current_location("harbor").await.unwrap();
        assert_eq!(engine.current_location().unwrap().name, "Harbor");
        assert!(engine.current_location().unwrap().visited);

        engine.set_current_location("Market").await.unwrap();
        let current: Vec<_> = engine.locations().iter().filter(|l| l.current).collect();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].name, "Market");
    }

    #[tokio::test]
    async fn test_unknown_location_is_error() {
        let mut engine = engine_with_story().await;
        let err = engine.set_current_location("Nowhere").await;
        assert!(matches!(err, Err(EngineError::LocationNotFound(_))));
    }

    #[tokio::test]
    async fn test_character_patch_cannot_touch_relationship() {
        let mut engine = engine_with_story().await;
        let aria = engine
            .add_character("Aria", SELF_RELATIONSHIP)
            .await
            .unwrap();
        engine
            .update_character(
                aria,
                CharacterPatch {
                    status: Some("wounded".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let character = engine.characters().iter().find(|c| c.id == aria).unwrap();
        assert_eq!(character.status, "wounded");
        assert!(character.is_protagonist());
    }
}
