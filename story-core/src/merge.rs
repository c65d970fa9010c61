//! World-state merge engine.
//!
//! Applies a classifier's structured output to the entity collections.
//! Classifier output is untrusted input: names may collide, fields may be
//! absent, and the same result may arrive twice. The merge policy is
//! therefore defensive throughout -- updates match existing entities by
//! case-insensitive name, creations are skipped when a same-name entity
//! already exists, and the protagonist flag is never moved by this path.

use crate::engine::StoryEngine;
use crate::error::EngineError;
use crate::events::StateUpdated;
use crate::model::{
    now_millis, BeatStatus, Character, Item, Location, StoryBeat, SELF_RELATIONSHIP,
};
use crate::storage::Storage;
use crate::time::TimeTracker;
use crate::world::{make_current_location, name_eq};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Coarse time progression reported by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimePassed {
    #[default]
    None,
    Minutes,
    Hours,
    Days,
}

impl TimePassed {
    /// Fixed tracker increment for each coarse bucket.
    pub fn delta(self) -> Option<TimeTracker> {
        match self {
            TimePassed::None => None,
            TimePassed::Minutes => Some(TimeTracker::from_minutes(15)),
            TimePassed::Hours => Some(TimeTracker::from_hours(2)),
            TimePassed::Days => Some(TimeTracker::from_days(1)),
        }
    }
}

/// Visual descriptor changes. A full `replace` list wins outright;
/// otherwise `add`/`remove` apply as a case-insensitive set union and
/// difference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualUpdate {
    pub replace: Option<Vec<String>>,
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

/// Update to an existing character, matched by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CharacterUpdate {
    pub name: String,
    pub status: Option<String>,
    /// Ignored when it would promote to or demote from `self`.
    pub relationship: Option<String>,
    pub add_traits: Vec<String>,
    pub remove_traits: Vec<String>,
    pub visuals: Option<VisualUpdate>,
}

/// A character the classifier believes is new.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewCharacter {
    pub name: String,
    pub description: Option<String>,
    pub relationship: Option<String>,
    pub traits: Vec<String>,
    pub status: Option<String>,
}

/// Update to an existing location, matched by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationUpdate {
    pub name: String,
    pub visited: Option<bool>,
    /// `true` makes this the single current location; `false` only clears
    /// the flag here.
    pub current: Option<bool>,
    /// Appended to the description, space-joined, if non-empty after
    /// trimming.
    pub append_description: Option<String>,
}

/// A location the classifier believes is new.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewLocation {
    pub name: String,
    pub description: Option<String>,
}

/// Update to an existing item, matched by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemUpdate {
    pub name: String,
    pub quantity: Option<u32>,
    pub equipped: Option<bool>,
    pub location: Option<String>,
}

/// An item the classifier believes is new.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewItem {
    pub name: String,
    pub description: Option<String>,
    pub quantity: Option<u32>,
}

/// Update to an existing story beat, matched by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BeatUpdate {
    pub name: String,
    pub status: Option<BeatStatus>,
    /// Explicit resolution timestamp; wins over the stamped default.
    pub resolved_at: Option<u64>,
}

/// A story beat the classifier believes is new.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewBeat {
    pub name: String,
    pub description: Option<String>,
}

/// Everything one classifier run produces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationResult {
    pub character_updates: Vec<CharacterUpdate>,
    pub new_characters: Vec<NewCharacter>,
    pub location_updates: Vec<LocationUpdate>,
    pub new_locations: Vec<NewLocation>,
    pub item_updates: Vec<ItemUpdate>,
    pub new_items: Vec<NewItem>,
    pub beat_updates: Vec<BeatUpdate>,
    pub new_beats: Vec<NewBeat>,
    /// Scene-level current location by name; applied only if that location
    /// exists and is not already current.
    pub current_location: Option<String>,
    pub time_passed: TimePassed,
}

/// Remove `removals` case-insensitively, then append `additions` that are
/// not already present.
fn merge_string_set(target: &mut Vec<String>, additions: &[String], removals: &[String]) -> bool {
    let before = target.clone();
    target.retain(|existing| !removals.iter().any(|r| name_eq(existing, r)));
    for addition in additions {
        if !target.iter().any(|existing| name_eq(existing, addition)) {
            target.push(addition.clone());
        }
    }
    *target != before
}

impl<S: Storage> StoryEngine<S> {
    /// Apply one classification result to the loaded story.
    ///
    /// Emits a single [`StateUpdated`] notification, and only if at least
    /// one mutation occurred. Applying the same result twice never creates
    /// duplicate entities, though updates may be re-applied.
    pub async fn apply_classification(
        &mut self,
        result: ClassificationResult,
    ) -> Result<StateUpdated, EngineError> {
        let state = self.state_mut()?;
        let story_id = state.story.id;
        let mut event = StateUpdated::new(story_id);

        // Indices of mutated records; BTreeSet keeps persistence ordering
        // deterministic.
        let mut changed_characters = BTreeSet::new();
        let mut changed_locations = BTreeSet::new();
        let mut changed_items = BTreeSet::new();
        let mut changed_beats = BTreeSet::new();

        // ---- characters ------------------------------------------------

        for update in &result.character_updates {
            let Some(index) = state
                .characters
                .iter()
                .position(|c| name_eq(&c.name, &update.name))
            else {
                continue;
            };
            let character = &mut state.characters[index];
            let mut touched = false;

            if let Some(status) = &update.status {
                if character.status != *status {
                    character.status = status.clone();
                    touched = true;
                }
            }
            if let Some(relationship) = &update.relationship {
                // The protagonist flag never moves through a merge.
                let demotes_self = character.is_protagonist();
                let promotes_self = relationship == SELF_RELATIONSHIP;
                if !demotes_self && !promotes_self && character.relationship != *relationship {
                    character.relationship = relationship.clone();
                    touched = true;
                }
            }
            if merge_string_set(
                &mut character.traits,
                &update.add_traits,
                &update.remove_traits,
            ) {
                touched = true;
            }
            if let Some(visuals) = &update.visuals {
                if let Some(replacement) = &visuals.replace {
                    if character.visual_descriptors != *replacement {
                        character.visual_descriptors = replacement.clone();
                        touched = true;
                    }
                } else if merge_string_set(
                    &mut character.visual_descriptors,
                    &visuals.add,
                    &visuals.remove,
                ) {
                    touched = true;
                }
            }
            if touched {
                changed_characters.insert(index);
            }
        }

        for new in &result.new_characters {
            if state
                .characters
                .iter()
                .any(|c| name_eq(&c.name, &new.name))
            {
                continue;
            }
            let mut character = Character::new(story_id, new.name.clone());
            character.description = new.description.clone().unwrap_or_default();
            character.status = new.status.clone().unwrap_or_default();
            character.traits = new.traits.clone();
            // A classifier cannot mint a protagonist.
            character.relationship = match new.relationship.as_deref() {
                Some(SELF_RELATIONSHIP) | None => "unknown".to_string(),
                Some(other) => other.to_string(),
            };
            state.characters.push(character);
            changed_characters.insert(state.characters.len() - 1);
        }

        // ---- locations -------------------------------------------------

        for update in &result.location_updates {
            let Some(index) = state
                .locations
                .iter()
                .position(|l| name_eq(&l.name, &update.name))
            else {
                continue;
            };
            let mut touched = false;
            {
                let location = &mut state.locations[index];
                if let Some(visited) = update.visited {
                    if location.visited != visited {
                        location.visited = visited;
                        touched = true;
                    }
                }
                if let Some(addition) = &update.append_description {
                    let addition = addition.trim();
                    if !addition.is_empty() {
                        if location.description.is_empty() {
                            location.description = addition.to_string();
                        } else {
                            location.description.push(' ');
                            location.description.push_str(addition);
                        }
                        touched = true;
                    }
                }
                if update.current == Some(false) && location.current {
                    location.current = false;
                    touched = true;
                }
            }
            if update.current == Some(true) {
                for i in make_current_location(state, index) {
                    changed_locations.insert(i);
                }
            }
            if touched {
                changed_locations.insert(index);
            }
        }

        for new in &result.new_locations {
            if state.locations.iter().any(|l| name_eq(&l.name, &new.name)) {
                continue;
            }
            let mut location = Location::new(story_id, new.name.clone());
            location.description = new.description.clone().unwrap_or_default();
            state.locations.push(location);
            changed_locations.insert(state.locations.len() - 1);
        }

        // Scene-level signal: force exclusivity if the named location exists
        // and is not already current. An unknown name is ignored.
        if let Some(name) = &result.current_location {
            if let Some(index) = state
                .locations
                .iter()
                .position(|l| name_eq(&l.name, name))
            {
                if !state.locations[index].current {
                    for i in make_current_location(state, index) {
                        changed_locations.insert(i);
                    }
                }
            }
        }

        // ---- items -----------------------------------------------------

        for update in &result.item_updates {
            let Some(index) = state
                .items
                .iter()
                .position(|i| name_eq(&i.name, &update.name))
            else {
                continue;
            };
            let item = &mut state.items[index];
            let mut touched = false;
            if let Some(quantity) = update.quantity {
                if item.quantity != quantity {
                    item.quantity = quantity;
                    touched = true;
                }
            }
            if let Some(equipped) = update.equipped {
                if item.equipped != equipped {
                    item.equipped = equipped;
                    touched = true;
                }
            }
            if let Some(location) = &update.location {
                if item.location.as_deref() != Some(location.as_str()) {
                    item.location = Some(location.clone());
                    touched = true;
                }
            }
            if touched {
                changed_items.insert(index);
            }
        }

        for new in &result.new_items {
            if state.items.iter().any(|i| name_eq(&i.name, &new.name)) {
                continue;
            }
            let mut item = Item::new(story_id, new.name.clone());
            item.description = new.description.clone().unwrap_or_default();
            item.quantity = new.quantity.unwrap_or(1);
            state.items.push(item);
            changed_items.insert(state.items.len() - 1);
        }

        // ---- story beats -------------------------------------------------

        for update in &result.beat_updates {
            let Some(index) = state
                .beats
                .iter()
                .position(|b| name_eq(&b.name, &update.name))
            else {
                continue;
            };
            let beat = &mut state.beats[index];
            let mut touched = false;
            if let Some(status) = update.status {
                if beat.status != status {
                    beat.status = status;
                    beat.resolved_at = if status.is_resolved() {
                        Some(update.resolved_at.unwrap_or_else(now_millis))
                    } else {
                        update.resolved_at
                    };
                    touched = true;
                }
            } else if update.resolved_at.is_some() && beat.resolved_at != update.resolved_at {
                beat.resolved_at = update.resolved_at;
                touched = true;
            }
            if touched {
                changed_beats.insert(index);
            }
        }

        for new in &result.new_beats {
            if state.beats.iter().any(|b| name_eq(&b.name, &new.name)) {
                continue;
            }
            let mut beat = StoryBeat::new(story_id, new.name.clone());
            beat.description = new.description.clone().unwrap_or_default();
            state.beats.push(beat);
            changed_beats.insert(state.beats.len() - 1);
        }

        // ---- time progression --------------------------------------------

        if let Some(delta) = result.time_passed.delta() {
            let mut tracker = state.story.time_tracker.unwrap_or_default();
            tracker.add(delta);
            state.story.time_tracker = Some(tracker);
            event.time_advanced = true;
        }

        event.characters = changed_characters.len();
        event.locations = changed_locations.len();
        event.items = changed_items.len();
        event.beats = changed_beats.len();

        // ---- persistence --------------------------------------------------

        let characters: Vec<Character> = changed_characters
            .iter()
            .map(|&i| state.characters[i].clone())
            .collect();
        let locations: Vec<Location> = changed_locations
            .iter()
            .map(|&i| state.locations[i].clone())
            .collect();
        let items: Vec<Item> = changed_items
            .iter()
            .map(|&i| state.items[i].clone())
            .collect();
        let beats: Vec<StoryBeat> = changed_beats
            .iter()
            .map(|&i| state.beats[i].clone())
            .collect();
        let story = state.story.clone();

        for character in &characters {
            self.storage.put_character(character).await?;
        }
        for location in &locations {
            self.storage.put_location(location).await?;
        }
        for item in &items {
            self.storage.put_item(item).await?;
        }
        for beat in &beats {
            self.storage.put_beat(beat).await?;
        }
        if event.time_advanced {
            self.storage.put_story(&story).await?;
        }

        if event.any_changes() {
            tracing::debug!(
                story = %story_id,
                characters = event.characters,
                locations = event.locations,
                items = event.items,
                beats = event.beats,
                time_advanced = event.time_advanced,
                "world state merged"
            );
            self.emit(event.clone());
        }
        Ok(event)
    }
}
