//! Story data model.
//!
//! Contains all types for representing a story's structured state: the
//! entry ledger, world entities (characters, locations, items, plot beats),
//! chapter summaries, checkpoints, and per-story configuration.

use crate::time::TimeTracker;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// The relationship value that marks a character as the protagonist.
pub const SELF_RELATIONSHIP: &str = "self";

// ============================================================================
// ID Types
// ============================================================================

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Unique identifier for stories.
    StoryId
);
id_type!(
    /// Unique identifier for ledger entries.
    EntryId
);
id_type!(
    /// Unique identifier for characters.
    CharacterId
);
id_type!(
    /// Unique identifier for locations.
    LocationId
);
id_type!(
    /// Unique identifier for items.
    ItemId
);
id_type!(
    /// Unique identifier for story beats.
    BeatId
);
id_type!(
    /// Unique identifier for chapters.
    ChapterId
);
id_type!(
    /// Unique identifier for checkpoints.
    CheckpointId
);
id_type!(
    /// Unique identifier for lorebook entries.
    LorebookId
);
id_type!(
    /// Unique identifier for embedded images.
    ImageId
);

/// Current wall-clock time as milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Story
// ============================================================================

/// How the story is played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoryMode {
    #[default]
    Adventure,
    CreativeWriting,
}

/// Narrative point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointOfView {
    First,
    #[default]
    Second,
    Third,
}

/// Narrative tense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tense {
    Past,
    #[default]
    Present,
}

/// Presentation settings for generated prose.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NarrativeSettings {
    pub point_of_view: PointOfView,
    pub tense: Tense,
    /// Replaces the default system prompt when set.
    pub prompt_override: Option<String>,
}

/// Memory-window configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Number of recent live entries kept out of compression eligibility.
    pub chapter_buffer: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { chapter_buffer: 10 }
    }
}

/// A story and its per-story configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: StoryId,
    pub name: String,
    pub mode: StoryMode,
    pub settings: NarrativeSettings,
    pub memory: MemoryConfig,
    /// Elapsed in-story time; `None` means the tracker was cleared.
    pub time_tracker: Option<TimeTracker>,
    pub created_at: u64,
}

impl Story {
    pub fn new(name: impl Into<String>, mode: StoryMode) -> Self {
        Self {
            id: StoryId::new(),
            name: name.into(),
            mode,
            settings: NarrativeSettings::default(),
            memory: MemoryConfig::default(),
            time_tracker: Some(TimeTracker::default()),
            created_at: now_millis(),
        }
    }

    pub fn with_chapter_buffer(mut self, chapter_buffer: usize) -> Self {
        self.memory.chapter_buffer = chapter_buffer;
        self
    }
}

// ============================================================================
// Ledger Entries
// ============================================================================

/// Kind of ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Narration,
    UserAction,
    System,
}

/// Cached metadata for a ledger entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Token count of the content, cached at write time.
    pub tokens: usize,
    /// Tracker value when the entry was created.
    pub time_start: Option<TimeTracker>,
    /// Tracker value when the entry's action concluded.
    pub time_end: Option<TimeTracker>,
    /// Caller-supplied extras carried through verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// One story beat in the append-only ledger.
///
/// `position` is assigned once at creation and never changes; content and
/// metadata may be edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryEntry {
    pub id: EntryId,
    pub story_id: StoryId,
    pub entry_type: EntryType,
    pub content: String,
    pub position: u64,
    pub metadata: EntryMetadata,
}

impl StoryEntry {
    /// Word count of the content.
    pub fn word_count(&self) -> usize {
        self.content.split_whitespace().count()
    }
}

// ============================================================================
// World Entities
// ============================================================================

/// A character in the story world.
///
/// Exactly one character per story carries `relationship == "self"` (the
/// protagonist). That flag only moves through the explicit swap operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: CharacterId,
    pub story_id: StoryId,
    pub name: String,
    pub description: String,
    pub status: String,
    pub relationship: String,
    pub traits: Vec<String>,
    pub visual_descriptors: Vec<String>,
    pub portrait: Option<String>,
}

impl Character {
    pub fn new(story_id: StoryId, name: impl Into<String>) -> Self {
        Self {
            id: CharacterId::new(),
            story_id,
            name: name.into(),
            description: String::new(),
            status: String::new(),
            relationship: "unknown".to_string(),
            traits: Vec::new(),
            visual_descriptors: Vec::new(),
            portrait: None,
        }
    }

    pub fn with_relationship(mut self, relationship: impl Into<String>) -> Self {
        self.relationship = relationship.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// True if this character is the protagonist.
    pub fn is_protagonist(&self) -> bool {
        self.relationship == SELF_RELATIONSHIP
    }
}

/// A location in the story world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub story_id: StoryId,
    pub name: String,
    pub description: String,
    pub visited: bool,
    /// At most one location per story is current at a time.
    pub current: bool,
}

impl Location {
    pub fn new(story_id: StoryId, name: impl Into<String>) -> Self {
        Self {
            id: LocationId::new(),
            story_id,
            name: name.into(),
            description: String::new(),
            visited: false,
            current: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// An item in the story world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub story_id: StoryId,
    pub name: String,
    pub description: String,
    pub quantity: u32,
    pub equipped: bool,
    /// Where the item currently is, free-form.
    pub location: Option<String>,
}

impl Item {
    pub fn new(story_id: StoryId, name: impl Into<String>) -> Self {
        Self {
            id: ItemId::new(),
            story_id,
            name: name.into(),
            description: String::new(),
            quantity: 1,
            equipped: false,
            location: None,
        }
    }
}

/// Lifecycle of a plot beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeatStatus {
    #[default]
    Pending,
    Active,
    Completed,
    Failed,
}

impl BeatStatus {
    /// True for the terminal states that stamp a resolution time.
    pub fn is_resolved(&self) -> bool {
        matches!(self, BeatStatus::Completed | BeatStatus::Failed)
    }
}

/// A tracked plot thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryBeat {
    pub id: BeatId,
    pub story_id: StoryId,
    pub name: String,
    pub description: String,
    pub status: BeatStatus,
    /// Set when the beat completes or fails, in epoch milliseconds.
    pub resolved_at: Option<u64>,
}

impl StoryBeat {
    pub fn new(story_id: StoryId, name: impl Into<String>) -> Self {
        Self {
            id: BeatId::new(),
            story_id,
            name: name.into(),
            description: String::new(),
            status: BeatStatus::Pending,
            resolved_at: None,
        }
    }
}

/// A lorebook entry: background knowledge keyed for prompt injection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LorebookEntry {
    pub id: LorebookId,
    pub story_id: StoryId,
    pub name: String,
    pub keywords: Vec<String>,
    pub content: String,
}

/// An image embedded in the story, referenced by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedImage {
    pub id: ImageId,
    pub story_id: StoryId,
    /// Entry the image is attached to, if any.
    pub entry_id: Option<EntryId>,
    /// Storage key or data URI for the image payload.
    pub source: String,
}

// ============================================================================
// Chapters
// ============================================================================

/// A compressed summary of a contiguous entry range.
///
/// Chapters are immutable once created. The chapter with the highest number
/// defines the boundary between summarized history and live context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: ChapterId,
    pub story_id: StoryId,
    /// Monotonic per-story sequence number; survives deletions.
    pub number: u32,
    pub start_entry_id: EntryId,
    pub end_entry_id: EntryId,
    /// Number of entries the chapter covered when it was created.
    pub entry_count: usize,
    pub title: String,
    pub summary: String,
    pub keywords: Vec<String>,
    pub characters: Vec<String>,
    pub locations: Vec<String>,
    pub plot_threads: Vec<String>,
    pub emotional_tone: Option<String>,
    /// Tracker value at the first covered entry.
    pub time_start: Option<TimeTracker>,
    /// Tracker value at the last covered entry.
    pub time_end: Option<TimeTracker>,
}

// ============================================================================
// Checkpoints
// ============================================================================

/// Full by-value copy of a story's collections at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorySnapshot {
    pub entries: Vec<StoryEntry>,
    pub characters: Vec<Character>,
    pub locations: Vec<Location>,
    pub items: Vec<Item>,
    pub beats: Vec<StoryBeat>,
    pub chapters: Vec<Chapter>,
    /// `None` means the tracker was cleared when the snapshot was taken.
    pub time_tracker: Option<TimeTracker>,
}

/// A named, on-demand snapshot of the whole story state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub story_id: StoryId,
    pub name: String,
    pub created_at: u64,
    pub snapshot: StorySnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protagonist_flag() {
        let story = StoryId::new();
        let hero = Character::new(story, "Aria").with_relationship(SELF_RELATIONSHIP);
        let other = Character::new(story, "Bram");
        assert!(hero.is_protagonist());
        assert!(!other.is_protagonist());
    }

    #[test]
    fn test_entry_word_count() {
        let entry = StoryEntry {
            id: EntryId::new(),
            story_id: StoryId::new(),
            entry_type: EntryType::Narration,
            content: "The door creaks open.".to_string(),
            position: 0,
            metadata: EntryMetadata::default(),
        };
        assert_eq!(entry.word_count(), 4);
    }

    #[test]
    fn test_story_mode_serde() {
        let json = serde_json::to_string(&StoryMode::CreativeWriting).unwrap();
        assert_eq!(json, "\"creative-writing\"");
    }

    #[test]
    fn test_beat_status_resolved() {
        assert!(BeatStatus::Completed.is_resolved());
        assert!(BeatStatus::Failed.is_resolved());
        assert!(!BeatStatus::Active.is_resolved());
        assert!(!BeatStatus::Pending.is_resolved());
    }
}
