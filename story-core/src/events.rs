//! Engine notifications.
//!
//! Collections are plain owned data behind explicit mutators, so interested
//! parties subscribe to an explicit event channel instead of observing the
//! collections themselves.

use crate::model::StoryId;
use serde::{Deserialize, Serialize};

/// Emitted after a world-state merge that changed at least one thing.
///
/// Carries per-kind counts of affected entities. At most one event is
/// emitted per classification result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdated {
    pub story_id: StoryId,
    /// Characters created or updated.
    pub characters: usize,
    /// Locations created or updated.
    pub locations: usize,
    /// Items created or updated.
    pub items: usize,
    /// Story beats created or updated.
    pub beats: usize,
    /// Whether the merge advanced the time tracker.
    pub time_advanced: bool,
}

impl StateUpdated {
    pub fn new(story_id: StoryId) -> Self {
        Self {
            story_id,
            characters: 0,
            locations: 0,
            items: 0,
            beats: 0,
            time_advanced: false,
        }
    }

    /// True if the merge touched anything at all.
    pub fn any_changes(&self) -> bool {
        self.characters > 0
            || self.locations > 0
            || self.items > 0
            || self.beats > 0
            || self.time_advanced
    }
}
