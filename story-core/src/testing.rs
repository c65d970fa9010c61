//! Testing utilities.
//!
//! This module provides tools for integration testing:
//! - `WordTokenizer` for deterministic token counts
//! - `MockSummarizer` / `FailingSummarizer` for chapter creation without
//!   API calls
//! - `StoryHarness` for scripted story scenarios
//! - Assertion helpers for verifying engine state

use crate::chapters::{ChapterSummary, Summarizer, SummarizerError, SummaryRequest};
use crate::engine::{StoryEngine, Tokenizer};
use crate::model::{Character, EntryId, EntryType, Story, StoryMode};
use crate::storage::MemoryStorage;
use std::sync::Arc;

/// Counts whitespace-separated words. Deterministic stand-in for a real
/// tokenizer.
pub struct WordTokenizer;

impl Tokenizer for WordTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

/// A summarizer that returns a canned summary derived from the request.
///
/// The summary text embeds the entry count so tests can verify which
/// entries were covered.
#[derive(Debug, Clone)]
pub struct MockSummarizer {
    title: String,
}

impl Default for MockSummarizer {
    fn default() -> Self {
        Self {
            title: "Untitled Chapter".to_string(),
        }
    }
}

impl MockSummarizer {
    /// A mock that titles every chapter with the given text.
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
        }
    }
}

impl Summarizer for MockSummarizer {
    async fn summarize(
        &self,
        request: SummaryRequest<'_>,
    ) -> Result<ChapterSummary, SummarizerError> {
        Ok(ChapterSummary {
            title: self.title.clone(),
            summary: format!(
                "Summary of {} entries after {} prior chapters.",
                request.entries.len(),
                request.prior_chapters.len()
            ),
            keywords: vec!["test".to_string()],
            ..Default::default()
        })
    }
}

/// A summarizer that always fails, for error-path tests.
pub struct FailingSummarizer;

impl Summarizer for FailingSummarizer {
    async fn summarize(
        &self,
        _request: SummaryRequest<'_>,
    ) -> Result<ChapterSummary, SummarizerError> {
        Err(SummarizerError("summarizer unavailable".to_string()))
    }
}

/// Test harness for running story scenarios against in-memory storage.
pub struct StoryHarness {
    /// The engine under test.
    pub engine: StoryEngine<MemoryStorage>,
    /// Shared handle to the backing storage, for direct inspection.
    pub storage: Arc<MemoryStorage>,
}

impl StoryHarness {
    /// Create a harness with a fresh adventure-mode story already loaded.
    pub async fn new() -> Self {
        Self::with_story(Story::new("Test Story", StoryMode::Adventure)).await
    }

    /// Create a harness around a custom story.
    pub async fn with_story(story: Story) -> Self {
        let storage = Arc::new(MemoryStorage::new());
        let mut engine = StoryEngine::new(Arc::clone(&storage), Arc::new(WordTokenizer));
        engine
            .create_story(story)
            .await
            .unwrap_or_else(|e| panic!("create_story failed: {e}"));
        Self { engine, storage }
    }

    /// Append a narration entry.
    pub async fn narrate(&mut self, text: &str) -> EntryId {
        self.engine
            .add_entry(EntryType::Narration, text, None)
            .await
            .unwrap_or_else(|e| panic!("add_entry failed: {e}"))
    }

    /// Append a user-action entry.
    pub async fn act(&mut self, text: &str) -> EntryId {
        self.engine
            .add_entry(EntryType::UserAction, text, None)
            .await
            .unwrap_or_else(|e| panic!("add_entry failed: {e}"))
    }

    /// Look up a character by exact name.
    pub fn character(&self, name: &str) -> Option<&Character> {
        self.engine.characters().iter().find(|c| c.name == name)
    }

    /// Number of ledger entries.
    pub fn entry_count(&self) -> usize {
        self.engine.entries().len()
    }
}

// ============================================================================
// Assertion Helpers
// ============================================================================

/// Assert that a character with the given name exists.
#[track_caller]
pub fn assert_has_character(harness: &StoryHarness, name: &str) {
    assert!(
        harness.character(name).is_some(),
        "expected character '{name}' to exist"
    );
}

/// Assert that no character with the given name exists.
#[track_caller]
pub fn assert_no_character(harness: &StoryHarness, name: &str) {
    assert!(
        harness.character(name).is_none(),
        "expected character '{name}' to not exist"
    );
}

/// Assert the name of the single current location.
#[track_caller]
pub fn assert_current_location(harness: &StoryHarness, name: &str) {
    let current: Vec<_> = harness
        .engine
        .locations()
        .iter()
        .filter(|l| l.current)
        .collect();
    assert_eq!(
        current.len(),
        1,
        "expected exactly one current location, found {}",
        current.len()
    );
    assert_eq!(current[0].name, name, "wrong current location");
}

/// Assert the ledger length.
#[track_caller]
pub fn assert_entry_count(harness: &StoryHarness, expected: usize) {
    assert_eq!(
        harness.entry_count(),
        expected,
        "wrong number of ledger entries"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_tokenizer() {
        assert_eq!(WordTokenizer.count_tokens("one  two\nthree"), 3);
        assert_eq!(WordTokenizer.count_tokens(""), 0);
    }

    #[tokio::test]
    async fn test_harness_scenario() {
        let mut harness = StoryHarness::new().await;
        harness.narrate("The harbor sleeps.").await;
        harness.act("walk the pier").await;
        assert_entry_count(&harness, 2);

        harness.engine.add_character("Mira", "ally").await.unwrap();
        assert_has_character(&harness, "Mira");
        assert_no_character(&harness, "Nobody");
    }

    #[tokio::test]
    async fn test_mock_summarizer_is_deterministic() {
        let summarizer = MockSummarizer::titled("The Setup");
        let request = SummaryRequest {
            entries: &[],
            prior_chapters: &[],
        };
        let summary = summarizer.summarize(request).await.unwrap();
        assert_eq!(summary.title, "The Setup");
        assert_eq!(summary.summary, "Summary of 0 entries after 0 prior chapters.");
    }
}
