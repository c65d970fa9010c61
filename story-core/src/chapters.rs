//! Chapter boundary management.
//!
//! Chapters compress old ledger entries into summaries. The highest-numbered
//! chapter defines the boundary between summarized history and the live
//! entries still shown in full. This module owns the boundary math, the
//! compression-trigger statistics, the load-time self-heal for orphaned
//! chapter references, and manual chapter creation through an external
//! summarizer.

use crate::engine::StoryEngine;
use crate::error::EngineError;
use crate::model::{Chapter, ChapterId, EntryId, StoryEntry};
use crate::storage::Storage;
use std::collections::HashSet;
use std::future::Future;
use thiserror::Error;

/// Failure reported by an external summarizer.
///
/// The engine leaves state untouched when summarization fails; callers
/// retry or surface the message.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SummarizerError(pub String);

/// What the summarizer receives: the entries to compress, in order, plus
/// the chapters that already exist as context.
#[derive(Debug)]
pub struct SummaryRequest<'a> {
    pub entries: &'a [StoryEntry],
    pub prior_chapters: &'a [Chapter],
}

/// What the summarizer returns.
#[derive(Debug, Clone, Default)]
pub struct ChapterSummary {
    pub title: String,
    pub summary: String,
    pub keywords: Vec<String>,
    pub characters: Vec<String>,
    pub locations: Vec<String>,
    pub plot_threads: Vec<String>,
    pub emotional_tone: Option<String>,
}

/// External summarization service.
pub trait Summarizer: Send + Sync {
    fn summarize(
        &self,
        request: SummaryRequest<'_>,
    ) -> impl Future<Output = Result<ChapterSummary, SummarizerError>> + Send;
}

impl<S: Storage> StoryEngine<S> {
    /// Ledger index separating summarized history from live entries.
    ///
    /// Resolved from the highest-numbered chapter's end entry. If that entry
    /// is gone (orphaned reference from a prior crash or retry race), fall
    /// back to `min(sum of chapter entry counts, ledger length)` -- a
    /// conservative estimate that keeps the history compressed rather than
    /// silently exposing all of it to the context window.
    pub fn last_chapter_end_index(&self) -> usize {
        let Some(state) = self.state.as_ref() else {
            return 0;
        };
        let Some(last) = state.chapters.iter().max_by_key(|c| c.number) else {
            return 0;
        };
        match state
            .entries
            .iter()
            .position(|e| e.id == last.end_entry_id)
        {
            Some(index) => index + 1,
            None => {
                let estimate: usize = state.chapters.iter().map(|c| c.entry_count).sum();
                estimate.min(state.entries.len())
            }
        }
    }

    /// The live slice of the ledger: everything after the chapter boundary,
    /// or the whole ledger when no chapters exist.
    pub fn visible_entries(&self) -> &[StoryEntry] {
        let entries = self.entries();
        &entries[self.last_chapter_end_index()..]
    }

    /// Sum of cached token counts over the live entries.
    pub fn tokens_since_last_chapter(&self) -> usize {
        self.visible_entries()
            .iter()
            .map(|e| e.metadata.tokens)
            .sum()
    }

    /// Tokens over the live entries excluding the configured recency buffer.
    ///
    /// This is the compression-trigger input. A buffer of zero means every
    /// live entry counts; the zero-length tail is not special-cased into
    /// "no entries".
    pub fn tokens_outside_buffer(&self) -> usize {
        let visible = self.visible_entries();
        let buffer = self
            .state
            .as_ref()
            .map_or(0, |s| s.story.memory.chapter_buffer);
        let eligible = visible.len().saturating_sub(buffer);
        visible[..eligible].iter().map(|e| e.metadata.tokens).sum()
    }

    /// Verify every chapter's boundary entries still exist, deleting any
    /// chapter that fails and re-sorting the rest by number.
    ///
    /// This is a self-healing pass, not a hard failure: it tolerates
    /// partially corrupted history from prior crashes or retry races.
    /// Returns whether a repair occurred.
    pub async fn validate_chapter_integrity(&mut self) -> Result<bool, EngineError> {
        let state = self.state()?;
        let present: HashSet<EntryId> = state.entries.iter().map(|e| e.id).collect();
        let orphaned: Vec<ChapterId> = state
            .chapters
            .iter()
            .filter(|c| {
                !present.contains(&c.start_entry_id) || !present.contains(&c.end_entry_id)
            })
            .map(|c| c.id)
            .collect();

        if orphaned.is_empty() {
            let state = self.state_mut()?;
            state.chapters.sort_by_key(|c| c.number);
            return Ok(false);
        }

        for id in &orphaned {
            tracing::warn!(chapter = %id, "deleting chapter with orphaned entry reference");
            self.storage.delete_chapter(*id).await?;
        }
        let state = self.state_mut()?;
        state.chapters.retain(|c| !orphaned.contains(&c.id));
        state.chapters.sort_by_key(|c| c.number);
        Ok(true)
    }

    /// Compress the live entries up to `end_index` (exclusive) into a new
    /// chapter via the external summarizer.
    ///
    /// `end_index` must lie strictly after the current boundary and within
    /// the ledger. On summarizer failure nothing changes: no partial
    /// chapter is recorded.
    pub async fn create_manual_chapter<Sm: Summarizer>(
        &mut self,
        end_index: usize,
        summarizer: &Sm,
    ) -> Result<ChapterId, EngineError> {
        let start = self.last_chapter_end_index();
        let state = self.state()?;
        let len = state.entries.len();
        if end_index <= start || end_index > len {
            return Err(EngineError::InvalidChapterRange {
                start,
                end: end_index,
                len,
            });
        }

        let covered: Vec<StoryEntry> = state.entries[start..end_index].to_vec();
        let prior: Vec<Chapter> = state.chapters.clone();
        let story_id = state.story.id;

        let summary = summarizer
            .summarize(SummaryRequest {
                entries: &covered,
                prior_chapters: &prior,
            })
            .await
            .map_err(|e| EngineError::Summarizer(e.to_string()))?;

        // Sequential numbering comes from storage so deleted chapters never
        // free their numbers.
        let number = self.storage.next_chapter_number(story_id).await?;

        let first = &covered[0];
        let last = &covered[covered.len() - 1];
        let chapter = Chapter {
            id: ChapterId::new(),
            story_id,
            number,
            start_entry_id: first.id,
            end_entry_id: last.id,
            entry_count: covered.len(),
            title: summary.title,
            summary: summary.summary,
            keywords: summary.keywords,
            characters: summary.characters,
            locations: summary.locations,
            plot_threads: summary.plot_threads,
            emotional_tone: summary.emotional_tone,
            time_start: first.metadata.time_start,
            time_end: last.metadata.time_end,
        };
        self.storage.put_chapter(&chapter).await?;

        let id = chapter.id;
        let state = self.state_mut()?;
        state.chapters.push(chapter);
        state.chapters.sort_by_key(|c| c.number);
        Ok(id)
    }
}
