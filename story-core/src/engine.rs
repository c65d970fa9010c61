//! StoryEngine - the primary public API for narrative state management.
//!
//! The engine owns the mutable world model of one loaded story at a time
//! and guarantees it stays consistent under AI-driven bulk mutation, chapter
//! compression, and retry/undo rollback. It assumes a single logical writer:
//! operations are invoked sequentially from one controlling flow, and each
//! mutator is awaited before the next begins.

use crate::error::EngineError;
use crate::events::StateUpdated;
use crate::model::{
    Chapter, Character, Checkpoint, EmbeddedImage, Item, Location, LorebookEntry, Story,
    StoryBeat, StoryEntry, StoryId,
};
use crate::retry::RetryBackup;
use crate::storage::{Storage, StorageError};
use crate::time::{TimeTracker, TrackerRestore};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Capacity of the notification channel. Events are fire-and-forget; a slow
/// subscriber lags rather than blocking mutators.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Counts tokens for context budgeting.
///
/// Must be pure and deterministic: the ledger caches counts and only
/// recomputes them when content changes.
pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;
}

// ============================================================================
// Serialized Write Queue
// ============================================================================

type WriteJob = BoxFuture<'static, Result<(), StorageError>>;

/// Single-consumer queue that serializes durable writes for one concern.
///
/// Jobs run strictly in submission order on a background task, so two
/// overlapping saves of the same record cannot interleave and corrupt the
/// durable copy. A failing write is logged and dropped; it never reaches the
/// caller and never rolls back the in-memory state.
pub(crate) struct WriteQueue {
    tx: mpsc::UnboundedSender<WriteJob>,
}

impl WriteQueue {
    /// Spawn the consumer task. Must run inside a Tokio runtime.
    pub(crate) fn spawn(concern: &'static str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteJob>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Err(err) = job.await {
                    tracing::warn!(concern, error = %err, "background write failed");
                }
            }
        });
        Self { tx }
    }

    /// Queue a write. Returns immediately.
    pub(crate) fn enqueue<F>(&self, job: F)
    where
        F: Future<Output = Result<(), StorageError>> + Send + 'static,
    {
        // Send only fails after the consumer task is gone, i.e. at shutdown.
        let _ = self.tx.send(Box::pin(job));
    }

    /// Wait until every previously queued job has finished.
    pub(crate) async fn settle(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.enqueue(async move {
            let _ = done_tx.send(());
            Ok(())
        });
        let _ = done_rx.await;
    }
}

// ============================================================================
// Loaded Story State
// ============================================================================

/// The loaded story and its collections.
///
/// Entries live behind an `Arc` and are only ever mutated through
/// `Arc::make_mut`: a retry backup holding a clone of the `Arc` keeps the
/// pre-mutation history intact without copying it. The smaller collections
/// are cloned by value where a backup needs them.
#[derive(Debug, Clone)]
pub(crate) struct StoryState {
    pub story: Story,
    pub entries: Arc<Vec<StoryEntry>>,
    pub characters: Vec<Character>,
    pub locations: Vec<Location>,
    pub items: Vec<Item>,
    pub beats: Vec<StoryBeat>,
    pub chapters: Vec<Chapter>,
    pub lorebook: Vec<LorebookEntry>,
    pub images: Vec<EmbeddedImage>,
}

// ============================================================================
// Engine
// ============================================================================

/// The narrative state engine.
///
/// Generic over its [`Storage`] backend; AI collaborators (summarizer,
/// classifier, tokenizer) are passed in at the call sites that need them.
pub struct StoryEngine<S: Storage> {
    pub(crate) storage: Arc<S>,
    pub(crate) tokenizer: Arc<dyn Tokenizer>,
    pub(crate) state: Option<StoryState>,
    /// Checkpoints for the loaded story. Deletion works without a loaded
    /// story, going straight to storage.
    pub(crate) checkpoints: Vec<Checkpoint>,
    /// In-memory retry backups, keyed by story.
    pub(crate) retry_backups: HashMap<StoryId, RetryBackup>,
    events: broadcast::Sender<StateUpdated>,
    pub(crate) retry_writes: WriteQueue,
    pub(crate) style_writes: WriteQueue,
}

impl<S: Storage> StoryEngine<S> {
    /// Create an engine over the given storage and tokenizer.
    ///
    /// Spawns the background write consumers, so this must be called inside
    /// a Tokio runtime.
    pub fn new(storage: Arc<S>, tokenizer: Arc<dyn Tokenizer>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            storage,
            tokenizer,
            state: None,
            checkpoints: Vec::new(),
            retry_backups: HashMap::new(),
            events,
            retry_writes: WriteQueue::spawn("retry-state"),
            style_writes: WriteQueue::spawn("style-review-state"),
        }
    }

    /// Subscribe to state-update notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StateUpdated> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: StateUpdated) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Wait for every queued background write to drain.
    ///
    /// Useful before shutdown and in tests that assert on durable state.
    pub async fn flush_pending_writes(&self) {
        self.retry_writes.settle().await;
        self.style_writes.settle().await;
    }

    // ---- lifecycle ---------------------------------------------------------

    /// Create and load a brand-new story.
    pub async fn create_story(&mut self, story: Story) -> Result<(), EngineError> {
        self.storage.put_story(&story).await?;
        self.checkpoints = Vec::new();
        self.state = Some(StoryState {
            story,
            entries: Arc::new(Vec::new()),
            characters: Vec::new(),
            locations: Vec::new(),
            items: Vec::new(),
            beats: Vec::new(),
            chapters: Vec::new(),
            lorebook: Vec::new(),
            images: Vec::new(),
        });
        Ok(())
    }

    /// Load a story and make it current.
    ///
    /// Runs the chapter integrity self-heal and installs any durable retry
    /// backup that survived a restart (unless a full in-memory backup for
    /// this story already exists).
    pub async fn open_story(&mut self, story_id: StoryId) -> Result<(), EngineError> {
        let story = self
            .storage
            .get_story(story_id)
            .await?
            .ok_or(EngineError::StoryNotFound)?;
        let mut collections = self.storage.load_collections(story_id).await?;
        let checkpoints = std::mem::take(&mut collections.checkpoints);

        self.state = Some(StoryState {
            story,
            entries: Arc::new(collections.entries),
            characters: collections.characters,
            locations: collections.locations,
            items: collections.items,
            beats: collections.beats,
            chapters: collections.chapters,
            lorebook: collections.lorebook,
            images: collections.images,
        });
        self.checkpoints = checkpoints;

        let repaired = self.validate_chapter_integrity().await?;
        if repaired {
            tracing::warn!(story = %story_id, "repaired orphaned chapter references at load");
        }

        self.load_retry_backup_from_persistent(story_id).await?;
        Ok(())
    }

    /// Unload the current story. In-memory retry backups survive unload;
    /// they are keyed by story and reconciled again at open time.
    pub fn close_story(&mut self) {
        self.state = None;
        self.checkpoints = Vec::new();
    }

    /// True if a story is currently loaded.
    pub fn is_loaded(&self) -> bool {
        self.state.is_some()
    }

    /// The loaded story, if any.
    pub fn story(&self) -> Option<&Story> {
        self.state.as_ref().map(|s| &s.story)
    }

    pub(crate) fn state(&self) -> Result<&StoryState, EngineError> {
        self.state.as_ref().ok_or(EngineError::NoStoryLoaded)
    }

    pub(crate) fn state_mut(&mut self) -> Result<&mut StoryState, EngineError> {
        self.state.as_mut().ok_or(EngineError::NoStoryLoaded)
    }

    // ---- time tracker ------------------------------------------------------

    /// The loaded story's tracker; `None` when cleared or no story loaded.
    pub fn time_tracker(&self) -> Option<TimeTracker> {
        self.state.as_ref().and_then(|s| s.story.time_tracker)
    }

    /// Set the tracker to a value, normalizing before persisting.
    pub async fn set_time_tracker(&mut self, tracker: TimeTracker) -> Result<(), EngineError> {
        let state = self.state_mut()?;
        state.story.time_tracker = Some(tracker.normalized());
        let story = state.story.clone();
        self.storage.put_story(&story).await?;
        Ok(())
    }

    /// Add a delta to the tracker, normalizing before persisting.
    ///
    /// A cleared tracker starts from zero.
    pub async fn add_time(&mut self, delta: TimeTracker) -> Result<(), EngineError> {
        let state = self.state_mut()?;
        let mut tracker = state.story.time_tracker.unwrap_or_default();
        tracker.add(delta);
        state.story.time_tracker = Some(tracker);
        let story = state.story.clone();
        self.storage.put_story(&story).await?;
        Ok(())
    }

    /// Clear the tracker.
    pub async fn clear_time_tracker(&mut self) -> Result<(), EngineError> {
        let state = self.state_mut()?;
        state.story.time_tracker = None;
        let story = state.story.clone();
        self.storage.put_story(&story).await?;
        Ok(())
    }

    /// Apply a backed-up tracker with three-way semantics: skip entirely,
    /// explicitly clear, or normalize-and-set. Callers rely on `Skip` to
    /// avoid clobbering the tracker when a backup never touched it.
    pub async fn restore_time_tracker_snapshot(
        &mut self,
        snapshot: TrackerRestore,
    ) -> Result<(), EngineError> {
        match snapshot {
            TrackerRestore::Skip => Ok(()),
            TrackerRestore::Clear => self.clear_time_tracker().await,
            TrackerRestore::Set(tracker) => self.set_time_tracker(tracker).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StoryMode;
    use crate::testing::WordTokenizer;

    fn engine() -> StoryEngine<crate::storage::MemoryStorage> {
        StoryEngine::new(
            Arc::new(crate::storage::MemoryStorage::new()),
            Arc::new(WordTokenizer),
        )
    }

    #[tokio::test]
    async fn test_mutators_require_loaded_story() {
        let mut engine = engine();
        let err = engine.set_time_tracker(TimeTracker::default()).await;
        assert!(matches!(err, Err(EngineError::NoStoryLoaded)));
    }

    #[tokio::test]
    async fn test_tracker_restore_three_way() {
        let mut engine = engine();
        engine
            .create_story(Story::new("Test", StoryMode::Adventure))
            .await
            .unwrap();
        engine
            .set_time_tracker(TimeTracker::from_hours(5))
            .await
            .unwrap();

        // Skip leaves the live value alone.
        engine
            .restore_time_tracker_snapshot(TrackerRestore::Skip)
            .await
            .unwrap();
        assert_eq!(engine.time_tracker(), Some(TimeTracker::from_hours(5)));

        // Set normalizes.
        engine
            .restore_time_tracker_snapshot(TrackerRestore::Set(TimeTracker {
                years: 0,
                days: 0,
                hours: 0,
                minutes: 75,
            }))
            .await
            .unwrap();
        assert_eq!(engine.time_tracker(), Some(TimeTracker::new(0, 0, 1, 15)));

        // Clear is explicit.
        engine
            .restore_time_tracker_snapshot(TrackerRestore::Clear)
            .await
            .unwrap();
        assert_eq!(engine.time_tracker(), None);
    }

    #[tokio::test]
    async fn test_open_story_round_trip() {
        let storage = Arc::new(crate::storage::MemoryStorage::new());
        let mut engine = StoryEngine::new(Arc::clone(&storage), Arc::new(WordTokenizer));
        let story = Story::new("Reopenable", StoryMode::CreativeWriting);
        let story_id = story.id;
        engine.create_story(story).await.unwrap();
        engine.close_story();
        assert!(!engine.is_loaded());

        engine.open_story(story_id).await.unwrap();
        assert_eq!(engine.story().unwrap().name, "Reopenable");
    }

    #[tokio::test]
    async fn test_open_missing_story() {
        let mut engine = engine();
        let err = engine.open_story(StoryId::new()).await;
        assert!(matches!(err, Err(EngineError::StoryNotFound)));
    }
}
