//! QA tests for checkpoints and retry/undo rollback.
//!
//! These exercise the two snapshot/restore paths end to end, including a
//! simulated process restart against the file-backed store.
//!
//! Run with: `cargo test -p story-core --test qa_rollback`

use std::sync::Arc;
use story_core::testing::{StoryHarness, WordTokenizer};
use story_core::{
    EntryType, JsonStorage, Story, StoryEngine, StoryMode, TimeTracker,
};

// =============================================================================
// CHECKPOINTS
// =============================================================================

#[tokio::test]
async fn test_checkpoint_round_trip_is_exact() {
    let mut harness = StoryHarness::new().await;
    harness.narrate("the calm before").await;
    harness.engine.add_character("Aria", "self").await.unwrap();
    harness.engine.add_location("Harbor").await.unwrap();
    harness.engine.add_item("Lantern").await.unwrap();
    harness.engine.add_beat("Find the smuggler").await.unwrap();
    harness
        .engine
        .set_time_tracker(TimeTracker::new(0, 3, 0, 0))
        .await
        .unwrap();

    let id = harness.engine.create_checkpoint("safe point").await.unwrap();
    let saved = harness.engine.checkpoints()[0].snapshot.clone();

    harness.narrate("everything goes wrong").await;
    harness.engine.add_character("Villain", "enemy").await.unwrap();
    harness.engine.delete_item(harness.engine.items()[0].id).await.unwrap();
    harness.engine.clear_time_tracker().await.unwrap();

    harness.engine.restore_checkpoint(id).await.unwrap();

    assert_eq!(harness.engine.entries(), &saved.entries[..]);
    assert_eq!(harness.engine.characters(), &saved.characters[..]);
    assert_eq!(harness.engine.locations(), &saved.locations[..]);
    assert_eq!(harness.engine.items(), &saved.items[..]);
    assert_eq!(harness.engine.beats(), &saved.beats[..]);
    assert_eq!(harness.engine.time_tracker(), Some(TimeTracker::new(0, 3, 0, 0)));
}

#[tokio::test]
async fn test_checkpoint_restore_is_durable() {
    let mut harness = StoryHarness::new().await;
    harness.narrate("kept").await;
    let id = harness.engine.create_checkpoint("before").await.unwrap();
    harness.narrate("discarded").await;
    harness.engine.restore_checkpoint(id).await.unwrap();

    // Reopen from the same storage: the discarded entry is gone there too.
    let story_id = harness.engine.story().unwrap().id;
    let mut engine = StoryEngine::new(Arc::clone(&harness.storage), Arc::new(WordTokenizer));
    engine.open_story(story_id).await.unwrap();
    assert_eq!(engine.entries().len(), 1);
    assert_eq!(engine.entries()[0].content, "kept");
}

// =============================================================================
// RETRY / UNDO
// =============================================================================

#[tokio::test]
async fn test_retry_backup_shields_a_bad_reroll() {
    let mut harness = StoryHarness::new().await;
    harness.act("attack the guard").await;
    harness.narrate("The guard parries.").await;
    harness.engine.add_character("Guard", "enemy").await.unwrap();

    // User asks for a reroll of the last response.
    harness.engine.create_retry_backup().unwrap();
    harness
        .engine
        .delete_entries_from_position(1)
        .await
        .unwrap();
    harness.narrate("The guard falls, and a crowd gathers.").await;
    harness.engine.add_character("Onlooker", "stranger").await.unwrap();

    // User rejects the reroll.
    harness.engine.restore_retry_backup().await.unwrap();

    assert_eq!(harness.engine.entries().len(), 2);
    assert_eq!(harness.engine.entries()[1].content, "The guard parries.");
    assert_eq!(harness.engine.characters().len(), 1);
    assert_eq!(harness.engine.characters()[0].name, "Guard");
}

#[tokio::test]
async fn test_retry_backup_survives_restart_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stories.json");
    let story_id;

    {
        let storage = Arc::new(JsonStorage::open(&path).await.unwrap());
        let mut engine = StoryEngine::new(storage, Arc::new(WordTokenizer));
        engine
            .create_story(Story::new("Crashy", StoryMode::Adventure))
            .await
            .unwrap();
        story_id = engine.story().unwrap().id;
        engine
            .add_entry(EntryType::Narration, "before the crash", None)
            .await
            .unwrap();
        engine.add_character("Aria", "self").await.unwrap();
        engine.create_retry_backup().unwrap();
        engine.flush_pending_writes().await;

        // Mutations after the backup, then the process dies.
        engine
            .add_entry(EntryType::Narration, "half-applied reroll", None)
            .await
            .unwrap();
        engine.add_character("Glitch", "stranger").await.unwrap();
    }

    let storage = Arc::new(JsonStorage::open(&path).await.unwrap());
    let mut engine = StoryEngine::new(storage, Arc::new(WordTokenizer));
    engine.open_story(story_id).await.unwrap();
    assert!(engine.has_retry_backup(story_id));

    engine.restore_retry_backup().await.unwrap();
    assert_eq!(engine.entries().len(), 1);
    assert_eq!(engine.entries()[0].content, "before the crash");
    assert_eq!(engine.characters().len(), 1);
    assert_eq!(engine.characters()[0].name, "Aria");
}

#[tokio::test]
async fn test_dismissing_a_backup_keeps_the_story() {
    let mut harness = StoryHarness::new().await;
    harness.narrate("first draft").await;
    harness.engine.create_retry_backup().unwrap();
    harness.narrate("accepted reroll").await;

    // User accepts the reroll; the backup is dismissed for good.
    let story_id = harness.engine.story().unwrap().id;
    harness.engine.clear_retry_backup(story_id, true);
    harness.engine.flush_pending_writes().await;

    assert!(!harness.engine.has_retry_backup(story_id));
    assert_eq!(harness.engine.entries().len(), 2);

    // Nothing to restore anymore.
    assert!(harness.engine.restore_retry_backup().await.is_err());
}
