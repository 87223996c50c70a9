//! Presence integration tests.
//!
//! Verifies:
//! - Peers exclude the local user and rows older than the TTL
//! - Heartbeats refresh the row on schedule
//! - Cursor updates publish immediately
//! - Stopping removes the row and halts the heartbeat

use std::sync::Arc;
use std::time::Duration;

use digitalium_collab::{
    DocumentLifecycle, MemoryRepository, PresenceChange, PresenceRepository, PresenceTracker,
    SyncConfig, SyncSession,
};
use digitalium_core::{now_millis, user_color, CursorRange, PresenceRecord, UserIdentity};
use tokio::time::sleep;
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn tracker(
    repo: &Arc<MemoryRepository>,
    document_id: Uuid,
    name: &str,
) -> PresenceTracker<MemoryRepository> {
    let identity = UserIdentity::new(Uuid::new_v4(), name);
    PresenceTracker::start(repo.clone(), document_id, identity, &SyncConfig::default()).await
}

// ─── Peers ───────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_peers_exclude_self_and_stale_rows() {
    let repo = Arc::new(MemoryRepository::new());
    let doc = Uuid::new_v4();
    let alice = tracker(&repo, doc, "Alice").await;
    let _bob = tracker(&repo, doc, "Bob").await;

    // Carol was last seen six minutes ago
    let carol = UserIdentity::new(Uuid::new_v4(), "Carol");
    let six_minutes = 6 * 60 * 1000;
    repo.upsert_presence(PresenceRecord::new(doc, &carol, None, now_millis() - six_minutes))
        .await
        .unwrap();

    let peers = alice.active_peers().await.unwrap();
    let names: Vec<&str> = peers.iter().map(|p| p.user_name.as_str()).collect();
    assert_eq!(names, vec!["Bob"]);
    assert_eq!(repo.list_presences(doc).await.unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_peers_are_scoped_to_document() {
    let repo = Arc::new(MemoryRepository::new());
    let alice = tracker(&repo, Uuid::new_v4(), "Alice").await;
    let _elsewhere = tracker(&repo, Uuid::new_v4(), "Bob").await;
    assert!(alice.active_peers().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rows_carry_identity_color() {
    let repo = Arc::new(MemoryRepository::new());
    let doc = Uuid::new_v4();
    let alice = tracker(&repo, doc, "Alice").await;
    let bob = tracker(&repo, doc, "Bob").await;

    let peers = alice.active_peers().await.unwrap();
    assert_eq!(peers[0].user_id, bob.identity().user_id);
    assert_eq!(peers[0].user_color, user_color(bob.identity().user_id));
}

// ─── Heartbeat ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_heartbeat_refreshes_row() {
    let repo = Arc::new(MemoryRepository::new());
    let mut alice = tracker(&repo, Uuid::new_v4(), "Alice").await;
    assert_eq!(repo.presence_upserts(), 1);

    sleep(Duration::from_secs(29)).await;
    assert_eq!(repo.presence_upserts(), 1);
    sleep(Duration::from_secs(2)).await;
    assert_eq!(repo.presence_upserts(), 2);
    sleep(Duration::from_secs(30)).await;
    assert_eq!(repo.presence_upserts(), 3);

    alice.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_zero_heartbeat_interval_still_beats() {
    let repo = Arc::new(MemoryRepository::new());
    let config = SyncConfig {
        heartbeat_interval_secs: 0,
        ..SyncConfig::default()
    };
    let identity = UserIdentity::new(Uuid::new_v4(), "Alice");
    let mut alice = PresenceTracker::start(repo.clone(), Uuid::new_v4(), identity, &config).await;

    sleep(Duration::from_millis(3_500)).await;
    assert!(alice.is_running());
    assert_eq!(repo.presence_upserts(), 4);
    alice.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_cursor_update_is_published_immediately() {
    let repo = Arc::new(MemoryRepository::new());
    let doc = Uuid::new_v4();
    let alice = tracker(&repo, doc, "Alice").await;
    let bob = tracker(&repo, doc, "Bob").await;

    bob.update_cursor(Some(CursorRange::new(3, 7))).await;
    assert_eq!(bob.cursor(), Some(CursorRange::new(3, 7)));
    let peers = alice.active_peers().await.unwrap();
    assert_eq!(peers[0].cursor_position, Some(CursorRange::new(3, 7)));

    // Heartbeats keep the latest cursor
    sleep(Duration::from_secs(31)).await;
    let peers = alice.active_peers().await.unwrap();
    assert_eq!(peers[0].cursor_position, Some(CursorRange::new(3, 7)));
}

// ─── Stop & feed ─────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_stop_removes_row_and_halts_heartbeat() {
    let repo = Arc::new(MemoryRepository::new());
    let doc = Uuid::new_v4();
    let alice = tracker(&repo, doc, "Alice").await;
    let mut bob = tracker(&repo, doc, "Bob").await;

    bob.stop().await;
    assert!(!bob.is_running());
    assert!(alice.active_peers().await.unwrap().is_empty());

    let upserts = repo.presence_upserts();
    sleep(Duration::from_secs(31)).await;
    // Only Alice's heartbeat fired
    assert_eq!(repo.presence_upserts(), upserts + 1);
}

#[tokio::test(start_paused = true)]
async fn test_presence_feed_reports_joins_and_leaves() {
    let repo = Arc::new(MemoryRepository::new());
    let doc = Uuid::new_v4();
    let alice = tracker(&repo, doc, "Alice").await;
    let mut feed = alice.subscribe();

    let mut bob = tracker(&repo, doc, "Bob").await;
    let bob_id = bob.identity().user_id;
    match feed.recv().await.unwrap() {
        PresenceChange::Upserted(record) => assert_eq!(record.user_id, bob_id),
        other => panic!("unexpected change: {other:?}"),
    }

    bob.stop().await;
    assert_eq!(
        feed.recv().await.unwrap(),
        PresenceChange::Removed {
            document_id: doc,
            user_id: bob_id
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_session_announces_and_withdraws_presence() {
    let repo = Arc::new(MemoryRepository::new());
    let alice = UserIdentity::new(Uuid::new_v4(), "Alice");
    let doc = DocumentLifecycle::new(repo.clone())
        .create("Presence", alice.user_id, "")
        .await
        .unwrap();

    let config = SyncConfig::for_testing();
    let session = SyncSession::start(config, repo.clone(), None, doc.id, alice.clone())
        .await
        .unwrap();
    let rows = repo.list_presences(doc.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].user_name, "Alice");
    assert_eq!(session.presence().identity(), &alice);

    session.close().await;
    assert!(repo.list_presences(doc.id).await.unwrap().is_empty());
}
