//! DIGITALIUM sync demo: two users edit one document through an in-memory
//! repository and a shared on-disk cache, then the document is archived.
//!
//! Set `RUST_LOG=debug` to watch the sync driver, and
//! `DIGITALIUM_SYNC_CONFIG` to a JSON object to override timings.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use digitalium_collab::{
    CacheConfig, DocumentLifecycle, LocalStore, MemoryRepository, SessionEvent, SyncConfig,
    SyncSession,
};
use digitalium_core::{lock_replica, CollaboratorRole, CursorRange, TextOp, UserIdentity};
use log::{info, warn};
use uuid::Uuid;

fn load_config() -> SyncConfig {
    match std::env::var("DIGITALIUM_SYNC_CONFIG") {
        Ok(json) => SyncConfig::from_json(&json).unwrap_or_else(|e| {
            warn!("Ignoring invalid DIGITALIUM_SYNC_CONFIG: {e}");
            SyncConfig::default()
        }),
        Err(_) => SyncConfig::default(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let config = load_config();
    let cache_dir = tempfile::tempdir()?;
    let store = LocalStore::open(CacheConfig::for_testing(cache_dir.path()))?;
    let repo = Arc::new(MemoryRepository::new());

    let alice = UserIdentity::new(Uuid::new_v4(), "Alice");
    let bob = UserIdentity::new(Uuid::new_v4(), "Bob");

    let lifecycle = DocumentLifecycle::new(repo.clone()).with_timeout(config.request_timeout());
    let doc = lifecycle.create("Meeting notes", alice.user_id, "Agenda:").await?;
    lifecycle
        .add_collaborator(doc.id, bob.user_id, CollaboratorRole::Editor, alice.user_id)
        .await?;
    info!("Created '{}' ({})", doc.title, doc.id);

    let mut a =
        SyncSession::start(config.clone(), repo.clone(), Some(&store), doc.id, alice).await?;
    let b = SyncSession::start(config.clone(), repo.clone(), Some(&store), doc.id, bob).await?;

    let mut events = a.take_event_rx().ok_or("event receiver already taken")?;
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::RemoteMerged { version, .. } => {
                    println!("alice merged remote version {version}")
                }
                SessionEvent::Pushed { version } => println!("alice pushed version {version}"),
                SessionEvent::Unsynced { error } => println!("alice is unsynced: {error}"),
                other => log::debug!("alice event: {other:?}"),
            }
        }
    });

    let end = lock_replica(&a.replica()).len();
    a.apply_local(TextOp::insert(end, " budget"))?;
    b.apply_local(TextOp::insert(0, "[draft] "))?;
    b.presence().update_cursor(Some(CursorRange::caret(8))).await;

    tokio::time::sleep(config.debounce() * 3).await;
    println!("alice sees: {:?}", a.text());
    println!("bob sees:   {:?}", b.text());
    for peer in a.presence().active_peers().await? {
        println!(
            "alice sees peer {} ({}) at {:?}",
            peer.user_name, peer.user_color, peer.cursor_position
        );
    }

    let archived = a.archive().await?;
    println!("archived at version {}", archived.version);
    tokio::time::sleep(Duration::from_millis(100)).await;

    a.close().await;
    b.close().await;
    printer.abort();
    Ok(())
}
