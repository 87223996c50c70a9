//! Presence tracking: who else has a document open, and where their cursor is.
//!
//! ```text
//! start()         ── upsert ──►┐
//! heartbeat (30s) ── upsert ──►├──► presence rows keyed (document, user)
//! update_cursor() ── upsert ──►┘            │
//! stop()          ── remove ──►             ▼
//!                              active_peers(): rows seen within the TTL,
//!                              excluding the local user
//! ```
//!
//! Presence is advisory. Every failure is logged and swallowed; a crashed
//! client simply ages out once its row passes the TTL.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use digitalium_core::{now_millis, CursorRange, PresenceRecord, UserIdentity};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::repository::{with_timeout, PresenceChange, PresenceRepository, RepositoryError};

pub struct PresenceTracker<R: PresenceRepository> {
    document_id: Uuid,
    identity: UserIdentity,
    repository: Arc<R>,
    cursor: Arc<Mutex<Option<CursorRange>>>,
    ttl: Duration,
    request_timeout: Duration,
    heartbeat: Option<JoinHandle<()>>,
}

impl<R: PresenceRepository> PresenceTracker<R> {
    /// Announce the local user immediately and start the heartbeat.
    pub async fn start(
        repository: Arc<R>,
        document_id: Uuid,
        identity: UserIdentity,
        config: &SyncConfig,
    ) -> Self {
        let cursor = Arc::new(Mutex::new(None));
        let request_timeout = config.request_timeout();
        announce(&*repository, document_id, &identity, None, request_timeout).await;

        let period = config.heartbeat_interval();
        let heartbeat = {
            let repository = Arc::clone(&repository);
            let identity = identity.clone();
            let cursor = Arc::clone(&cursor);
            tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let position = *lock_cursor(&cursor);
                    announce(&*repository, document_id, &identity, position, request_timeout).await;
                }
            })
        };

        log::debug!("Presence started for {} on {document_id}", identity.name);
        Self {
            document_id,
            identity,
            repository,
            cursor,
            ttl: config.presence_ttl(),
            request_timeout,
            heartbeat: Some(heartbeat),
        }
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    pub fn cursor(&self) -> Option<CursorRange> {
        *lock_cursor(&self.cursor)
    }

    /// Record a new cursor and publish it without waiting for the heartbeat.
    pub async fn update_cursor(&self, cursor: Option<CursorRange>) {
        *lock_cursor(&self.cursor) = cursor;
        announce(
            &*self.repository,
            self.document_id,
            &self.identity,
            cursor,
            self.request_timeout,
        )
        .await;
    }

    /// Other users whose rows were refreshed within the TTL, sorted by name.
    pub async fn active_peers(&self) -> Result<Vec<PresenceRecord>, RepositoryError> {
        let rows = with_timeout(
            self.request_timeout,
            self.repository.list_presences(self.document_id),
        )
        .await?;
        let now = now_millis();
        let ttl_ms = self.ttl.as_millis() as u64;
        let mut peers: Vec<PresenceRecord> = rows
            .into_iter()
            .filter(|r| r.user_id != self.identity.user_id && !r.is_stale(now, ttl_ms))
            .collect();
        peers.sort_by(|a, b| a.user_name.cmp(&b.user_name));
        Ok(peers)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceChange> {
        self.repository.subscribe_presence(self.document_id)
    }

    /// Stop the heartbeat and remove the local row (best effort).
    pub async fn stop(&mut self) {
        let Some(heartbeat) = self.heartbeat.take() else {
            return;
        };
        heartbeat.abort();
        let user_id = self.identity.user_id;
        if let Err(e) = with_timeout(
            self.request_timeout,
            self.repository.remove_presence(self.document_id, user_id),
        )
        .await
        {
            log::warn!("Failed to remove presence for {user_id} on {}: {e}", self.document_id);
        }
    }

    pub fn is_running(&self) -> bool {
        self.heartbeat.is_some()
    }
}

impl<R: PresenceRepository> Drop for PresenceTracker<R> {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

async fn announce<R: PresenceRepository + ?Sized>(
    repository: &R,
    document_id: Uuid,
    identity: &UserIdentity,
    cursor: Option<CursorRange>,
    request_timeout: Duration,
) {
    let record = PresenceRecord::new(document_id, identity, cursor, now_millis());
    if let Err(e) = with_timeout(request_timeout, repository.upsert_presence(record)).await {
        log::warn!("Presence upsert failed for {} on {document_id}: {e}", identity.user_id);
    }
}

fn lock_cursor(
    cursor: &Mutex<Option<CursorRange>>,
) -> std::sync::MutexGuard<'_, Option<CursorRange>> {
    cursor.lock().unwrap_or_else(|p| p.into_inner())
}
