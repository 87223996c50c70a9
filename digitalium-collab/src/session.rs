//! Sync coordinator: keeps one local replica and the remote row converging.
//!
//! ```text
//!               apply_local()                       change feed (full rows)
//!                    │                                       │
//!                    ▼                                       ▼
//!  ┌─────────────┐ Local  ┌──────────────────────────────────────────────┐
//!  │ ReplicaDoc  │──────► │ driver task                                  │
//!  │             │        │  • reset debounce deadline on local update   │
//!  │             │ ◄──────│  • merge foreign rows, drop own echoes       │
//!  └─────┬───────┘ merge  │  • one push task in flight at a time         │
//!        │                └───────────────┬──────────────────────────────┘
//!        ▼                                │ spawn
//!  LocalStore (cache)                     ▼
//!                              push task: full snapshot → write(),
//!                              retry with backoff, record history
//! ```
//!
//! Local editing never waits on the network. Pushes always carry the full
//! CRDT state, so a push that lands after a newer one can only add.

use std::sync::Arc;

use digitalium_core::{
    encode_content, lock_replica, Document, DocumentStatus, HistoryAction, HistoryEntry,
    ReplicaDoc, ReplicaError, ReplicaUpdate, SharedReplica, TextOp, UpdateOrigin, UserIdentity,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::lifecycle::DocumentLifecycle;
use crate::presence::PresenceTracker;
use crate::repository::{with_timeout, DocumentWrite, RepositoryError, SessionBackend};
use crate::storage::{CacheHandle, LocalStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Loading the cache and the remote row
    Initializing,
    /// Everything local has been pushed
    Idle,
    /// Local edits wait for the inactivity window to pass
    Debouncing,
    /// A push is in flight
    Syncing,
    /// Waiting to retry after a failed push attempt
    Retrying { attempt: u32 },
    /// The last push gave up; local edits are not on the server yet
    Unsynced,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Initial load finished.
    Synced {
        restored_entries: usize,
        remote_version: u64,
    },
    Pushed { version: u64 },
    PushFailed { attempt: u32, error: RepositoryError },
    Unsynced { error: RepositoryError },
    RemoteMerged { version: u64, by: Uuid },
    /// A change-feed row written by this user was discarded.
    EchoSuppressed { version: u64 },
    /// Remote content could not be decoded or merged; local state kept.
    RemoteDecodeFailed { version: u64, error: String },
    Archived { version: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("failed to load document: {0}")]
    RepositoryRead(RepositoryError),
    #[error("failed to write document: {0}")]
    RepositoryWrite(RepositoryError),
    #[error("invalid edit: {0}")]
    Edit(#[from] ReplicaError),
    #[error("session closed")]
    Closed,
}

type FlushReply = oneshot::Sender<Result<u64, SessionError>>;
type ArchiveReply = oneshot::Sender<Result<Document, SessionError>>;
type PushOutcome = Result<Document, RepositoryError>;

enum Command {
    Flush(FlushReply),
    Archive(ArchiveReply),
    Shutdown,
}

/// State shared by the session handle, the driver and push tasks.
struct Shared<R: SessionBackend> {
    document_id: Uuid,
    user_id: Uuid,
    repository: Arc<R>,
    replica: SharedReplica,
    config: SyncConfig,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: watch::Sender<SyncState>,
    /// Last known row metadata; `content` is informational only.
    metadata: watch::Sender<Document>,
}

impl<R: SessionBackend> Shared<R> {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: SyncState) {
        self.state.send_replace(state);
    }

    fn is_archived(&self) -> bool {
        self.metadata.borrow().is_archived()
    }

    /// Keep the newest row; rows can arrive out of order across tasks.
    fn update_metadata(&self, row: Document) {
        self.metadata.send_if_modified(|current| {
            if row.version >= current.version {
                *current = row;
                true
            } else {
                false
            }
        });
    }

    /// Merge a row's snapshot and report whether local state is still ahead.
    fn merge_row(&self, row: &Document) -> Result<bool, String> {
        let bytes = row.content_bytes().map_err(|e| e.to_string())?;
        let mut replica = lock_replica(&self.replica);
        if !bytes.is_empty() {
            replica.merge_remote(&bytes).map_err(|e| e.to_string())?;
        }
        replica.is_ahead_of(&bytes).map_err(|e| e.to_string())
    }

    fn snapshot(&self) -> String {
        let state = lock_replica(&self.replica).encode_full_state();
        encode_content(&state)
    }

    async fn push_with_retry(&self) -> PushOutcome {
        let policy = &self.config.retry;
        let mut attempt = 1;
        loop {
            match self.push_once().await {
                Ok(row) => {
                    log::debug!(
                        "Pushed {} at version {} (attempt {attempt})",
                        self.document_id,
                        row.version
                    );
                    return Ok(row);
                }
                Err(error) => {
                    self.emit(SessionEvent::PushFailed {
                        attempt,
                        error: error.clone(),
                    });
                    if !error.is_retryable() || !policy.allows_retry_after(attempt) {
                        return Err(error);
                    }
                    let delay = policy.delay_for(attempt);
                    log::warn!(
                        "Push of {} failed on attempt {attempt}: {error}; retrying in {delay:?}",
                        self.document_id
                    );
                    self.set_state(SyncState::Retrying { attempt });
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    self.set_state(SyncState::Syncing);
                }
            }
        }
    }

    async fn push_once(&self) -> PushOutcome {
        let snapshot = self.snapshot();
        // The first content push moves a draft into editing
        let promote = self.metadata.borrow().status == DocumentStatus::Draft;
        let mut write = DocumentWrite::content(snapshot.clone(), self.user_id);
        if promote {
            write = write.with_status(DocumentStatus::Editing);
        }
        let row = with_timeout(
            self.config.request_timeout(),
            self.repository.write(self.document_id, write),
        )
        .await?;
        self.record_edit(snapshot);
        Ok(row)
    }

    /// Fire-and-forget history append for a successful push.
    fn record_edit(&self, snapshot: String) {
        let repository = Arc::clone(&self.repository);
        let entry = HistoryEntry::new(self.document_id, self.user_id, HistoryAction::Edited)
            .with_snapshot(snapshot);
        let timeout = self.config.request_timeout();
        tokio::spawn(async move {
            let document_id = entry.document_id;
            if let Err(e) = with_timeout(timeout, repository.append_history(entry)).await {
                log::error!("Failed to record edit history for {document_id}: {e}");
            }
        });
    }

    async fn archive(&self) -> Result<Document, RepositoryError> {
        let snapshot = self.snapshot();
        let row = DocumentLifecycle::new(Arc::clone(&self.repository))
            .with_timeout(self.config.request_timeout())
            .archive(self.document_id, self.user_id, Some(snapshot))
            .await?;
        self.update_metadata(row.clone());
        self.emit(SessionEvent::Archived {
            version: row.version,
        });
        Ok(row)
    }
}

struct Driver<R: SessionBackend> {
    shared: Arc<Shared<R>>,
    local_updates: mpsc::UnboundedReceiver<ReplicaUpdate>,
    changes: broadcast::Receiver<Document>,
    changes_open: bool,
    commands: mpsc::UnboundedReceiver<Command>,
    outcomes_tx: mpsc::UnboundedSender<PushOutcome>,
    outcomes: mpsc::UnboundedReceiver<PushOutcome>,
    deadline: Option<Instant>,
    dirty: bool,
    syncing: bool,
    unsynced: bool,
    /// Flush callers waiting for a push that has not started yet
    pending_flush: Vec<FlushReply>,
    /// Flush callers waiting for the push in flight
    inflight_flush: Vec<FlushReply>,
}

impl<R: SessionBackend> Driver<R> {
    async fn run(mut self) {
        loop {
            let deadline = self.deadline;
            let push_due = deadline.is_some() && !self.syncing;
            let changes_open = self.changes_open;
            tokio::select! {
                // Local updates first: a command must see every edit made before it
                biased;
                Some(update) = self.local_updates.recv() => {
                    if update.origin == UpdateOrigin::Local {
                        self.schedule_push();
                    }
                }
                change = self.changes.recv(), if changes_open => self.on_change(change).await,
                Some(outcome) = self.outcomes.recv() => self.on_push_finished(outcome),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if push_due => {
                    self.start_push()
                }
                command = self.commands.recv() => match command {
                    Some(Command::Flush(reply)) => self.on_flush(reply),
                    Some(Command::Archive(reply)) => self.on_archive(reply),
                    Some(Command::Shutdown) | None => break,
                },
            }
        }
        if self.dirty {
            log::info!(
                "Session for {} stopped with unpushed local edits (kept in the local cache)",
                self.shared.document_id
            );
        }
        log::debug!("Sync driver for {} stopped", self.shared.document_id);
    }

    /// (Re)arm the debounce deadline.
    fn schedule_push(&mut self) {
        if self.shared.is_archived() {
            log::debug!(
                "Not scheduling a push for archived document {}",
                self.shared.document_id
            );
            return;
        }
        self.dirty = true;
        self.deadline = Some(Instant::now() + self.shared.config.debounce());
        if !self.syncing {
            self.shared.set_state(SyncState::Debouncing);
        }
    }

    fn start_push(&mut self) {
        self.deadline = None;
        self.dirty = false;
        self.syncing = true;
        self.inflight_flush.append(&mut self.pending_flush);
        self.shared.set_state(SyncState::Syncing);

        let shared = Arc::clone(&self.shared);
        let outcomes = self.outcomes_tx.clone();
        // Runs to completion even if the session is closed meanwhile
        tokio::spawn(async move {
            let outcome = shared.push_with_retry().await;
            let _ = outcomes.send(outcome);
        });
    }

    fn on_push_finished(&mut self, outcome: PushOutcome) {
        self.syncing = false;
        let reply = match outcome {
            Ok(row) => {
                self.unsynced = false;
                let version = row.version;
                self.shared.update_metadata(row);
                self.shared.emit(SessionEvent::Pushed { version });
                Ok(version)
            }
            Err(error) => {
                self.unsynced = true;
                log::error!(
                    "Giving up pushing {}: {error}; local edits are kept",
                    self.shared.document_id
                );
                self.shared.emit(SessionEvent::Unsynced {
                    error: error.clone(),
                });
                Err(SessionError::RepositoryWrite(error))
            }
        };
        for waiter in self.inflight_flush.drain(..) {
            let _ = waiter.send(reply.clone());
        }

        if !self.pending_flush.is_empty() {
            self.start_push();
        } else if self.dirty {
            if self.deadline.is_none() {
                self.deadline = Some(Instant::now() + self.shared.config.debounce());
            }
            self.shared.set_state(SyncState::Debouncing);
        } else if self.unsynced {
            self.shared.set_state(SyncState::Unsynced);
        } else {
            self.shared.set_state(SyncState::Idle);
        }
    }

    async fn on_change(&mut self, change: Result<Document, RecvError>) {
        match change {
            Ok(row) if row.last_edited_by == self.shared.user_id => {
                log::trace!(
                    "Dropping echo of own write to {} (version {})",
                    row.id,
                    row.version
                );
                self.shared
                    .emit(SessionEvent::EchoSuppressed { version: row.version });
            }
            Ok(row) => self.integrate_row(row),
            Err(RecvError::Lagged(missed)) => {
                let document_id = self.shared.document_id;
                log::warn!("Change feed for {document_id} skipped {missed} rows; reloading");
                match with_timeout(
                    self.shared.config.request_timeout(),
                    self.shared.repository.load(document_id),
                )
                .await
                {
                    Ok(row) => self.integrate_row(row),
                    Err(e) => log::error!("Reload of {document_id} after lag failed: {e}"),
                }
            }
            Err(RecvError::Closed) => {
                log::warn!("Change feed for {} closed", self.shared.document_id);
                self.changes_open = false;
            }
        }
    }

    fn integrate_row(&mut self, row: Document) {
        let version = row.version;
        let by = row.last_edited_by;
        let was_archived = self.shared.is_archived();
        let merged = self.shared.merge_row(&row);
        let archived_now = row.is_archived();
        self.shared.update_metadata(row);

        match merged {
            Ok(ahead) => {
                self.shared.emit(SessionEvent::RemoteMerged { version, by });
                if ahead {
                    log::debug!(
                        "Local replica of {} is ahead of version {version}; scheduling repair push",
                        self.shared.document_id
                    );
                    self.schedule_push();
                }
            }
            Err(error) => {
                log::warn!(
                    "Ignoring undecodable content of {} at version {version}: {error}",
                    self.shared.document_id
                );
                self.shared
                    .emit(SessionEvent::RemoteDecodeFailed { version, error });
            }
        }
        if archived_now && !was_archived {
            self.shared.emit(SessionEvent::Archived { version });
        }
    }

    fn on_flush(&mut self, reply: FlushReply) {
        if self.shared.is_archived() {
            let _ = reply.send(Err(SessionError::RepositoryWrite(RepositoryError::Archived(
                self.shared.document_id,
            ))));
            return;
        }
        match (self.syncing, self.dirty || self.unsynced) {
            (true, false) => self.inflight_flush.push(reply),
            (true, true) => self.pending_flush.push(reply),
            (false, true) => {
                self.pending_flush.push(reply);
                self.start_push();
            }
            (false, false) => {
                let version = self.shared.metadata.borrow().version;
                let _ = reply.send(Ok(version));
            }
        }
    }

    fn on_archive(&mut self, reply: ArchiveReply) {
        // The archive write carries the full snapshot itself
        self.deadline = None;
        self.dirty = false;
        if !self.syncing {
            self.shared.set_state(SyncState::Idle);
        }
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let result = shared.archive().await.map_err(SessionError::RepositoryWrite);
            let _ = reply.send(result);
        });
    }
}

/// One open document: replica, cache attachment, sync driver and presence.
pub struct SyncSession<R: SessionBackend> {
    shared: Arc<Shared<R>>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SyncState>,
    event_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    presence: PresenceTracker<R>,
    cache: Option<CacheHandle>,
    driver: Option<JoinHandle<()>>,
}

impl<R: SessionBackend> SyncSession<R> {
    /// Open a document: restore from the local cache, merge the remote row,
    /// then start syncing and announce presence.
    ///
    /// Only a failed remote load is fatal. Undecodable remote content is
    /// reported as [`SessionEvent::RemoteDecodeFailed`] and the session
    /// continues on local state.
    pub async fn start(
        config: SyncConfig,
        repository: Arc<R>,
        cache: Option<&LocalStore>,
        document_id: Uuid,
        identity: UserIdentity,
    ) -> Result<Self, SessionError> {
        let replica = ReplicaDoc::new().into_shared();
        let (state_tx, state_rx) = watch::channel(SyncState::Initializing);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let cache = cache.map(|store| store.open_document(document_id, &replica));
        let restored_entries = cache.as_ref().map_or(0, CacheHandle::restored_entries);
        let local_updates = lock_replica(&replica).subscribe();
        // Subscribe before loading so no row between load and subscribe is missed
        let changes = repository.subscribe_to_changes(document_id);

        let row = with_timeout(config.request_timeout(), repository.load(document_id))
            .await
            .map_err(SessionError::RepositoryRead)?;
        let remote_version = row.version;

        let shared = Arc::new(Shared {
            document_id,
            user_id: identity.user_id,
            repository: Arc::clone(&repository),
            replica,
            config: config.clone(),
            events: events_tx,
            state: state_tx,
            metadata: watch::channel(row.clone()).0,
        });

        let ahead = match shared.merge_row(&row) {
            Ok(ahead) => ahead,
            Err(error) => {
                log::warn!("Remote content of {document_id} is unreadable: {error}");
                shared.emit(SessionEvent::RemoteDecodeFailed {
                    version: remote_version,
                    error,
                });
                false
            }
        };
        shared.emit(SessionEvent::Synced {
            restored_entries,
            remote_version,
        });
        shared.set_state(SyncState::Idle);
        log::info!(
            "Opened {document_id} for {} at version {remote_version} \
             ({restored_entries} cached entries)",
            identity.name
        );

        let presence =
            PresenceTracker::start(Arc::clone(&repository), document_id, identity, &config).await;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let mut driver = Driver {
            shared: Arc::clone(&shared),
            local_updates,
            changes,
            changes_open: true,
            commands: commands_rx,
            outcomes_tx,
            outcomes: outcomes_rx,
            deadline: None,
            dirty: false,
            syncing: false,
            unsynced: false,
            pending_flush: Vec::new(),
            inflight_flush: Vec::new(),
        };
        if ahead {
            log::info!("Local cache of {document_id} holds unpushed edits; scheduling push");
            driver.schedule_push();
        }
        let driver = tokio::spawn(driver.run());

        Ok(Self {
            shared,
            commands: commands_tx,
            state: state_rx,
            event_rx: Some(events_rx),
            presence,
            cache,
            driver: Some(driver),
        })
    }

    pub fn document_id(&self) -> Uuid {
        self.shared.document_id
    }

    pub fn user_id(&self) -> Uuid {
        self.shared.user_id
    }

    /// Apply an edit to the local replica. Never waits on the network.
    pub fn apply_local(&self, op: TextOp) -> Result<(), SessionError> {
        lock_replica(&self.shared.replica).apply_local(op)?;
        Ok(())
    }

    pub fn text(&self) -> String {
        lock_replica(&self.shared.replica).text()
    }

    pub fn replica(&self) -> SharedReplica {
        Arc::clone(&self.shared.replica)
    }

    /// Last known row (metadata mirror).
    pub fn document(&self) -> Document {
        self.shared.metadata.borrow().clone()
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.state.clone()
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Push now instead of waiting for the debounce window.
    /// Resolves with the version of the push that carried every edit made
    /// before the call.
    pub async fn flush(&self) -> Result<u64, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Flush(tx))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Archive the document with the current full state as final snapshot.
    pub async fn archive(&self) -> Result<Document, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Archive(tx))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    pub fn presence(&self) -> &PresenceTracker<R> {
        &self.presence
    }

    /// Tear down: cancel any pending debounce, stop listening, drain the
    /// cache writer and remove presence. A push already in flight finishes
    /// on its own.
    pub async fn close(mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                log::error!("Sync driver for {} panicked: {e}", self.shared.document_id);
            }
        }
        if let Some(cache) = self.cache.take() {
            cache.close().await;
        }
        self.presence.stop().await;
        log::info!("Closed session for {}", self.shared.document_id);
    }
}
