//! In-process repository backed by tokio locks.
//!
//! Serves the same contract as a hosted backend: atomic version increments,
//! validated status changes, per-document change feeds. Test hooks allow
//! injecting write failures and latency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use digitalium_core::{
    now_millis, Collaborator, Document, DocumentStatus, HistoryEntry, PresenceRecord,
};
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use super::{
    ChangeFeed, DocumentRepository, DocumentWrite, PresenceChange, PresenceRepository,
    RepositoryError,
};

/// Default per-document feed capacity.
const FEED_CAPACITY: usize = 256;

pub struct MemoryRepository {
    documents: RwLock<HashMap<Uuid, Document>>,
    history: Mutex<Vec<HistoryEntry>>,
    presences: RwLock<HashMap<(Uuid, Uuid), PresenceRecord>>,
    document_feed: ChangeFeed<Document>,
    presence_feed: ChangeFeed<PresenceChange>,
    write_attempts: AtomicU64,
    presence_upserts: AtomicU64,
    failing_writes: AtomicU32,
    write_delay_ms: AtomicU64,
    in_flight_writes: AtomicU32,
    peak_in_flight_writes: AtomicU32,
}

/// Tracks concurrent `write` calls, including ones cancelled mid-flight.
struct InFlight<'a>(&'a AtomicU32);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicU32, peak: &AtomicU32) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::with_feed_capacity(FEED_CAPACITY)
    }

    pub fn with_feed_capacity(capacity: usize) -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            presences: RwLock::new(HashMap::new()),
            document_feed: ChangeFeed::new(capacity),
            presence_feed: ChangeFeed::new(capacity),
            write_attempts: AtomicU64::new(0),
            presence_upserts: AtomicU64::new(0),
            failing_writes: AtomicU32::new(0),
            write_delay_ms: AtomicU64::new(0),
            in_flight_writes: AtomicU32::new(0),
            peak_in_flight_writes: AtomicU32::new(0),
        }
    }

    // ─── Test hooks ───────────────────────────────────────────────────

    /// Fail the next `count` document writes with a network error.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Delay every document write by `delay` before it takes effect.
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Calls to `write`, successful or not.
    pub fn write_attempts(&self) -> u64 {
        self.write_attempts.load(Ordering::SeqCst)
    }

    /// Highest number of `write` calls ever running at once.
    pub fn peak_concurrent_writes(&self) -> u32 {
        self.peak_in_flight_writes.load(Ordering::SeqCst)
    }

    pub fn presence_upserts(&self) -> u64 {
        self.presence_upserts.load(Ordering::SeqCst)
    }

    pub async fn history(&self, document_id: Uuid) -> Vec<HistoryEntry> {
        self.history
            .lock()
            .await
            .iter()
            .filter(|e| e.document_id == document_id)
            .cloned()
            .collect()
    }

    pub fn change_subscribers(&self, document_id: Uuid) -> usize {
        self.document_feed.subscriber_count(document_id)
    }

    // ─── Internals ────────────────────────────────────────────────────

    fn take_injected_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Mutate a row under the write lock, bump its version and publish it.
    async fn update_row<F>(
        &self,
        document_id: Uuid,
        by: Uuid,
        mutate: F,
    ) -> Result<Document, RepositoryError>
    where
        F: FnOnce(&mut Document) -> Result<(), RepositoryError> + Send,
    {
        let row = {
            let mut documents = self.documents.write().await;
            let document = documents
                .get_mut(&document_id)
                .ok_or(RepositoryError::NotFound(document_id))?;
            // Validate on a copy so a rejected write leaves the row untouched
            let mut next = document.clone();
            mutate(&mut next)?;
            next.version = document.version + 1;
            next.last_edited_at = now_millis();
            next.last_edited_by = by;
            *document = next.clone();
            next
        };
        let reached = self.document_feed.publish(document_id, row.clone());
        log::trace!(
            "Document {document_id} now at version {} ({reached} subscribers notified)",
            row.version
        );
        Ok(row)
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentRepository for MemoryRepository {
    async fn create(&self, document: Document) -> Result<Document, RepositoryError> {
        let mut documents = self.documents.write().await;
        if documents.contains_key(&document.id) {
            return Err(RepositoryError::AlreadyExists(document.id));
        }
        documents.insert(document.id, document.clone());
        log::debug!("Created document {} '{}'", document.id, document.title);
        Ok(document)
    }

    async fn load(&self, document_id: Uuid) -> Result<Document, RepositoryError> {
        self.documents
            .read()
            .await
            .get(&document_id)
            .cloned()
            .ok_or(RepositoryError::NotFound(document_id))
    }

    async fn write(
        &self,
        document_id: Uuid,
        write: DocumentWrite,
    ) -> Result<Document, RepositoryError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.in_flight_writes, &self.peak_in_flight_writes);

        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.take_injected_failure() {
            return Err(RepositoryError::Network("injected write failure".to_string()));
        }

        let DocumentWrite {
            content,
            status,
            last_edited_by,
            expected_version,
        } = write;
        self.update_row(document_id, last_edited_by, move |row| {
            if let Some(expected) = expected_version {
                if row.version != expected {
                    return Err(RepositoryError::Conflict {
                        expected,
                        actual: row.version,
                    });
                }
            }
            let archives = status == Some(DocumentStatus::Archived);
            if row.is_archived() && (content.is_some() || archives) {
                return Err(RepositoryError::Archived(row.id));
            }
            if let Some(status) = status {
                row.status = row.status.transition(status)?;
            }
            if let Some(content) = content {
                row.content = content;
            }
            Ok(())
        })
        .await
    }

    async fn upsert_collaborator(
        &self,
        document_id: Uuid,
        collaborator: Collaborator,
        by: Uuid,
    ) -> Result<Document, RepositoryError> {
        self.update_row(document_id, by, move |row| {
            if row.is_archived() {
                return Err(RepositoryError::Archived(row.id));
            }
            row.upsert_collaborator(collaborator);
            Ok(())
        })
        .await
    }

    async fn remove_collaborator(
        &self,
        document_id: Uuid,
        user_id: Uuid,
        by: Uuid,
    ) -> Result<Document, RepositoryError> {
        self.update_row(document_id, by, move |row| {
            if row.is_archived() {
                return Err(RepositoryError::Archived(row.id));
            }
            row.remove_collaborator(&user_id);
            Ok(())
        })
        .await
    }

    fn subscribe_to_changes(&self, document_id: Uuid) -> broadcast::Receiver<Document> {
        self.document_feed.subscribe(document_id)
    }

    async fn append_history(&self, entry: HistoryEntry) -> Result<(), RepositoryError> {
        if !self.documents.read().await.contains_key(&entry.document_id) {
            return Err(RepositoryError::NotFound(entry.document_id));
        }
        self.history.lock().await.push(entry);
        Ok(())
    }
}

#[async_trait]
impl PresenceRepository for MemoryRepository {
    async fn upsert_presence(&self, record: PresenceRecord) -> Result<(), RepositoryError> {
        self.presence_upserts.fetch_add(1, Ordering::SeqCst);
        let document_id = record.document_id;
        self.presences
            .write()
            .await
            .insert((record.document_id, record.user_id), record.clone());
        self.presence_feed
            .publish(document_id, PresenceChange::Upserted(record));
        Ok(())
    }

    async fn list_presences(
        &self,
        document_id: Uuid,
    ) -> Result<Vec<PresenceRecord>, RepositoryError> {
        Ok(self
            .presences
            .read()
            .await
            .values()
            .filter(|r| r.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn remove_presence(
        &self,
        document_id: Uuid,
        user_id: Uuid,
    ) -> Result<(), RepositoryError> {
        let removed = self
            .presences
            .write()
            .await
            .remove(&(document_id, user_id))
            .is_some();
        if removed {
            self.presence_feed.publish(
                document_id,
                PresenceChange::Removed {
                    document_id,
                    user_id,
                },
            );
        }
        Ok(())
    }

    fn subscribe_presence(&self, document_id: Uuid) -> broadcast::Receiver<PresenceChange> {
        self.presence_feed.subscribe(document_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use digitalium_core::{CollaboratorRole, UserIdentity};

    async fn seeded() -> (MemoryRepository, Document) {
        let repo = MemoryRepository::new();
        let doc = repo
            .create(Document::new("Notes", Uuid::new_v4()))
            .await
            .unwrap();
        (repo, doc)
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_id() {
        let (repo, doc) = seeded().await;
        assert_eq!(
            repo.create(doc.clone()).await,
            Err(RepositoryError::AlreadyExists(doc.id))
        );
    }

    #[tokio::test]
    async fn test_load_missing_document() {
        let repo = MemoryRepository::new();
        let id = Uuid::new_v4();
        assert_eq!(repo.load(id).await, Err(RepositoryError::NotFound(id)));
    }

    #[tokio::test]
    async fn test_write_increments_version_and_stamps_editor() {
        let (repo, doc) = seeded().await;
        let editor = Uuid::new_v4();

        let row = repo
            .write(doc.id, DocumentWrite::content("AA==", editor))
            .await
            .unwrap();
        assert_eq!(row.version, doc.version + 1);
        assert_eq!(row.content, "AA==");
        assert_eq!(row.last_edited_by, editor);

        let row = repo
            .write(doc.id, DocumentWrite::content("AP8=", editor))
            .await
            .unwrap();
        assert_eq!(row.version, doc.version + 2);
        assert_eq!(repo.load(doc.id).await.unwrap(), row);
    }

    #[tokio::test]
    async fn test_concurrent_writes_never_share_a_version() {
        let (repo, doc) = seeded().await;
        let repo = std::sync::Arc::new(repo);
        let id = doc.id;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                repo.write(id, DocumentWrite::content("AA==", Uuid::new_v4()))
                    .await
                    .unwrap()
                    .version
            }));
        }
        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await.unwrap());
        }
        versions.sort_unstable();
        versions.dedup();
        assert_eq!(versions.len(), 10);
        assert_eq!(repo.load(id).await.unwrap().version, doc.version + 10);
    }

    #[tokio::test]
    async fn test_expected_version_conflict() {
        let (repo, doc) = seeded().await;
        let by = Uuid::new_v4();
        let err = repo
            .write(doc.id, DocumentWrite::content("AA==", by).expecting(doc.version + 5))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RepositoryError::Conflict {
                expected: doc.version + 5,
                actual: doc.version
            }
        );
        let ok = repo
            .write(doc.id, DocumentWrite::content("AA==", by).expecting(doc.version))
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn test_status_transitions_are_validated() {
        let (repo, doc) = seeded().await;
        let by = doc.owner_id;

        let row = repo
            .write(doc.id, DocumentWrite::status(DocumentStatus::Review, by))
            .await
            .unwrap();
        assert_eq!(row.status, DocumentStatus::Review);

        let row = repo
            .write(doc.id, DocumentWrite::status(DocumentStatus::Archived, by))
            .await
            .unwrap();
        assert!(row.is_archived());

        let err = repo
            .write(doc.id, DocumentWrite::status(DocumentStatus::Editing, by))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidTransition(_)));
        // Rejected writes leave the row untouched
        assert_eq!(repo.load(doc.id).await.unwrap().version, row.version);
    }

    #[tokio::test]
    async fn test_archived_rejects_content() {
        let (repo, doc) = seeded().await;
        repo.write(doc.id, DocumentWrite::status(DocumentStatus::Archived, doc.owner_id))
            .await
            .unwrap();
        let err = repo
            .write(doc.id, DocumentWrite::content("AA==", doc.owner_id))
            .await
            .unwrap_err();
        assert_eq!(err, RepositoryError::Archived(doc.id));

        // Archiving again is not a no-op self-transition
        let err = repo
            .write(doc.id, DocumentWrite::status(DocumentStatus::Archived, doc.owner_id))
            .await
            .unwrap_err();
        assert_eq!(err, RepositoryError::Archived(doc.id));
        assert_eq!(repo.load(doc.id).await.unwrap().version, doc.version + 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let (repo, doc) = seeded().await;
        repo.fail_next_writes(2);
        let by = Uuid::new_v4();
        for _ in 0..2 {
            let err = repo
                .write(doc.id, DocumentWrite::content("AA==", by))
                .await
                .unwrap_err();
            assert!(err.is_retryable());
        }
        assert!(repo.write(doc.id, DocumentWrite::content("AA==", by)).await.is_ok());
        assert_eq!(repo.write_attempts(), 3);
    }

    #[tokio::test]
    async fn test_change_feed_delivers_full_row() {
        let (repo, doc) = seeded().await;
        let mut changes = repo.subscribe_to_changes(doc.id);
        let by = Uuid::new_v4();
        repo.write(doc.id, DocumentWrite::content("AP8=", by))
            .await
            .unwrap();
        let row = changes.recv().await.unwrap();
        assert_eq!(row.content, "AP8=");
        assert_eq!(row.last_edited_by, by);
        assert_eq!(row.version, doc.version + 1);
    }

    #[tokio::test]
    async fn test_collaborator_upsert_replaces_entry() {
        let (repo, doc) = seeded().await;
        let user = Uuid::new_v4();
        let viewer = Collaborator::new(user, CollaboratorRole::Viewer);
        repo.upsert_collaborator(doc.id, viewer, doc.owner_id)
            .await
            .unwrap();
        let editor = Collaborator::new(user, CollaboratorRole::Editor);
        let row = repo
            .upsert_collaborator(doc.id, editor, doc.owner_id)
            .await
            .unwrap();
        assert_eq!(row.collaborators.len(), 1);
        assert_eq!(row.collaborator(&user).unwrap().role, CollaboratorRole::Editor);

        let row = repo
            .remove_collaborator(doc.id, user, doc.owner_id)
            .await
            .unwrap();
        assert!(row.collaborators.is_empty());
    }

    #[tokio::test]
    async fn test_presence_rows_keyed_by_document_and_user() {
        let (repo, doc) = seeded().await;
        let alice = UserIdentity::new(Uuid::new_v4(), "Alice");
        let mut feed = repo.subscribe_presence(doc.id);

        repo.upsert_presence(PresenceRecord::new(doc.id, &alice, None, 1))
            .await
            .unwrap();
        repo.upsert_presence(PresenceRecord::new(doc.id, &alice, None, 2))
            .await
            .unwrap();
        let rows = repo.list_presences(doc.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].last_seen, 2);
        assert!(matches!(feed.recv().await.unwrap(), PresenceChange::Upserted(_)));

        repo.remove_presence(doc.id, alice.user_id).await.unwrap();
        assert!(repo.list_presences(doc.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_requires_existing_document() {
        let (repo, doc) = seeded().await;
        let edited = digitalium_core::HistoryAction::Edited;
        let entry = HistoryEntry::new(Uuid::new_v4(), doc.owner_id, edited);
        assert!(repo.append_history(entry).await.is_err());
        repo.append_history(HistoryEntry::new(doc.id, doc.owner_id, edited))
            .await
            .unwrap();
        assert_eq!(repo.history(doc.id).await.len(), 1);
    }
}
