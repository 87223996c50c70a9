//! Document creation, status workflow and collaborator management.
//!
//! Every operation is a single validated repository write; archival also
//! records exactly one `archived` history entry carrying the final snapshot.

use std::sync::Arc;
use std::time::Duration;

use digitalium_core::{
    encode_content, Collaborator, CollaboratorRole, Document, DocumentStatus, HistoryAction,
    HistoryEntry, ReplicaDoc,
};
use uuid::Uuid;

use crate::repository::{with_timeout, DocumentRepository, DocumentWrite, RepositoryError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct DocumentLifecycle<R: DocumentRepository> {
    repository: Arc<R>,
    timeout: Duration,
}

impl<R: DocumentRepository> Clone for DocumentLifecycle<R> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
            timeout: self.timeout,
        }
    }
}

impl<R: DocumentRepository> DocumentLifecycle<R> {
    pub fn new(repository: Arc<R>) -> Self {
        Self {
            repository,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Create a draft owned by `owner`, optionally seeded with text.
    pub async fn create(
        &self,
        title: impl Into<String>,
        owner: Uuid,
        initial_text: &str,
    ) -> Result<Document, RepositoryError> {
        let mut document = Document::new(title, owner);
        if !initial_text.is_empty() {
            let seeded = ReplicaDoc::with_text(initial_text);
            document.content = encode_content(&seeded.encode_full_state());
        }
        let created = with_timeout(self.timeout, self.repository.create(document)).await?;

        let mut entry = HistoryEntry::new(created.id, owner, HistoryAction::Created);
        if !created.content.is_empty() {
            entry = entry.with_snapshot(created.content.clone());
        }
        self.record(entry).await;
        log::info!("Created document {} '{}'", created.id, created.title);
        Ok(created)
    }

    /// Move a document to `status`. Archiving goes through [`Self::archive`].
    pub async fn transition(
        &self,
        document_id: Uuid,
        status: DocumentStatus,
        by: Uuid,
    ) -> Result<Document, RepositoryError> {
        if status == DocumentStatus::Archived {
            return self.archive(document_id, by, None).await;
        }
        let row = with_timeout(
            self.timeout,
            self.repository
                .write(document_id, DocumentWrite::status(status, by)),
        )
        .await?;
        log::info!("Document {document_id} is now {}", row.status.as_str());
        Ok(row)
    }

    /// Archive a document, storing `snapshot` as its final content when given.
    ///
    /// Archiving is terminal; the repository rejects a second archive write
    /// with `Archived`, so concurrent callers record one history entry.
    pub async fn archive(
        &self,
        document_id: Uuid,
        by: Uuid,
        snapshot: Option<String>,
    ) -> Result<Document, RepositoryError> {
        let mut write = DocumentWrite::status(DocumentStatus::Archived, by);
        write.content = snapshot;
        let row = with_timeout(self.timeout, self.repository.write(document_id, write)).await?;

        let entry = HistoryEntry::new(document_id, by, HistoryAction::Archived)
            .with_snapshot(row.content.clone());
        self.record(entry).await;
        log::info!("Archived document {document_id} at version {}", row.version);
        Ok(row)
    }

    pub async fn add_collaborator(
        &self,
        document_id: Uuid,
        user_id: Uuid,
        role: CollaboratorRole,
        by: Uuid,
    ) -> Result<Document, RepositoryError> {
        with_timeout(
            self.timeout,
            self.repository
                .upsert_collaborator(document_id, Collaborator::new(user_id, role), by),
        )
        .await
    }

    pub async fn remove_collaborator(
        &self,
        document_id: Uuid,
        user_id: Uuid,
        by: Uuid,
    ) -> Result<Document, RepositoryError> {
        with_timeout(
            self.timeout,
            self.repository.remove_collaborator(document_id, user_id, by),
        )
        .await
    }

    /// History is an audit trail; a failed append never fails the operation.
    async fn record(&self, entry: HistoryEntry) {
        let document_id = entry.document_id;
        let action = entry.action;
        if let Err(e) = with_timeout(self.timeout, self.repository.append_history(entry)).await {
            log::error!("Failed to record {action:?} history for {document_id}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;
    use digitalium_core::decode_content;

    fn lifecycle() -> (Arc<MemoryRepository>, DocumentLifecycle<MemoryRepository>) {
        let repo = Arc::new(MemoryRepository::new());
        (repo.clone(), DocumentLifecycle::new(repo))
    }

    #[tokio::test]
    async fn test_create_seeds_content_and_history() {
        let (repo, lifecycle) = lifecycle();
        let owner = Uuid::new_v4();
        let doc = lifecycle.create("Brief", owner, "Hello").await.unwrap();

        assert_eq!(doc.status, DocumentStatus::Draft);
        assert_eq!(doc.version, 1);
        let mut replica = ReplicaDoc::new();
        replica
            .merge_remote(&decode_content(&doc.content).unwrap())
            .unwrap();
        assert_eq!(replica.text(), "Hello");

        let history = repo.history(doc.id).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, HistoryAction::Created);
    }

    #[tokio::test]
    async fn test_create_empty_document() {
        let (_, lifecycle) = lifecycle();
        let doc = lifecycle.create("Empty", Uuid::new_v4(), "").await.unwrap();
        assert!(doc.content.is_empty());
    }

    #[tokio::test]
    async fn test_workflow_transitions() {
        let (_, lifecycle) = lifecycle();
        let owner = Uuid::new_v4();
        let doc = lifecycle.create("Flow", owner, "").await.unwrap();

        let row = lifecycle
            .transition(doc.id, DocumentStatus::Editing, owner)
            .await
            .unwrap();
        assert_eq!(row.status, DocumentStatus::Editing);
        let row = lifecycle
            .transition(doc.id, DocumentStatus::Review, owner)
            .await
            .unwrap();
        assert_eq!(row.status, DocumentStatus::Review);
        let row = lifecycle
            .transition(doc.id, DocumentStatus::Editing, owner)
            .await
            .unwrap();
        assert_eq!(row.status, DocumentStatus::Editing);
        assert_eq!(row.version, doc.version + 3);
    }

    #[tokio::test]
    async fn test_archive_is_terminal_and_recorded_once() {
        let (repo, lifecycle) = lifecycle();
        let owner = Uuid::new_v4();
        let doc = lifecycle.create("Done", owner, "final").await.unwrap();

        let row = lifecycle.archive(doc.id, owner, None).await.unwrap();
        assert!(row.is_archived());
        assert_eq!(row.content, doc.content);

        assert_eq!(
            lifecycle.archive(doc.id, owner, None).await,
            Err(RepositoryError::Archived(doc.id))
        );
        let err = lifecycle
            .transition(doc.id, DocumentStatus::Editing, owner)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidTransition(_)));

        let archived: Vec<_> = repo
            .history(doc.id)
            .await
            .into_iter()
            .filter(|e| e.action == HistoryAction::Archived)
            .collect();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].snapshot.as_deref(), Some(doc.content.as_str()));
    }

    #[tokio::test]
    async fn test_concurrent_archives_record_once() {
        let (repo, lifecycle) = lifecycle();
        let owner = Uuid::new_v4();
        let doc = lifecycle.create("Race", owner, "text").await.unwrap();
        repo.set_write_delay(Duration::from_millis(10));

        let (first, second) = tokio::join!(
            lifecycle.archive(doc.id, owner, None),
            lifecycle.transition(doc.id, DocumentStatus::Archived, owner),
        );
        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| r == &Err(RepositoryError::Archived(doc.id))));

        let archived = repo
            .history(doc.id)
            .await
            .into_iter()
            .filter(|e| e.action == HistoryAction::Archived)
            .count();
        assert_eq!(archived, 1);
        assert_eq!(repo.load(doc.id).await.unwrap().version, doc.version + 1);
    }

    #[tokio::test]
    async fn test_archive_stores_given_snapshot() {
        let (repo, lifecycle) = lifecycle();
        let owner = Uuid::new_v4();
        let doc = lifecycle.create("Snap", owner, "").await.unwrap();
        let snapshot = encode_content(&ReplicaDoc::with_text("last words").encode_full_state());

        let row = lifecycle
            .archive(doc.id, owner, Some(snapshot.clone()))
            .await
            .unwrap();
        assert_eq!(row.content, snapshot);
        assert_eq!(repo.load(doc.id).await.unwrap().content, snapshot);
    }

    #[tokio::test]
    async fn test_collaborators() {
        let (_, lifecycle) = lifecycle();
        let owner = Uuid::new_v4();
        let guest = Uuid::new_v4();
        let doc = lifecycle.create("Shared", owner, "").await.unwrap();

        let row = lifecycle
            .add_collaborator(doc.id, guest, CollaboratorRole::Commenter, owner)
            .await
            .unwrap();
        assert_eq!(row.collaborator(&guest).unwrap().role, CollaboratorRole::Commenter);

        let row = lifecycle
            .remove_collaborator(doc.id, guest, owner)
            .await
            .unwrap();
        assert!(row.collaborator(&guest).is_none());
    }
}
