//! Remote document repository.
//!
//! The repository is the durable, shared copy of every document: one row
//! per document (content snapshot plus metadata), an append-only history
//! log and a table of ephemeral presence rows. Each document also exposes a
//! change feed that pushes the full new row after every write.
//!
//! The traits are the seam between the sync engine and a concrete backend;
//! [`MemoryRepository`] is the in-process implementation.

use std::time::Duration;

use async_trait::async_trait;
use digitalium_core::{
    Collaborator, Document, DocumentStatus, HistoryEntry, PresenceRecord, TransitionError,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub mod feed;
pub mod memory;

pub use feed::ChangeFeed;
pub use memory::MemoryRepository;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("document not found: {0}")]
    NotFound(Uuid),
    #[error("document already exists: {0}")]
    AlreadyExists(Uuid),
    #[error("version conflict: expected {expected}, found {actual}")]
    Conflict { expected: u64, actual: u64 },
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("document {0} is archived")]
    Archived(Uuid),
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
    #[error("repository closed")]
    Closed,
}

impl RepositoryError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RepositoryError::Network(_) | RepositoryError::Timeout(_))
    }
}

/// Partial update of a document row.
///
/// The repository increments `version` and stamps `last_edited_at` itself;
/// callers never supply them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentWrite {
    pub content: Option<String>,
    pub status: Option<DocumentStatus>,
    pub last_edited_by: Uuid,
    /// Reject with `Conflict` unless the row is at this version.
    pub expected_version: Option<u64>,
}

impl DocumentWrite {
    pub fn content(content: impl Into<String>, by: Uuid) -> Self {
        Self {
            content: Some(content.into()),
            status: None,
            last_edited_by: by,
            expected_version: None,
        }
    }

    pub fn status(status: DocumentStatus, by: Uuid) -> Self {
        Self {
            content: None,
            status: Some(status),
            last_edited_by: by,
            expected_version: None,
        }
    }

    pub fn with_status(mut self, status: DocumentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn expecting(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    Upserted(PresenceRecord),
    Removed { document_id: Uuid, user_id: Uuid },
}

#[async_trait]
pub trait DocumentRepository: Send + Sync + 'static {
    /// Insert a new row. The row is stored as given.
    async fn create(&self, document: Document) -> Result<Document, RepositoryError>;

    async fn load(&self, document_id: Uuid) -> Result<Document, RepositoryError>;

    /// Apply a partial update and return the new row.
    ///
    /// Status changes are validated, content or archive writes to an
    /// archived row are rejected, and `version` is incremented atomically.
    async fn write(
        &self,
        document_id: Uuid,
        write: DocumentWrite,
    ) -> Result<Document, RepositoryError>;

    /// Add a collaborator, replacing any existing entry for the same user.
    async fn upsert_collaborator(
        &self,
        document_id: Uuid,
        collaborator: Collaborator,
        by: Uuid,
    ) -> Result<Document, RepositoryError>;

    async fn remove_collaborator(
        &self,
        document_id: Uuid,
        user_id: Uuid,
        by: Uuid,
    ) -> Result<Document, RepositoryError>;

    /// Receive the full row after every successful write to the document.
    fn subscribe_to_changes(&self, document_id: Uuid) -> broadcast::Receiver<Document>;

    async fn append_history(&self, entry: HistoryEntry) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait PresenceRepository: Send + Sync + 'static {
    /// Insert or replace the row keyed by `(document_id, user_id)`.
    async fn upsert_presence(&self, record: PresenceRecord) -> Result<(), RepositoryError>;

    async fn list_presences(
        &self,
        document_id: Uuid,
    ) -> Result<Vec<PresenceRecord>, RepositoryError>;

    async fn remove_presence(
        &self,
        document_id: Uuid,
        user_id: Uuid,
    ) -> Result<(), RepositoryError>;

    fn subscribe_presence(&self, document_id: Uuid) -> broadcast::Receiver<PresenceChange>;
}

/// A backend able to serve a full sync session.
pub trait SessionBackend: DocumentRepository + PresenceRepository {}

impl<T: DocumentRepository + PresenceRepository> SessionBackend for T {}

/// Bound a repository call by `limit`, mapping expiry to `Timeout`.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, RepositoryError>
where
    F: std::future::Future<Output = Result<T, RepositoryError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| RepositoryError::Timeout(limit))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(RepositoryError::Network("reset".into()).is_retryable());
        assert!(RepositoryError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!RepositoryError::NotFound(Uuid::nil()).is_retryable());
        assert!(!RepositoryError::Archived(Uuid::nil()).is_retryable());
        assert!(!RepositoryError::Conflict { expected: 1, actual: 2 }.is_retryable());
    }

    #[test]
    fn test_write_builders() {
        let by = Uuid::new_v4();
        let write = DocumentWrite::content("AA==", by)
            .with_status(DocumentStatus::Editing)
            .expecting(3);
        assert_eq!(write.content.as_deref(), Some("AA=="));
        assert_eq!(write.status, Some(DocumentStatus::Editing));
        assert_eq!(write.expected_version, Some(3));
        assert_eq!(write.last_edited_by, by);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_expires() {
        let result: Result<(), _> = with_timeout(Duration::from_millis(100), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(RepositoryError::Timeout(Duration::from_millis(100))));
    }
}
