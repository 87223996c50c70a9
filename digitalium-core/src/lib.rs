//! # digitalium-core: shared document model for DIGITALIUM collaboration
//!
//! Types shared by every collaborative session:
//!
//! - [`Document`]: the remote, durable row (content snapshot + metadata)
//! - [`DocumentStatus`]: the validated `draft → editing → review → archived` machine
//! - [`HistoryEntry`]: append-only audit trail records
//! - [`presence`]: ephemeral per-user presence rows and display identity
//! - [`content`]: base64 wire encoding of CRDT snapshots
//! - [`collab`]: the replicated document store (Yrs adapter)

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

pub mod collab;
pub mod content;
pub mod presence;

pub use collab::{
    lock_replica, ReplicaDoc, ReplicaError, ReplicaUpdate, SharedReplica, TextOp, UpdateOrigin,
};
pub use content::{decode_content, encode_content, ContentError};
pub use presence::{user_color, CursorRange, PresenceRecord, UserIdentity};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Workflow status of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Draft,
    Editing,
    Review,
    Archived,
}

/// Rejected status change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid status transition: {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: DocumentStatus,
    pub to: DocumentStatus,
}

impl DocumentStatus {
    /// Whether `self → next` is allowed. Staying in place is always allowed;
    /// `Archived` is terminal.
    pub fn can_transition_to(self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Draft, Editing)
                | (Draft, Review)
                | (Draft, Archived)
                | (Editing, Review)
                | (Editing, Archived)
                | (Review, Editing)
                | (Review, Archived)
        )
    }

    pub fn transition(self, next: DocumentStatus) -> Result<DocumentStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError { from: self, to: next })
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Draft => "draft",
            DocumentStatus::Editing => "editing",
            DocumentStatus::Review => "review",
            DocumentStatus::Archived => "archived",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollaboratorRole {
    Editor,
    Viewer,
    Commenter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaborator {
    pub user_id: Uuid,
    pub role: CollaboratorRole,
    pub added_at: u64,
}

impl Collaborator {
    pub fn new(user_id: Uuid, role: CollaboratorRole) -> Self {
        Self {
            user_id,
            role,
            added_at: now_millis(),
        }
    }
}

/// Remote document row.
///
/// `content` holds a base64-encoded full CRDT snapshot (see [`content`]).
/// `version` is informational and only ever incremented by the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub owner_id: Uuid,
    pub status: DocumentStatus,
    pub collaborators: Vec<Collaborator>,
    pub version: u64,
    pub last_edited_at: u64,
    pub last_edited_by: Uuid,
}

impl Document {
    /// A fresh draft with empty content, owned and last edited by `owner_id`.
    pub fn new(title: impl Into<String>, owner_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            content: String::new(),
            owner_id,
            status: DocumentStatus::Draft,
            collaborators: Vec::new(),
            version: 1,
            last_edited_at: now_millis(),
            last_edited_by: owner_id,
        }
    }

    /// Decoded content snapshot. Empty content yields an empty snapshot.
    pub fn content_bytes(&self) -> Result<Vec<u8>, ContentError> {
        decode_content(&self.content)
    }

    pub fn is_archived(&self) -> bool {
        self.status == DocumentStatus::Archived
    }

    pub fn collaborator(&self, user_id: &Uuid) -> Option<&Collaborator> {
        self.collaborators.iter().find(|c| &c.user_id == user_id)
    }

    /// Insert or replace the entry for `collaborator.user_id`.
    pub fn upsert_collaborator(&mut self, collaborator: Collaborator) {
        self.collaborators.retain(|c| c.user_id != collaborator.user_id);
        self.collaborators.push(collaborator);
    }

    /// Returns `true` if an entry was removed.
    pub fn remove_collaborator(&mut self, user_id: &Uuid) -> bool {
        let before = self.collaborators.len();
        self.collaborators.retain(|c| &c.user_id != user_id);
        self.collaborators.len() != before
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryAction {
    Created,
    Edited,
    Archived,
}

/// Audit trail record. Written by the sync path, never read back by it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub document_id: Uuid,
    pub user_id: Uuid,
    pub action: HistoryAction,
    pub snapshot: Option<String>,
    pub created_at: u64,
}

impl HistoryEntry {
    pub fn new(document_id: Uuid, user_id: Uuid, action: HistoryAction) -> Self {
        Self {
            document_id,
            user_id,
            action,
            snapshot: None,
            created_at: now_millis(),
        }
    }

    pub fn with_snapshot(mut self, snapshot: impl Into<String>) -> Self {
        self.snapshot = Some(snapshot.into());
        self
    }
}
