//! Replicated document store backed by a Yrs text CRDT.
//!
//! Every committed change is announced to subscribers as a
//! [`ReplicaUpdate`] carrying the incremental Yrs v1 update and its origin.
//! Local mutations and merges run to completion synchronously; nothing in
//! here awaits.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use yrs::updates::decoder::Decode;
use yrs::{
    Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Text, TextRef, Transact, Update,
};

/// Name of the shared text inside the Yrs doc.
pub const CONTENT_FIELD: &str = "content";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicaError {
    /// The bytes are not a valid Yrs update. State is untouched.
    #[error("malformed update: {0}")]
    Decode(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
    #[error("range {index}..{end} out of bounds (length {len})")]
    OutOfBounds { index: u32, end: u32, len: u32 },
}

/// Local text edit. Offsets are UTF-16 code units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextOp {
    Insert { index: u32, text: String },
    Delete { index: u32, len: u32 },
}

impl TextOp {
    pub fn insert(index: u32, text: impl Into<String>) -> Self {
        TextOp::Insert {
            index,
            text: text.into(),
        }
    }

    pub fn delete(index: u32, len: u32) -> Self {
        TextOp::Delete { index, len }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Produced by `apply_local`.
    Local,
    /// Merged from the remote repository.
    Remote,
    /// Replayed from the local durable cache.
    Restore,
}

#[derive(Debug, Clone)]
pub struct ReplicaUpdate {
    pub origin: UpdateOrigin,
    pub delta: Vec<u8>,
}

pub type SharedReplica = Arc<Mutex<ReplicaDoc>>;

/// Lock a shared replica. A poisoned lock is recovered: CRDT transactions
/// never leave partially applied state behind.
pub fn lock_replica(replica: &SharedReplica) -> MutexGuard<'_, ReplicaDoc> {
    replica
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One document's convergent content.
pub struct ReplicaDoc {
    doc: Doc,
    text: TextRef,
    subscribers: Vec<mpsc::UnboundedSender<ReplicaUpdate>>,
    local_mutations: u64,
    remote_merges: u64,
}

impl ReplicaDoc {
    pub fn new() -> Self {
        let doc = Doc::with_options(Options {
            offset_kind: OffsetKind::Utf16,
            ..Options::default()
        });
        let text = doc.get_or_insert_text(CONTENT_FIELD);
        Self {
            doc,
            text,
            subscribers: Vec::new(),
            local_mutations: 0,
            remote_merges: 0,
        }
    }

    /// A replica seeded with `initial` as one local insertion.
    pub fn with_text(initial: &str) -> Self {
        let replica = Self::new();
        if !initial.is_empty() {
            let mut txn = replica.doc.transact_mut();
            replica.text.insert(&mut txn, 0, initial);
        }
        replica
    }

    pub fn into_shared(self) -> SharedReplica {
        Arc::new(Mutex::new(self))
    }

    /// Register for update events. Events are delivered in commit order.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ReplicaUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Apply a local edit and return the incremental delta it produced.
    pub fn apply_local(&mut self, op: TextOp) -> Result<Vec<u8>, ReplicaError> {
        let delta = {
            let mut txn = self.doc.transact_mut();
            let len = self.text.len(&txn);
            match &op {
                TextOp::Insert { index, text } => {
                    if *index > len {
                        return Err(ReplicaError::OutOfBounds {
                            index: *index,
                            end: *index,
                            len,
                        });
                    }
                    self.text.insert(&mut txn, *index, text);
                }
                TextOp::Delete { index, len: count } => {
                    let end = index.saturating_add(*count);
                    if end > len {
                        return Err(ReplicaError::OutOfBounds {
                            index: *index,
                            end,
                            len,
                        });
                    }
                    self.text.remove_range(&mut txn, *index, *count);
                }
            }
            txn.encode_update_v1()
        };

        self.local_mutations += 1;
        self.emit(UpdateOrigin::Local, &delta);
        Ok(delta)
    }

    /// Merge a full or incremental update from another replica.
    ///
    /// Idempotent and commutative. On `Decode` errors nothing changes.
    pub fn merge_remote(&mut self, update: &[u8]) -> Result<(), ReplicaError> {
        self.integrate(update)?;
        self.remote_merges += 1;
        self.emit(UpdateOrigin::Remote, update);
        Ok(())
    }

    /// Merge state replayed from the local durable cache.
    pub fn restore(&mut self, update: &[u8]) -> Result<(), ReplicaError> {
        self.integrate(update)?;
        self.emit(UpdateOrigin::Restore, update);
        Ok(())
    }

    fn integrate(&self, update: &[u8]) -> Result<(), ReplicaError> {
        let decoded =
            Update::decode_v1(update).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| ReplicaError::Apply(e.to_string()))
    }

    /// Self-contained snapshot; a single `merge_remote` of it into a fresh
    /// replica reproduces this state.
    pub fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    /// Whether this replica holds state that `snapshot` lacks: insertions
    /// past its state vector or deletions missing from its delete set.
    ///
    /// Deletions never advance a client clock, so the check merges this
    /// replica into a scratch copy of the snapshot and looks for a change.
    pub fn is_ahead_of(&self, snapshot: &[u8]) -> Result<bool, ReplicaError> {
        let remote = snapshot_state_vector(snapshot)?;
        if self
            .state_vector()
            .iter()
            .any(|(client, clock)| *clock > remote.get(client))
        {
            return Ok(true);
        }

        let (scratch, text) = scratch_doc(snapshot)?;
        let before = text.get_string(&scratch.transact());
        let decoded = Update::decode_v1(&self.encode_full_state())
            .map_err(|e| ReplicaError::Decode(e.to_string()))?;
        {
            let mut txn = scratch.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| ReplicaError::Apply(e.to_string()))?;
        }
        let after = text.get_string(&scratch.transact());
        Ok(before != after)
    }

    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.text.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn local_mutations(&self) -> u64 {
        self.local_mutations
    }

    pub fn remote_merges(&self) -> u64 {
        self.remote_merges
    }

    fn emit(&mut self, origin: UpdateOrigin, delta: &[u8]) {
        let before = self.subscribers.len();
        self.subscribers.retain(|tx| {
            tx.send(ReplicaUpdate {
                origin,
                delta: delta.to_vec(),
            })
            .is_ok()
        });
        if self.subscribers.len() < before {
            log::debug!(
                "Dropped {} closed replica subscriber(s)",
                before - self.subscribers.len()
            );
        }
    }
}

impl Default for ReplicaDoc {
    fn default() -> Self {
        Self::new()
    }
}

/// State vector of a standalone snapshot. Empty input is the empty state.
pub fn snapshot_state_vector(snapshot: &[u8]) -> Result<StateVector, ReplicaError> {
    if snapshot.is_empty() {
        return Ok(StateVector::default());
    }
    let (scratch, _) = scratch_doc(snapshot)?;
    let sv = scratch.transact().state_vector();
    Ok(sv)
}

/// Throwaway doc holding `snapshot`, laid out like a replica.
fn scratch_doc(snapshot: &[u8]) -> Result<(Doc, TextRef), ReplicaError> {
    let scratch = Doc::with_options(Options {
        offset_kind: OffsetKind::Utf16,
        ..Options::default()
    });
    let text = scratch.get_or_insert_text(CONTENT_FIELD);
    if !snapshot.is_empty() {
        let decoded =
            Update::decode_v1(snapshot).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        let mut txn = scratch.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| ReplicaError::Apply(e.to_string()))?;
    }
    Ok((scratch, text))
}

/// Fold a sequence of updates into one full-state snapshot.
pub fn merge_updates<'a, I>(updates: I) -> Result<Vec<u8>, ReplicaError>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let scratch = Doc::new();
    for update in updates {
        let decoded =
            Update::decode_v1(update).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        let mut txn = scratch.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| ReplicaError::Apply(e.to_string()))?;
    }
    let snapshot = scratch
        .transact()
        .encode_state_as_update_v1(&StateVector::default());
    Ok(snapshot)
}
