//! On-disk envelope for cached CRDT updates.
//!
//! ```text
//! ┌──────────┬──────┬──────────┬──────────┐
//! │ sequence │ kind │ payload  │ checksum │   bincode, then LZ4 (size-prepended)
//! │ u64      │ u8   │ Yrs v1   │ u32      │
//! └──────────┴──────┴──────────┴──────────┘
//! ```

use serde::{Deserialize, Serialize};

use super::PersistenceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryKind {
    /// Incremental update emitted by the replica
    Delta = 1,
    /// Full state produced by compaction
    Snapshot = 2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub sequence: u64,
    pub kind: EntryKind,
    pub payload: Vec<u8>,
    pub checksum: u32,
}

impl CacheEntry {
    pub fn new(sequence: u64, kind: EntryKind, payload: Vec<u8>) -> Self {
        let checksum = Self::compute_checksum(sequence, kind, &payload);
        Self {
            sequence,
            kind,
            payload,
            checksum,
        }
    }

    pub fn verify(&self) -> bool {
        self.checksum == Self::compute_checksum(self.sequence, self.kind, &self.payload)
    }

    /// FNV-1a over the sequence, kind tag and payload words.
    fn compute_checksum(sequence: u64, kind: EntryKind, payload: &[u8]) -> u32 {
        let mut hash: u32 = 0x811c_9dc5;
        hash ^= sequence as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        hash ^= (sequence >> 32) as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        hash ^= kind as u32;
        hash = hash.wrapping_mul(0x0100_0193);
        for chunk in payload.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            hash ^= u32::from_le_bytes(word);
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash ^= payload.len() as u32;
        hash.wrapping_mul(0x0100_0193)
    }

    pub fn encode(&self) -> Result<Vec<u8>, PersistenceError> {
        let raw = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| PersistenceError::Codec(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    /// Decode and verify. A checksum mismatch is reported as `Corrupt`.
    pub fn decode(bytes: &[u8]) -> Result<Self, PersistenceError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| PersistenceError::Compression(e.to_string()))?;
        let (entry, _): (Self, _) =
            bincode::serde::decode_from_slice(&raw, bincode::config::standard())
                .map_err(|e| PersistenceError::Codec(e.to_string()))?;
        if !entry.verify() {
            return Err(PersistenceError::Corrupt {
                sequence: entry.sequence,
            });
        }
        Ok(entry)
    }
}
