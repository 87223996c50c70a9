//! RocksDB-backed update cache.
//!
//! Every document owns a key range in the `updates` column family:
//!
//! ```text
//! <namespace>-<document_id> / <sequence: u64 BE>  →  CacheEntry (LZ4 + bincode)
//! ```
//!
//! Sequences come from one store-wide counter, so several handles on the
//! same document (two sessions in one process) interleave without clobbering
//! each other. Entries replay in key order; order does not matter for
//! correctness because CRDT merges commute.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use digitalium_core::collab::{
    lock_replica, merge_updates, ReplicaUpdate, SharedReplica, UpdateOrigin,
};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::entry::{CacheEntry, EntryKind};
use super::PersistenceError;

const CF_UPDATES: &str = "updates";

/// Separates the document scope from the sequence suffix.
const KEY_SEPARATOR: u8 = b'/';

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Key namespace; entries live under `<namespace>-<document_id>`
    pub namespace: String,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Fold a document's entries into one snapshot after this many appends
    pub compaction_threshold: usize,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// Max open files for RocksDB
    pub max_open_files: i32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("digitalium_cache"),
            namespace: "digitalium-doc".to_string(),
            sync_writes: false,
            compaction_threshold: 500,
            block_cache_size: 32 * 1024 * 1024, // 32MB
            max_open_files: 256,
        }
    }
}

impl CacheConfig {
    /// Create config for testing (small caches, eager compaction).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            compaction_threshold: 16,
            block_cache_size: 4 * 1024 * 1024, // 4MB
            max_open_files: 64,
            ..Self::default()
        }
    }
}

struct CacheDb {
    db: DBWithThreadMode<SingleThreaded>,
    config: CacheConfig,
    sequence: AtomicU64,
}

impl CacheDb {
    fn scope(&self, document_id: Uuid) -> Vec<u8> {
        let mut scope = format!("{}-{}", self.config.namespace, document_id).into_bytes();
        scope.push(KEY_SEPARATOR);
        scope
    }

    fn key(&self, document_id: Uuid, sequence: u64) -> Vec<u8> {
        let mut key = self.scope(document_id);
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    fn append(
        &self,
        document_id: Uuid,
        kind: EntryKind,
        payload: Vec<u8>,
    ) -> Result<u64, PersistenceError> {
        let cf = self.cf()?;
        let sequence = self.next_sequence();
        let entry = CacheEntry::new(sequence, kind, payload);
        self.db.put_cf_opt(
            &cf,
            self.key(document_id, sequence),
            entry.encode()?,
            &self.write_options(),
        )?;
        Ok(sequence)
    }

    /// Raw key/value pairs in the document's scope, in key order.
    fn scan(&self, document_id: Uuid) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, PersistenceError> {
        let cf = self.cf()?;
        let scope = self.scope(document_id);
        let mut pairs = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(scope.as_slice(), Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&scope) {
                break;
            }
            pairs.push((key, value));
        }
        Ok(pairs)
    }

    fn load(&self, document_id: Uuid) -> Result<(Vec<CacheEntry>, usize), PersistenceError> {
        let mut entries = Vec::new();
        let mut corrupt = 0;
        for (key, value) in self.scan(document_id)? {
            match CacheEntry::decode(&value) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    corrupt += 1;
                    log::warn!(
                        "Skipping unreadable cache entry {} for {document_id}: {e}",
                        String::from_utf8_lossy(&key)
                    );
                }
            }
        }
        entries.sort_by_key(|e| e.sequence);
        Ok((entries, corrupt))
    }

    /// Replace every readable entry of the document with one merged snapshot.
    /// Unreadable entries are dropped in the same batch.
    fn compact(&self, document_id: Uuid) -> Result<usize, PersistenceError> {
        let cf = self.cf()?;
        let pairs = self.scan(document_id)?;
        if pairs.len() <= 1 {
            return Ok(pairs.len());
        }

        let entries: Vec<CacheEntry> = pairs
            .iter()
            .filter_map(|(_, value)| CacheEntry::decode(value).ok())
            .collect();
        let snapshot = merge_updates(entries.iter().map(|e| e.payload.as_slice()))
            .map_err(|e| PersistenceError::Codec(e.to_string()))?;

        let mut batch = WriteBatch::default();
        for (key, _) in &pairs {
            batch.delete_cf(&cf, key);
        }
        let sequence = self.next_sequence();
        let entry = CacheEntry::new(sequence, EntryKind::Snapshot, snapshot);
        batch.put_cf(&cf, self.key(document_id, sequence), entry.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        log::debug!(
            "Compacted {} cache entries for {document_id} into sequence {sequence}",
            pairs.len()
        );
        Ok(pairs.len())
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, PersistenceError> {
        self.db
            .cf_handle(CF_UPDATES)
            .ok_or_else(|| {
                PersistenceError::Database(format!("Column family '{CF_UPDATES}' not found"))
            })
    }
}

/// Durable local cache shared by every session of a process.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<CacheDb>,
}

impl LocalStore {
    /// Open the cache at the configured path, creating it if needed.
    pub fn open(config: CacheConfig) -> Result<Self, PersistenceError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let mut cf_opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        cf_opts.set_block_based_table_factory(&block_opts);
        // Values are already LZ4 framed
        cf_opts.set_compression_type(DBCompressionType::None);

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![ColumnFamilyDescriptor::new(CF_UPDATES, cf_opts)],
        )?;
        let sequence = Self::recover_sequence(&db);
        log::info!(
            "Opened local cache at {} (next sequence {sequence})",
            config.path.display()
        );

        Ok(Self {
            inner: Arc::new(CacheDb {
                db,
                config,
                sequence: AtomicU64::new(sequence),
            }),
        })
    }

    /// Highest sequence suffix across all scopes, plus one.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let Some(cf) = db.cf_handle(CF_UPDATES) else {
            return 0;
        };
        db.iterator_cf(&cf, IteratorMode::Start)
            .filter_map(Result::ok)
            .filter(|(key, _)| key.len() >= 8)
            .map(|(key, _)| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&key[key.len() - 8..]);
                u64::from_be_bytes(buf)
            })
            .max()
            .map_or(0, |max| max + 1)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// The key scope of a document, `<namespace>-<document_id>`.
    pub fn document_key(&self, document_id: Uuid) -> String {
        format!("{}-{}", self.inner.config.namespace, document_id)
    }

    /// Load all readable entries for a document plus the number skipped as corrupt.
    pub fn load_entries(
        &self,
        document_id: Uuid,
    ) -> Result<(Vec<CacheEntry>, usize), PersistenceError> {
        self.inner.load(document_id)
    }

    pub fn append(
        &self,
        document_id: Uuid,
        kind: EntryKind,
        payload: Vec<u8>,
    ) -> Result<u64, PersistenceError> {
        self.inner.append(document_id, kind, payload)
    }

    /// Fold all entries of a document into a single snapshot entry.
    /// Returns the number of entries replaced.
    pub fn compact(&self, document_id: Uuid) -> Result<usize, PersistenceError> {
        self.inner.compact(document_id)
    }

    /// Number of stored entries for a document, readable or not.
    pub fn entry_count(&self, document_id: Uuid) -> Result<usize, PersistenceError> {
        Ok(self.inner.scan(document_id)?.len())
    }

    /// Delete every entry for a document. Returns the number removed.
    pub fn clear_document(&self, document_id: Uuid) -> Result<usize, PersistenceError> {
        let cf = self.inner.cf()?;
        let pairs = self.inner.scan(document_id)?;
        let mut batch = WriteBatch::default();
        for (key, _) in &pairs {
            batch.delete_cf(&cf, key);
        }
        self.inner.db.write_opt(batch, &self.inner.write_options())?;
        Ok(pairs.len())
    }

    /// Write a raw value into a document's scope, bypassing the entry codec.
    #[doc(hidden)]
    pub fn put_raw(&self, document_id: Uuid, value: &[u8]) -> Result<(), PersistenceError> {
        let cf = self.inner.cf()?;
        let sequence = self.inner.next_sequence();
        self.inner.db.put_cf(&cf, self.inner.key(document_id, sequence), value)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), PersistenceError> {
        self.inner.db.flush()?;
        Ok(())
    }

    /// Restore a replica from its cached entries and keep it persisted.
    ///
    /// Readable entries are applied in order; unreadable ones are skipped
    /// with a warning. Afterwards every local or remote update emitted by
    /// the replica is appended by a background writer task, in emission
    /// order. Must be called inside a Tokio runtime.
    pub fn open_document(&self, document_id: Uuid, replica: &SharedReplica) -> CacheHandle {
        let (entries, corrupt) = match self.inner.load(document_id) {
            Ok(loaded) => loaded,
            Err(e) => {
                log::error!("Failed to read local cache for {document_id}: {e}");
                (Vec::new(), 0)
            }
        };

        let (restored, updates) = {
            let mut replica = lock_replica(replica);
            let mut restored = 0;
            for entry in &entries {
                match replica.restore(&entry.payload) {
                    Ok(()) => restored += 1,
                    Err(e) => log::warn!(
                        "Skipping cache entry {} for {document_id}: {e}",
                        entry.sequence
                    ),
                }
            }
            (restored, replica.subscribe())
        };
        log::info!(
            "Restored {restored} cached entries for {document_id} ({corrupt} unreadable skipped)"
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let writer = CacheWriter {
            db: Arc::clone(&self.inner),
            document_id,
            since_compaction: entries.len() + corrupt,
        };
        let task = tokio::spawn(writer.run(updates, shutdown_rx));

        CacheHandle {
            document_id,
            restored,
            skipped: corrupt,
            shutdown: Some(shutdown_tx),
            writer: Some(task),
            store: self.clone(),
        }
    }
}

struct CacheWriter {
    db: Arc<CacheDb>,
    document_id: Uuid,
    since_compaction: usize,
}

impl CacheWriter {
    async fn run(
        mut self,
        mut updates: mpsc::UnboundedReceiver<ReplicaUpdate>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;
                update = updates.recv() => match update {
                    Some(update) => self.persist(update),
                    None => break,
                },
                _ = &mut shutdown => {
                    while let Ok(update) = updates.try_recv() {
                        self.persist(update);
                    }
                    break;
                }
            }
        }
        log::debug!("Cache writer for {} stopped", self.document_id);
    }

    fn persist(&mut self, update: ReplicaUpdate) {
        // Restored entries are already on disk
        if update.origin == UpdateOrigin::Restore || update.delta.is_empty() {
            return;
        }
        if let Err(e) = self.db.append(self.document_id, EntryKind::Delta, update.delta) {
            log::error!("Failed to persist update for {}: {e}", self.document_id);
            return;
        }
        self.since_compaction += 1;
        if self.since_compaction >= self.db.config.compaction_threshold {
            match self.db.compact(self.document_id) {
                Ok(_) => self.since_compaction = 1,
                Err(e) => log::error!("Cache compaction failed for {}: {e}", self.document_id),
            }
        }
    }
}

/// Keeps a replica attached to the local cache.
///
/// `close` drains queued updates before returning. Dropping the handle
/// signals the writer to drain in the background.
pub struct CacheHandle {
    document_id: Uuid,
    restored: usize,
    skipped: usize,
    shutdown: Option<oneshot::Sender<()>>,
    writer: Option<JoinHandle<()>>,
    store: LocalStore,
}

impl CacheHandle {
    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    /// Entries successfully applied to the replica on open.
    pub fn restored_entries(&self) -> usize {
        self.restored
    }

    /// Entries skipped because they failed to decode or verify.
    pub fn skipped_entries(&self) -> usize {
        self.skipped
    }

    /// Stop the writer after persisting every queued update.
    pub async fn close(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.await {
                log::error!("Cache writer for {} panicked: {e}", self.document_id);
            }
        }
        if let Err(e) = self.store.flush() {
            log::warn!("Cache flush failed for {}: {e}", self.document_id);
        }
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
