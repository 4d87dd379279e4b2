//! Warm-tier store backed by redb.
//!
//! The warm tier is the source of truth: every write path lands here first,
//! and the hot cache, vector indexes, and cold archive are all derived or
//! downstream. Built on [redb](https://docs.rs/redb), a pure Rust embedded
//! KV store with ACID transactions, MVCC reads, and single-writer locking.
//!
//! # File Layout
//!
//! Opening a store at `./membrane.db` creates:
//! - `./membrane.db` - Main database file
//! - `./membrane.db.lock` - Writer coordination (may not be visible)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ::redb::{Database, ReadableMultimapTable, ReadableTable};
use tracing::{debug, info, instrument, warn};

use super::schema::{
    decode_id_from_key, decode_timestamp_from_key, encode_time_id_key, time_range_end,
    time_range_start, StoreMetadata, APPLIED_ENVELOPES_TABLE, EVENTS_BY_DOMAIN_TABLE,
    EVENTS_BY_TIME_TABLE, INSIGHTS_BY_DOMAIN_TABLE, INSIGHTS_TABLE, LEARNING_EVENTS_TABLE,
    LEARNING_PATTERNS_TABLE, MEMORIES_BY_DOMAIN_TABLE, MEMORIES_BY_SERVICE_TABLE,
    MEMORIES_BY_TIME_TABLE, MEMORIES_TABLE, MEMORY_EMBEDDINGS_TABLE, MEMORY_EXPIRY_TABLE,
    MEMORY_RELATIONSHIPS_TABLE, METADATA_KEY, METADATA_TABLE, METRICS_TABLE, SCHEMA_VERSION,
    SYNC_QUEUE_TABLE,
};
use crate::config::Config;
use crate::error::{MembraneError, Result, StorageError, ValidationError};
use crate::insight::Insight;
use crate::learning::{LearningEvent, LearningPattern};
use crate::memory::{MemoryEntry, RelationshipEdge};
use crate::sync::SyncEnvelope;
use crate::types::{EnvelopeId, EventId, InsightId, MemoryId, PeerId, Timestamp};

/// Hard cap on index entries visited by a single scan.
///
/// Queries post-filter over newest-first index scans; this bounds the
/// worst case when a filter matches almost nothing.
const MAX_SCAN: usize = 10_000;

/// Per-peer queue bookkeeping kept in memory (rebuilt from the queue
/// table on open).
#[derive(Clone, Copy, Debug, Default)]
struct QueueState {
    /// Next sequence number to assign.
    next_seq: u64,
    /// Current number of queued envelopes.
    depth: u64,
}

/// redb-backed warm store.
///
/// # Thread Safety
///
/// `WarmStore` is `Send + Sync`. redb handles internal synchronization
/// using MVCC for readers and exclusive locking for writers; the queue
/// counter cache is guarded by its own mutex.
#[derive(Debug)]
pub struct WarmStore {
    /// The redb database handle.
    db: Database,

    /// Cached store metadata.
    metadata: StoreMetadata,

    /// Path to the database file.
    path: PathBuf,

    /// Per-peer queue counters, keyed by peer id string.
    queues: Mutex<HashMap<String, QueueState>>,
}

impl WarmStore {
    /// Opens or creates a store at the given path.
    ///
    /// If the store doesn't exist, it is created and initialized from the
    /// configuration. If it exists, the configuration is validated against
    /// the stored metadata (schema version, embedding dimension).
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The database file is corrupted
    /// - The database is locked by another process
    /// - Schema version doesn't match
    /// - Embedding dimension doesn't match (for existing stores)
    #[instrument(skip(config), fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>, config: &Config) -> Result<Self> {
        let path = path.as_ref();
        let db_exists = path.exists();

        debug!(db_exists = db_exists, "Opening warm store");

        let db = Database::builder().create(path).map_err(|e| {
            if e.to_string().contains("locked") {
                StorageError::DatabaseLocked
            } else {
                StorageError::Redb(e.to_string())
            }
        })?;

        let store = if db_exists {
            Self::open_existing(db, path.to_path_buf(), config)?
        } else {
            Self::initialize_new(db, path.to_path_buf(), config)?
        };

        store.rebuild_queue_counters()?;
        Ok(store)
    }

    /// Initializes a new store with tables and metadata.
    fn initialize_new(db: Database, path: PathBuf, config: &Config) -> Result<Self> {
        info!("Initializing new warm store");

        let metadata = StoreMetadata::new(config.embedding_dimension);

        // Create all tables and write metadata in a single transaction
        let write_txn = db.begin_write().map_err(StorageError::from)?;
        {
            let mut meta_table = write_txn.open_table(METADATA_TABLE)?;
            let metadata_bytes =
                bincode::serialize(&metadata).map_err(|e| StorageError::serialization(e.to_string()))?;
            meta_table.insert(METADATA_KEY, metadata_bytes.as_slice())?;

            let _ = write_txn.open_table(MEMORIES_TABLE)?;
            let _ = write_txn.open_table(MEMORY_EMBEDDINGS_TABLE)?;
            let _ = write_txn.open_multimap_table(MEMORIES_BY_DOMAIN_TABLE)?;
            let _ = write_txn.open_multimap_table(MEMORIES_BY_SERVICE_TABLE)?;
            let _ = write_txn.open_table(MEMORIES_BY_TIME_TABLE)?;
            let _ = write_txn.open_table(MEMORY_EXPIRY_TABLE)?;
            let _ = write_txn.open_multimap_table(MEMORY_RELATIONSHIPS_TABLE)?;
            let _ = write_txn.open_table(LEARNING_EVENTS_TABLE)?;
            let _ = write_txn.open_multimap_table(EVENTS_BY_DOMAIN_TABLE)?;
            let _ = write_txn.open_table(EVENTS_BY_TIME_TABLE)?;
            let _ = write_txn.open_table(LEARNING_PATTERNS_TABLE)?;
            let _ = write_txn.open_table(INSIGHTS_TABLE)?;
            let _ = write_txn.open_multimap_table(INSIGHTS_BY_DOMAIN_TABLE)?;
            let _ = write_txn.open_table(METRICS_TABLE)?;
            let _ = write_txn.open_table(APPLIED_ENVELOPES_TABLE)?;
            let _ = write_txn.open_table(SYNC_QUEUE_TABLE)?;
        }
        write_txn.commit().map_err(StorageError::from)?;

        info!(
            schema_version = SCHEMA_VERSION,
            dimension = config.embedding_dimension.size(),
            "Warm store initialized"
        );

        Ok(Self {
            db,
            metadata,
            path,
            queues: Mutex::new(HashMap::new()),
        })
    }

    /// Opens and validates an existing store.
    fn open_existing(db: Database, path: PathBuf, config: &Config) -> Result<Self> {
        info!("Opening existing warm store");

        let read_txn = db.begin_read().map_err(StorageError::from)?;
        let metadata = {
            let meta_table = read_txn
                .open_table(METADATA_TABLE)
                .map_err(|e| StorageError::corrupted(format!("Cannot open metadata table: {}", e)))?;

            let metadata_bytes = meta_table
                .get(METADATA_KEY)
                .map_err(StorageError::from)?
                .ok_or_else(|| StorageError::corrupted("Missing store metadata"))?;

            bincode::deserialize::<StoreMetadata>(metadata_bytes.value())
                .map_err(|e| StorageError::corrupted(format!("Invalid metadata format: {}", e)))?
        };
        drop(read_txn);

        if metadata.schema_version != SCHEMA_VERSION {
            warn!(
                expected = SCHEMA_VERSION,
                found = metadata.schema_version,
                "Schema version mismatch"
            );
            return Err(MembraneError::Storage(StorageError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION,
                found: metadata.schema_version,
            }));
        }

        if metadata.embedding_dimension != config.embedding_dimension {
            warn!(
                expected = config.embedding_dimension.size(),
                found = metadata.embedding_dimension.size(),
                "Embedding dimension mismatch"
            );
            return Err(MembraneError::Validation(ValidationError::DimensionMismatch {
                expected: config.embedding_dimension.size(),
                got: metadata.embedding_dimension.size(),
            }));
        }

        // Update last_opened_at timestamp
        let mut metadata = metadata;
        metadata.touch();

        let write_txn = db.begin_write().map_err(StorageError::from)?;
        {
            let mut meta_table = write_txn.open_table(METADATA_TABLE)?;
            let metadata_bytes =
                bincode::serialize(&metadata).map_err(|e| StorageError::serialization(e.to_string()))?;
            meta_table.insert(METADATA_KEY, metadata_bytes.as_slice())?;
        }
        write_txn.commit().map_err(StorageError::from)?;

        Ok(Self {
            db,
            metadata,
            path,
            queues: Mutex::new(HashMap::new()),
        })
    }

    /// Rebuilds per-peer queue counters from the durable queue table.
    fn rebuild_queue_counters(&self) -> Result<()> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let table = read_txn.open_table(SYNC_QUEUE_TABLE)?;

        let mut counters: HashMap<String, QueueState> = HashMap::new();
        for item in table.iter().map_err(StorageError::from)? {
            let (key, _) = item.map_err(StorageError::from)?;
            let (peer, seq) = key.value();
            let state = counters.entry(peer.to_string()).or_default();
            state.depth += 1;
            state.next_seq = state.next_seq.max(seq + 1);
        }

        if !counters.is_empty() {
            info!(peers = counters.len(), "Restored durable sync queues");
        }

        *self
            .queues
            .lock()
            .map_err(|_| MembraneError::internal("queue counter lock poisoned"))? = counters;
        Ok(())
    }

    /// Returns the store metadata.
    #[inline]
    pub fn metadata(&self) -> &StoreMetadata {
        &self.metadata
    }

    /// Returns the path to the database file.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Closes the store, flushing any pending writes.
    #[instrument(skip(self))]
    pub fn close(self) -> Result<()> {
        info!("Closing warm store");
        // redb flushes durably on drop
        drop(self.db);
        Ok(())
    }

    // =========================================================================
    // Memory entries
    // =========================================================================

    /// Saves a memory entry and all its index rows atomically.
    ///
    /// Used for both creation and accepted updates: the record row is
    /// overwritten, and index insertion is idempotent because index keys
    /// derive from the immutable `created_at`.
    pub fn save_entry(&self, entry: &MemoryEntry) -> Result<()> {
        let record = bincode::serialize(entry).map_err(StorageError::from)?;
        let time_key = encode_time_id_key(entry.created_at, entry.id.as_bytes());

        let write_txn = self.db.begin_write().map_err(StorageError::from)?;
        {
            let mut memories = write_txn.open_table(MEMORIES_TABLE)?;
            memories.insert(entry.id.as_bytes(), record.as_slice())?;

            if let Some(ref embedding) = entry.embedding {
                let mut embeddings = write_txn.open_table(MEMORY_EMBEDDINGS_TABLE)?;
                embeddings.insert(entry.id.as_bytes(), embedding_bytes(embedding).as_slice())?;
            }

            let mut by_domain = write_txn.open_multimap_table(MEMORIES_BY_DOMAIN_TABLE)?;
            by_domain.insert(entry.domain.as_str(), &time_key)?;

            let mut by_service = write_txn.open_multimap_table(MEMORIES_BY_SERVICE_TABLE)?;
            by_service.insert(entry.service_id.as_str(), &time_key)?;

            let mut by_time = write_txn.open_table(MEMORIES_BY_TIME_TABLE)?;
            by_time.insert(&time_key, entry.kind.as_u8())?;

            if let Some(expires_at) = entry.expires_at {
                let expiry_key = encode_time_id_key(expires_at, entry.id.as_bytes());
                let mut expiry = write_txn.open_table(MEMORY_EXPIRY_TABLE)?;
                expiry.insert(&expiry_key, ())?;
            }
        }
        write_txn.commit().map_err(StorageError::from)?;
        Ok(())
    }

    /// Retrieves a memory entry by id, with its embedding joined in.
    ///
    /// Returns `None` if the id is unknown. Archived stubs are returned
    /// as-is; the tier store inlines cold bodies above this layer.
    pub fn get_entry(&self, id: MemoryId) -> Result<Option<MemoryEntry>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let memories = read_txn.open_table(MEMORIES_TABLE)?;

        let Some(record) = memories.get(id.as_bytes()).map_err(StorageError::from)? else {
            return Ok(None);
        };
        let mut entry: MemoryEntry =
            bincode::deserialize(record.value()).map_err(StorageError::from)?;
        drop(record);

        let embeddings = read_txn.open_table(MEMORY_EMBEDDINGS_TABLE)?;
        if let Some(raw) = embeddings.get(id.as_bytes()).map_err(StorageError::from)? {
            entry.embedding = Some(embedding_from_bytes(raw.value()));
        }

        Ok(Some(entry))
    }

    /// Atomically bumps the access counter and last-accessed instant.
    ///
    /// Read-modify-write in a single write transaction to prevent lost
    /// updates under concurrent reads. Returns the new count, or `None`
    /// if the entry doesn't exist.
    pub fn bump_access(&self, id: MemoryId, now: Timestamp) -> Result<Option<u64>> {
        let write_txn = self.db.begin_write().map_err(StorageError::from)?;
        let new_count = {
            let mut memories = write_txn.open_table(MEMORIES_TABLE)?;
            let Some(record) = memories.get(id.as_bytes()).map_err(StorageError::from)? else {
                return Ok(None);
            };
            let mut entry: MemoryEntry =
                bincode::deserialize(record.value()).map_err(StorageError::from)?;
            drop(record);

            entry.access_count = entry.access_count.saturating_add(1);
            entry.last_accessed = now;

            let bytes = bincode::serialize(&entry).map_err(StorageError::from)?;
            memories.insert(id.as_bytes(), bytes.as_slice())?;
            entry.access_count
        };
        write_txn.commit().map_err(StorageError::from)?;
        Ok(Some(new_count))
    }

    /// Replaces an entry's record with its archived stub.
    ///
    /// The embedding row is retained so the similarity index keeps
    /// serving the entry. Returns the pre-archive entry, or `None` if
    /// the id is unknown or the entry is already archived.
    pub fn mark_archived(&self, id: MemoryId) -> Result<Option<MemoryEntry>> {
        let write_txn = self.db.begin_write().map_err(StorageError::from)?;
        let archived = {
            let mut memories = write_txn.open_table(MEMORIES_TABLE)?;
            let Some(record) = memories.get(id.as_bytes()).map_err(StorageError::from)? else {
                return Ok(None);
            };
            let entry: MemoryEntry =
                bincode::deserialize(record.value()).map_err(StorageError::from)?;
            drop(record);

            if entry.archived {
                None
            } else {
                let stub = entry.to_stub();
                let bytes = bincode::serialize(&stub).map_err(StorageError::from)?;
                memories.insert(id.as_bytes(), bytes.as_slice())?;
                Some(entry)
            }
        };
        write_txn.commit().map_err(StorageError::from)?;
        Ok(archived)
    }

    /// Hard-deletes an entry from every table it touches.
    ///
    /// Outgoing relationship edges are removed; incoming edges from other
    /// entries are left to dangle (traversal tolerates them). Returns
    /// `true` if the entry existed.
    pub fn delete_entry(&self, id: MemoryId) -> Result<bool> {
        let Some(entry) = self.get_entry(id)? else {
            return Ok(false);
        };

        let write_txn = self.db.begin_write().map_err(StorageError::from)?;
        {
            let mut memories = write_txn.open_table(MEMORIES_TABLE)?;
            memories.remove(id.as_bytes())?;

            let mut embeddings = write_txn.open_table(MEMORY_EMBEDDINGS_TABLE)?;
            embeddings.remove(id.as_bytes())?;

            let time_key = encode_time_id_key(entry.created_at, id.as_bytes());
            let mut by_domain = write_txn.open_multimap_table(MEMORIES_BY_DOMAIN_TABLE)?;
            by_domain.remove(entry.domain.as_str(), &time_key)?;

            let mut by_service = write_txn.open_multimap_table(MEMORIES_BY_SERVICE_TABLE)?;
            by_service.remove(entry.service_id.as_str(), &time_key)?;

            let mut by_time = write_txn.open_table(MEMORIES_BY_TIME_TABLE)?;
            by_time.remove(&time_key)?;

            if let Some(expires_at) = entry.expires_at {
                let expiry_key = encode_time_id_key(expires_at, id.as_bytes());
                let mut expiry = write_txn.open_table(MEMORY_EXPIRY_TABLE)?;
                expiry.remove(&expiry_key)?;
            }

            let mut relationships = write_txn.open_multimap_table(MEMORY_RELATIONSHIPS_TABLE)?;
            relationships.remove_all(id.as_bytes())?;
        }
        write_txn.commit().map_err(StorageError::from)?;
        Ok(true)
    }

    /// Lists entry ids newest-first, optionally scoped to one index.
    ///
    /// `domain` takes precedence over `service`; with neither set, the
    /// global creation-order index is scanned. Capped at [`MAX_SCAN`].
    pub fn recent_entry_ids(
        &self,
        domain: Option<&str>,
        service: Option<&str>,
    ) -> Result<Vec<MemoryId>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;

        if let Some(domain) = domain {
            let by_domain = read_txn.open_multimap_table(MEMORIES_BY_DOMAIN_TABLE)?;
            return collect_multimap_ids_desc(by_domain.get(domain).map_err(StorageError::from)?)
                .map(|ids| ids.into_iter().map(MemoryId::from_bytes).collect());
        }

        if let Some(service) = service {
            let by_service = read_txn.open_multimap_table(MEMORIES_BY_SERVICE_TABLE)?;
            return collect_multimap_ids_desc(by_service.get(service).map_err(StorageError::from)?)
                .map(|ids| ids.into_iter().map(MemoryId::from_bytes).collect());
        }

        let by_time = read_txn.open_table(MEMORIES_BY_TIME_TABLE)?;
        let mut ids = Vec::new();
        for item in by_time.iter().map_err(StorageError::from)?.rev() {
            let (key, _) = item.map_err(StorageError::from)?;
            ids.push(MemoryId::from_bytes(decode_id_from_key(key.value())));
            if ids.len() >= MAX_SCAN {
                break;
            }
        }
        Ok(ids)
    }

    /// Lists non-archived entry ids created strictly before `cutoff`,
    /// oldest first, capped at `batch`.
    ///
    /// Drives the archive sweep. Loading each record to check the
    /// archived flag keeps the index schema simple; sweep batches are
    /// small and off the critical path.
    pub fn archive_candidates(&self, cutoff: Timestamp, batch: usize) -> Result<Vec<MemoryId>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let by_time = read_txn.open_table(MEMORIES_BY_TIME_TABLE)?;
        let memories = read_txn.open_table(MEMORIES_TABLE)?;

        let mut candidates = Vec::new();
        for item in by_time.iter().map_err(StorageError::from)? {
            let (key, _) = item.map_err(StorageError::from)?;
            if decode_timestamp_from_key(key.value()) >= cutoff {
                break;
            }
            let id_bytes = decode_id_from_key(key.value());
            if let Some(record) = memories.get(&id_bytes).map_err(StorageError::from)? {
                let entry: MemoryEntry =
                    bincode::deserialize(record.value()).map_err(StorageError::from)?;
                if !entry.archived {
                    candidates.push(MemoryId::from_bytes(id_bytes));
                    if candidates.len() >= batch {
                        break;
                    }
                }
            }
        }
        Ok(candidates)
    }

    /// Lists entry ids whose expiry instant is at or before `now`,
    /// capped at `batch`. Drives the expiry sweep.
    pub fn expired_ids(&self, now: Timestamp, batch: usize) -> Result<Vec<MemoryId>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let expiry = read_txn.open_table(MEMORY_EXPIRY_TABLE)?;

        let mut expired = Vec::new();
        let end = time_range_end(now);
        for item in expiry.range::<&[u8; 24]>(..=&end).map_err(StorageError::from)? {
            let (key, _) = item.map_err(StorageError::from)?;
            expired.push(MemoryId::from_bytes(decode_id_from_key(key.value())));
            if expired.len() >= batch {
                break;
            }
        }
        Ok(expired)
    }

    /// Lists `(id, embedding)` pairs for every embedded entry in a domain.
    ///
    /// Used to rebuild the domain's vector index on open. Embeddings for
    /// archived stubs are included: archival retains the similarity row.
    pub fn embeddings_in_domain(&self, domain: &str) -> Result<Vec<(MemoryId, Vec<f32>)>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let by_domain = read_txn.open_multimap_table(MEMORIES_BY_DOMAIN_TABLE)?;
        let embeddings = read_txn.open_table(MEMORY_EMBEDDINGS_TABLE)?;

        let mut pairs = Vec::new();
        for value in by_domain.get(domain).map_err(StorageError::from)? {
            let key = value.map_err(StorageError::from)?;
            let id_bytes = decode_id_from_key(key.value());
            if let Some(raw) = embeddings.get(&id_bytes).map_err(StorageError::from)? {
                pairs.push((MemoryId::from_bytes(id_bytes), embedding_from_bytes(raw.value())));
            }
        }
        Ok(pairs)
    }

    /// Lists every domain that has at least one memory entry or event.
    pub fn known_domains(&self) -> Result<Vec<String>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let mut domains = Vec::new();

        let by_domain = read_txn.open_multimap_table(MEMORIES_BY_DOMAIN_TABLE)?;
        for item in by_domain.iter().map_err(StorageError::from)? {
            let (key, _) = item.map_err(StorageError::from)?;
            domains.push(key.value().to_string());
        }

        let events_by_domain = read_txn.open_multimap_table(EVENTS_BY_DOMAIN_TABLE)?;
        for item in events_by_domain.iter().map_err(StorageError::from)? {
            let (key, _) = item.map_err(StorageError::from)?;
            let domain = key.value().to_string();
            if !domains.contains(&domain) {
                domains.push(domain);
            }
        }

        domains.sort_unstable();
        domains.dedup();
        Ok(domains)
    }

    // =========================================================================
    // Relationships
    // =========================================================================

    /// Inserts a relationship edge. Idempotent over the
    /// (source, target, kind) triple. Returns `true` if the edge is new.
    pub fn add_edge(&self, source: MemoryId, edge: &RelationshipEdge) -> Result<bool> {
        let value = bincode::serialize(edge).map_err(StorageError::from)?;

        let write_txn = self.db.begin_write().map_err(StorageError::from)?;
        let already_present = {
            let mut relationships = write_txn.open_multimap_table(MEMORY_RELATIONSHIPS_TABLE)?;
            relationships.insert(source.as_bytes(), value.as_slice())?
        };
        write_txn.commit().map_err(StorageError::from)?;
        Ok(!already_present)
    }

    /// Lists all outgoing edges of an entry.
    pub fn edges_from(&self, source: MemoryId) -> Result<Vec<RelationshipEdge>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let relationships = read_txn.open_multimap_table(MEMORY_RELATIONSHIPS_TABLE)?;

        let mut edges = Vec::new();
        for value in relationships.get(source.as_bytes()).map_err(StorageError::from)? {
            let raw = value.map_err(StorageError::from)?;
            edges.push(bincode::deserialize(raw.value()).map_err(StorageError::from)?);
        }
        Ok(edges)
    }

    // =========================================================================
    // Learning events
    // =========================================================================

    /// Appends a learning event and its index rows atomically.
    ///
    /// Returns `false` without writing if the event id already exists -
    /// the ledger's idempotency guarantee for replicated events.
    pub fn append_event(&self, event: &LearningEvent) -> Result<bool> {
        let record = bincode::serialize(event).map_err(StorageError::from)?;
        let time_key = encode_time_id_key(event.timestamp, event.id.as_bytes());

        let write_txn = self.db.begin_write().map_err(StorageError::from)?;
        let inserted = {
            let mut events = write_txn.open_table(LEARNING_EVENTS_TABLE)?;
            if events.get(event.id.as_bytes()).map_err(StorageError::from)?.is_some() {
                false
            } else {
                events.insert(event.id.as_bytes(), record.as_slice())?;

                let mut by_domain = write_txn.open_multimap_table(EVENTS_BY_DOMAIN_TABLE)?;
                by_domain.insert(event.domain.as_str(), &time_key)?;

                let mut by_time = write_txn.open_table(EVENTS_BY_TIME_TABLE)?;
                by_time.insert(&time_key, event.kind.as_u8())?;

                true
            }
        };
        write_txn.commit().map_err(StorageError::from)?;
        Ok(inserted)
    }

    /// Retrieves a learning event by id.
    pub fn get_event(&self, id: EventId) -> Result<Option<LearningEvent>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let events = read_txn.open_table(LEARNING_EVENTS_TABLE)?;

        match events.get(id.as_bytes()).map_err(StorageError::from)? {
            Some(record) => Ok(Some(
                bincode::deserialize(record.value()).map_err(StorageError::from)?,
            )),
            None => Ok(None),
        }
    }

    /// Lists event ids newest-first, optionally scoped to a domain.
    /// Capped at [`MAX_SCAN`].
    pub fn recent_event_ids(&self, domain: Option<&str>) -> Result<Vec<EventId>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;

        if let Some(domain) = domain {
            let by_domain = read_txn.open_multimap_table(EVENTS_BY_DOMAIN_TABLE)?;
            return collect_multimap_ids_desc(by_domain.get(domain).map_err(StorageError::from)?)
                .map(|ids| ids.into_iter().map(EventId::from_bytes).collect());
        }

        let by_time = read_txn.open_table(EVENTS_BY_TIME_TABLE)?;
        let mut ids = Vec::new();
        for item in by_time.iter().map_err(StorageError::from)?.rev() {
            let (key, _) = item.map_err(StorageError::from)?;
            ids.push(EventId::from_bytes(decode_id_from_key(key.value())));
            if ids.len() >= MAX_SCAN {
                break;
            }
        }
        Ok(ids)
    }

    /// Lists event ids in a domain within `[start, end)`, oldest first.
    ///
    /// Drives backfills and windowed rollups. Capped at [`MAX_SCAN`].
    pub fn event_ids_in_window(
        &self,
        domain: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<EventId>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let by_domain = read_txn.open_multimap_table(EVENTS_BY_DOMAIN_TABLE)?;

        let start_key = time_range_start(start);
        let end_key = time_range_start(end);

        let mut ids = Vec::new();
        for value in by_domain.get(domain).map_err(StorageError::from)? {
            let key = value.map_err(StorageError::from)?;
            let composite = *key.value();
            if composite < start_key || composite >= end_key {
                continue;
            }
            ids.push(EventId::from_bytes(decode_id_from_key(&composite)));
            if ids.len() >= MAX_SCAN {
                break;
            }
        }
        Ok(ids)
    }

    // =========================================================================
    // Patterns
    // =========================================================================

    /// Inserts or replaces a pattern row, unique on (domain, signature).
    pub fn upsert_pattern(&self, pattern: &LearningPattern) -> Result<()> {
        let record = bincode::serialize(pattern).map_err(StorageError::from)?;

        let write_txn = self.db.begin_write().map_err(StorageError::from)?;
        {
            let mut patterns = write_txn.open_table(LEARNING_PATTERNS_TABLE)?;
            patterns.insert(
                (pattern.domain.as_str(), pattern.signature.as_str()),
                record.as_slice(),
            )?;
        }
        write_txn.commit().map_err(StorageError::from)?;
        Ok(())
    }

    /// Retrieves a pattern row by (domain, signature).
    pub fn get_pattern(&self, domain: &str, signature: &str) -> Result<Option<LearningPattern>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let patterns = read_txn.open_table(LEARNING_PATTERNS_TABLE)?;

        match patterns.get((domain, signature)).map_err(StorageError::from)? {
            Some(record) => Ok(Some(
                bincode::deserialize(record.value()).map_err(StorageError::from)?,
            )),
            None => Ok(None),
        }
    }

    /// Lists all pattern rows in a domain.
    pub fn patterns_in_domain(&self, domain: &str) -> Result<Vec<LearningPattern>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let patterns = read_txn.open_table(LEARNING_PATTERNS_TABLE)?;

        let mut rows = Vec::new();
        for item in patterns
            .range((domain, "")..=(domain, "\u{10FFFF}"))
            .map_err(StorageError::from)?
        {
            let (_, record) = item.map_err(StorageError::from)?;
            rows.push(bincode::deserialize(record.value()).map_err(StorageError::from)?);
        }
        Ok(rows)
    }

    // =========================================================================
    // Insights
    // =========================================================================

    /// Persists an insight and its domain index row.
    pub fn save_insight(&self, insight: &Insight) -> Result<()> {
        let record = bincode::serialize(insight).map_err(StorageError::from)?;
        let time_key = encode_time_id_key(insight.created_at, insight.id.as_bytes());

        let write_txn = self.db.begin_write().map_err(StorageError::from)?;
        {
            let mut insights = write_txn.open_table(INSIGHTS_TABLE)?;
            insights.insert(insight.id.as_bytes(), record.as_slice())?;

            let mut by_domain = write_txn.open_multimap_table(INSIGHTS_BY_DOMAIN_TABLE)?;
            by_domain.insert(insight.domain.as_str(), &time_key)?;
        }
        write_txn.commit().map_err(StorageError::from)?;
        Ok(())
    }

    /// Lists insights newest-first, optionally scoped to a domain,
    /// capped at `limit`.
    pub fn recent_insights(&self, domain: Option<&str>, limit: usize) -> Result<Vec<Insight>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let insights = read_txn.open_table(INSIGHTS_TABLE)?;

        let mut rows = Vec::new();
        if let Some(domain) = domain {
            let by_domain = read_txn.open_multimap_table(INSIGHTS_BY_DOMAIN_TABLE)?;
            let ids = collect_multimap_ids_desc(by_domain.get(domain).map_err(StorageError::from)?)?;
            for id_bytes in ids.into_iter().take(limit) {
                if let Some(record) = insights.get(&id_bytes).map_err(StorageError::from)? {
                    rows.push(bincode::deserialize(record.value()).map_err(StorageError::from)?);
                }
            }
        } else {
            for item in insights.iter().map_err(StorageError::from)?.rev() {
                let (_, record) = item.map_err(StorageError::from)?;
                rows.push(bincode::deserialize(record.value()).map_err(StorageError::from)?);
                if rows.len() >= limit {
                    break;
                }
            }
        }
        Ok(rows)
    }

    /// Retrieves an insight by id.
    pub fn get_insight(&self, id: InsightId) -> Result<Option<Insight>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let insights = read_txn.open_table(INSIGHTS_TABLE)?;

        match insights.get(id.as_bytes()).map_err(StorageError::from)? {
            Some(record) => Ok(Some(
                bincode::deserialize(record.value()).map_err(StorageError::from)?,
            )),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Metric time series
    // =========================================================================

    /// Records one point in the (domain, metric) time series.
    pub fn record_metric(&self, domain: &str, metric: &str, at: Timestamp, value: f64) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(StorageError::from)?;
        {
            let mut metrics = write_txn.open_table(METRICS_TABLE)?;
            metrics.insert((domain, metric, at.as_millis()), value)?;
        }
        write_txn.commit().map_err(StorageError::from)?;
        Ok(())
    }

    /// Reads the (domain, metric) series within `[start, end)`, oldest first.
    pub fn metric_series(
        &self,
        domain: &str,
        metric: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<(Timestamp, f64)>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let metrics = read_txn.open_table(METRICS_TABLE)?;

        let mut series = Vec::new();
        for item in metrics
            .range((domain, metric, start.as_millis())..(domain, metric, end.as_millis()))
            .map_err(StorageError::from)?
        {
            let (key, value) = item.map_err(StorageError::from)?;
            let (_, _, millis) = key.value();
            series.push((Timestamp::from_millis(millis), value.value()));
        }
        Ok(series)
    }

    // =========================================================================
    // Applied envelopes (inbound idempotency)
    // =========================================================================

    /// Returns true if an envelope id has already been applied.
    pub fn is_applied(&self, id: EnvelopeId) -> Result<bool> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let applied = read_txn.open_table(APPLIED_ENVELOPES_TABLE)?;
        Ok(applied.get(id.as_bytes()).map_err(StorageError::from)?.is_some())
    }

    /// Records an envelope id as applied. Returns `false` if the id was
    /// already recorded - the caller must then treat the delivery as a
    /// duplicate and skip application side effects.
    pub fn mark_applied(&self, id: EnvelopeId, now: Timestamp) -> Result<bool> {
        let write_txn = self.db.begin_write().map_err(StorageError::from)?;
        let fresh = {
            let mut applied = write_txn.open_table(APPLIED_ENVELOPES_TABLE)?;
            let previous = applied.insert(id.as_bytes(), now.as_millis())?;
            previous.is_none()
        };
        write_txn.commit().map_err(StorageError::from)?;
        Ok(fresh)
    }

    // =========================================================================
    // Durable sync queues
    // =========================================================================

    /// Appends an envelope to a peer's durable queue, returning the
    /// assigned sequence number and the resulting depth.
    ///
    /// The counter lock is released before the transaction: a failed
    /// write leaves a gap in the sequence space, which FIFO draining
    /// doesn't care about.
    pub fn enqueue_envelope(&self, peer: &PeerId, envelope: &SyncEnvelope) -> Result<(u64, u64)> {
        let record = bincode::serialize(envelope).map_err(StorageError::from)?;

        let seq = {
            let mut queues = self
                .queues
                .lock()
                .map_err(|_| MembraneError::internal("queue counter lock poisoned"))?;
            let state = queues.entry(peer.as_str().to_string()).or_default();
            let seq = state.next_seq;
            state.next_seq += 1;
            seq
        };

        let write_txn = self.db.begin_write().map_err(StorageError::from)?;
        {
            let mut queue = write_txn.open_table(SYNC_QUEUE_TABLE)?;
            queue.insert((peer.as_str(), seq), record.as_slice())?;
        }
        write_txn.commit().map_err(StorageError::from)?;

        let depth = {
            let mut queues = self
                .queues
                .lock()
                .map_err(|_| MembraneError::internal("queue counter lock poisoned"))?;
            let state = queues.entry(peer.as_str().to_string()).or_default();
            state.depth += 1;
            state.depth
        };
        Ok((seq, depth))
    }

    /// Reads up to `n` envelopes from the head of a peer's queue without
    /// removing them. FIFO order.
    pub fn peek_queue(&self, peer: &PeerId, n: usize) -> Result<Vec<(u64, SyncEnvelope)>> {
        let read_txn = self.db.begin_read().map_err(StorageError::from)?;
        let queue = read_txn.open_table(SYNC_QUEUE_TABLE)?;

        let mut batch = Vec::new();
        for item in queue
            .range((peer.as_str(), 0)..=(peer.as_str(), u64::MAX))
            .map_err(StorageError::from)?
        {
            let (key, record) = item.map_err(StorageError::from)?;
            let (_, seq) = key.value();
            batch.push((
                seq,
                bincode::deserialize(record.value()).map_err(StorageError::from)?,
            ));
            if batch.len() >= n {
                break;
            }
        }
        Ok(batch)
    }

    /// Removes acknowledged entries from a peer's queue after a confirmed
    /// send. A failed send simply skips this call, which re-prepends the
    /// batch by construction.
    pub fn ack_queue(&self, peer: &PeerId, seqs: &[u64]) -> Result<()> {
        if seqs.is_empty() {
            return Ok(());
        }

        let write_txn = self.db.begin_write().map_err(StorageError::from)?;
        {
            let mut queue = write_txn.open_table(SYNC_QUEUE_TABLE)?;
            for &seq in seqs {
                queue.remove((peer.as_str(), seq))?;
            }
        }
        write_txn.commit().map_err(StorageError::from)?;

        let mut queues = self
            .queues
            .lock()
            .map_err(|_| MembraneError::internal("queue counter lock poisoned"))?;
        if let Some(state) = queues.get_mut(peer.as_str()) {
            state.depth = state.depth.saturating_sub(seqs.len() as u64);
        }
        Ok(())
    }

    /// Returns the current depth of a peer's durable queue.
    pub fn queue_depth(&self, peer: &PeerId) -> u64 {
        self.queues
            .lock()
            .ok()
            .and_then(|queues| queues.get(peer.as_str()).map(|state| state.depth))
            .unwrap_or(0)
    }
}

/// Serializes an embedding as raw little-endian f32 bytes.
fn embedding_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Restores an embedding from raw little-endian f32 bytes.
fn embedding_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Drains a multimap value iterator of composite time/id keys into ids,
/// newest first, capped at [`MAX_SCAN`].
fn collect_multimap_ids_desc(
    values: redb::MultimapValue<&'static [u8; 24]>,
) -> Result<Vec<[u8; 16]>> {
    let mut ids = Vec::new();
    for value in values.rev() {
        let key = value.map_err(StorageError::from)?;
        ids.push(decode_id_from_key(key.value()));
        if ids.len() >= MAX_SCAN {
            break;
        }
    }
    Ok(ids)
}
