//! Warm-tier schema definitions and versioning.
//!
//! This module defines the table structure for the redb storage engine.
//! All table definitions are compile-time constants to ensure consistency.
//!
//! # Schema Versioning
//!
//! The schema version is stored in the metadata table. When opening an
//! existing store, we check the version and fail if it doesn't match.
//!
//! # Table Layout
//!
//! ```text
//! MEMORIES_TABLE            id (16B uuid)              -> bincode MemoryEntry (no embedding)
//! MEMORY_EMBEDDINGS_TABLE   id (16B uuid)              -> raw f32 LE bytes
//! MEMORIES_BY_DOMAIN_TABLE  domain (&str)              ->> [ts_be 8B][id 16B]
//! MEMORIES_BY_SERVICE_TABLE service_id (&str)          ->> [ts_be 8B][id 16B]
//! MEMORIES_BY_TIME_TABLE    [ts_be 8B][id 16B]         -> kind tag (1B)
//! MEMORY_EXPIRY_TABLE       [expires_be 8B][id 16B]    -> ()
//! MEMORY_RELATIONSHIPS      source id (16B)            ->> bincode RelationshipEdge
//! LEARNING_EVENTS_TABLE     id (16B uuid)              -> bincode LearningEvent
//! EVENTS_BY_DOMAIN_TABLE    domain (&str)              ->> [ts_be 8B][id 16B]
//! EVENTS_BY_TIME_TABLE      [ts_be 8B][id 16B]         -> kind tag (1B)
//! LEARNING_PATTERNS_TABLE   (domain, signature)        -> bincode LearningPattern
//! INSIGHTS_TABLE            id (16B uuid)              -> bincode Insight
//! INSIGHTS_BY_DOMAIN_TABLE  domain (&str)              ->> [ts_be 8B][id 16B]
//! METRICS_TABLE             (domain, metric, ts)       -> f64
//! APPLIED_ENVELOPES_TABLE   envelope id (16B uuid)     -> applied-at millis (i64)
//! SYNC_QUEUE_TABLE          (peer id, seq)             -> bincode SyncEnvelope
//! ```
//!
//! Multimap (`->>`) values embed a big-endian timestamp prefix so that
//! redb's lexicographic value ordering doubles as time ordering.

use redb::{MultimapTableDefinition, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::config::EmbeddingDimension;
use crate::types::Timestamp;

/// Current schema version.
///
/// Increment this when making breaking changes to the schema.
/// The store will refuse to open if versions don't match.
pub const SCHEMA_VERSION: u32 = 1;

/// Maximum serialized payload size in bytes (256 KB).
pub const MAX_PAYLOAD_SIZE: usize = 256 * 1024;

/// Maximum number of tags per memory entry.
pub const MAX_TAGS: usize = 32;

/// Maximum length of a single tag.
pub const MAX_TAG_LENGTH: usize = 100;

/// Maximum length of a domain name.
pub const MAX_DOMAIN_LENGTH: usize = 100;

/// Upper bound of the importance scale.
pub const MAX_IMPORTANCE: f32 = 10.0;

/// Default result cap for queries that don't set a limit.
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Hard result cap for any single query.
pub const MAX_QUERY_LIMIT: usize = 1000;

// ============================================================================
// Table Definitions
// ============================================================================

/// Metadata table for store-level information.
pub const METADATA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("metadata");

/// Memory entries (record without embedding).
pub const MEMORIES_TABLE: TableDefinition<&[u8; 16], &[u8]> = TableDefinition::new("memories");

/// Embedding vectors, stored separately to keep the main table compact.
pub const MEMORY_EMBEDDINGS_TABLE: TableDefinition<&[u8; 16], &[u8]> =
    TableDefinition::new("memory_embeddings");

/// Index: memory entries by domain and timestamp.
pub const MEMORIES_BY_DOMAIN_TABLE: MultimapTableDefinition<&str, &[u8; 24]> =
    MultimapTableDefinition::new("memories_by_domain");

/// Index: memory entries by owning service and timestamp.
pub const MEMORIES_BY_SERVICE_TABLE: MultimapTableDefinition<&str, &[u8; 24]> =
    MultimapTableDefinition::new("memories_by_service");

/// Index: all memory entries in creation order. Value is the kind tag.
pub const MEMORIES_BY_TIME_TABLE: TableDefinition<&[u8; 24], u8> =
    TableDefinition::new("memories_by_time");

/// Index: entries carrying an expiry, ordered by expiry instant.
///
/// The expiry sweep range-scans `[0, now]` and hard-deletes the hits.
pub const MEMORY_EXPIRY_TABLE: TableDefinition<&[u8; 24], ()> =
    TableDefinition::new("memory_expiry");

/// Relationship edges by source entry.
///
/// Values are bincode-serialized [`RelationshipEdge`](crate::memory::RelationshipEdge)
/// records; the multimap's set semantics make edge insertion idempotent
/// over the (source, target, kind) triple.
pub const MEMORY_RELATIONSHIPS_TABLE: MultimapTableDefinition<&[u8; 16], &[u8]> =
    MultimapTableDefinition::new("memory_relationships");

/// Learning events (append-only).
pub const LEARNING_EVENTS_TABLE: TableDefinition<&[u8; 16], &[u8]> =
    TableDefinition::new("learning_events");

/// Index: learning events by domain and timestamp.
pub const EVENTS_BY_DOMAIN_TABLE: MultimapTableDefinition<&str, &[u8; 24]> =
    MultimapTableDefinition::new("events_by_domain");

/// Index: all learning events in record order. Value is the kind tag.
pub const EVENTS_BY_TIME_TABLE: TableDefinition<&[u8; 24], u8> =
    TableDefinition::new("events_by_time");

/// Derived pattern rows, unique on (domain, signature).
pub const LEARNING_PATTERNS_TABLE: TableDefinition<(&str, &str), &[u8]> =
    TableDefinition::new("learning_patterns");

/// Persisted insights.
pub const INSIGHTS_TABLE: TableDefinition<&[u8; 16], &[u8]> = TableDefinition::new("insights");

/// Index: insights by domain and timestamp.
pub const INSIGHTS_BY_DOMAIN_TABLE: MultimapTableDefinition<&str, &[u8; 24]> =
    MultimapTableDefinition::new("insights_by_domain");

/// Metric time series: (domain, metric, unix millis) -> value.
pub const METRICS_TABLE: TableDefinition<(&str, &str, i64), f64> = TableDefinition::new("metrics");

/// Envelope ids already applied by the inbound sync path.
///
/// Value is the applied-at instant in unix millis.
pub const APPLIED_ENVELOPES_TABLE: TableDefinition<&[u8; 16], i64> =
    TableDefinition::new("applied_envelopes");

/// Durable per-peer outbound queues: (peer id, sequence) -> envelope.
///
/// Sequences are assigned monotonically per peer; FIFO order is the key
/// order. Entries are removed only after a confirmed send.
pub const SYNC_QUEUE_TABLE: TableDefinition<(&str, u64), &[u8]> =
    TableDefinition::new("sync_queue");

// ============================================================================
// Store Metadata
// ============================================================================

/// Metadata key in the metadata table.
pub const METADATA_KEY: &str = "store_metadata";

/// Store metadata persisted under [`METADATA_KEY`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreMetadata {
    /// Schema version for compatibility checking.
    pub schema_version: u32,

    /// Embedding dimension configured for this store.
    ///
    /// Once set, this cannot be changed without recreating the store.
    pub embedding_dimension: EmbeddingDimension,

    /// Timestamp when the store was created.
    pub created_at: Timestamp,

    /// Last time the store was opened (updated on each open).
    pub last_opened_at: Timestamp,
}

impl StoreMetadata {
    /// Creates new metadata for a fresh store.
    pub fn new(embedding_dimension: EmbeddingDimension) -> Self {
        let now = Timestamp::now();
        Self {
            schema_version: SCHEMA_VERSION,
            embedding_dimension,
            created_at: now,
            last_opened_at: now,
        }
    }

    /// Updates the last_opened_at timestamp.
    pub fn touch(&mut self) {
        self.last_opened_at = Timestamp::now();
    }
}

// ============================================================================
// Key Encoding Helpers
// ============================================================================

/// Encodes a (Timestamp, id) pair as a 24-byte composite key.
///
/// Format: [timestamp_be: 8 bytes][id: 16 bytes].
/// Big-endian timestamp ensures lexicographic ordering matches time
/// ordering; the id suffix disambiguates same-millisecond writes.
#[inline]
pub fn encode_time_id_key(timestamp: Timestamp, id: &[u8; 16]) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..8].copy_from_slice(&timestamp.to_be_bytes());
    key[8..].copy_from_slice(id);
    key
}

/// Decodes the timestamp from a composite time/id key.
#[inline]
pub fn decode_timestamp_from_key(key: &[u8; 24]) -> Timestamp {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&key[..8]);
    Timestamp::from_millis(i64::from_be_bytes(bytes))
}

/// Decodes the id bytes from a composite time/id key.
#[inline]
pub fn decode_id_from_key(key: &[u8; 24]) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&key[8..]);
    bytes
}

/// Range start for all composite keys at or after the given instant.
#[inline]
pub fn time_range_start(timestamp: Timestamp) -> [u8; 24] {
    encode_time_id_key(timestamp, &[0u8; 16])
}

/// Range end (inclusive) covering all composite keys at the given instant.
#[inline]
pub fn time_range_end(timestamp: Timestamp) -> [u8; 24] {
    encode_time_id_key(timestamp, &[0xFFu8; 16])
}
