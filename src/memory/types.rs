//! Type definitions for memory entries.
//!
//! A **memory entry** is the core unit of long-lived agent state: identity,
//! scope, kind, an opaque payload body, metadata, an optional embedding for
//! similarity search, and relationship edges into the memory graph.
//!
//! Payload bodies are opaque `serde_json::Value` mappings. The core never
//! introspects payload semantics except for the free-text substring filter.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::{AgentId, Embedding, MemoryId, ServiceId, Timestamp};

// ============================================================================
// MemoryKind
// ============================================================================

/// The kind of state a memory entry holds.
///
/// Kinds follow the standard agent-memory taxonomy plus a `Business` kind
/// for analytics-facing entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    /// Short-lived task context.
    Working,
    /// A record of something that happened.
    Episodic,
    /// Distilled knowledge independent of any single episode.
    Semantic,
    /// How-to knowledge (procedures, playbooks).
    Procedural,
    /// Business-facing state (analytics events, KPIs).
    Business,
}

impl MemoryKind {
    /// Returns the compact 1-byte discriminant for use in index keys.
    pub const fn as_u8(&self) -> u8 {
        match self {
            Self::Working => 0,
            Self::Episodic => 1,
            Self::Semantic => 2,
            Self::Procedural => 3,
            Self::Business => 4,
        }
    }

    /// Restores a kind from its index-key discriminant.
    pub const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Working),
            1 => Some(Self::Episodic),
            2 => Some(Self::Semantic),
            3 => Some(Self::Procedural),
            4 => Some(Self::Business),
            _ => None,
        }
    }

    /// Returns the canonical lowercase name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Working => "working",
            Self::Episodic => "episodic",
            Self::Semantic => "semantic",
            Self::Procedural => "procedural",
            Self::Business => "business",
        }
    }
}

impl Default for MemoryKind {
    fn default() -> Self {
        Self::Semantic
    }
}

// ============================================================================
// MemoryEntry — the full stored record
// ============================================================================

/// A stored memory entry.
///
/// The identifier is immutable and stable across tiers; `version` is
/// monotonically non-decreasing across writes of the same id. The
/// `archived` flag is derived: true iff the body lives only in the cold
/// tier and the warm row is a stub.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Unique identifier (UUID v7, time-ordered).
    pub id: MemoryId,

    /// The service that owns this entry.
    pub service_id: ServiceId,

    /// The agent that wrote this entry.
    pub agent_id: AgentId,

    /// Domain tag scoping the entry (also selects the similarity index).
    pub domain: String,

    /// What kind of state this entry holds.
    pub kind: MemoryKind,

    /// Opaque payload body. Never introspected by the core except for
    /// the free-text substring filter.
    pub payload: serde_json::Value,

    /// When this entry was created. Immutable.
    pub created_at: Timestamp,

    /// Monotonically non-decreasing write version (1 on creation).
    pub version: u64,

    /// Tag set for categorical filtering.
    pub tags: BTreeSet<String>,

    /// Optional correlation id linking related writes across services.
    pub correlation_id: Option<String>,

    /// Optional session the entry was produced in.
    pub session_id: Option<String>,

    /// Optional end-user the entry concerns.
    pub user_id: Option<String>,

    /// Importance score in [0, 10]. Higher = more important.
    pub importance: f32,

    /// Number of times this entry has been read.
    pub access_count: u64,

    /// When this entry was last read.
    pub last_accessed: Timestamp,

    /// Optional hard expiry. Entries are treated as expired from this
    /// instant onward (half-open interval `[created_at, expires_at)`).
    pub expires_at: Option<Timestamp>,

    /// Semantic embedding vector, if the producer supplied one.
    ///
    /// Stored separately in the embeddings table; skipped during bincode
    /// serialization of the main record.
    #[serde(skip)]
    pub embedding: Option<Embedding>,

    /// Ids of related entries (undirected association).
    pub related_ids: BTreeSet<MemoryId>,

    /// Optional id of the entry that caused this one.
    pub cause_id: Option<MemoryId>,

    /// Ids of entries this one led to.
    pub effect_ids: BTreeSet<MemoryId>,

    /// True iff the body lives only in the cold tier.
    pub archived: bool,
}

impl MemoryEntry {
    /// Returns true if the entry is expired at the given instant.
    ///
    /// Exactly-at-threshold counts as expired (half-open interval).
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }

    /// Returns a stub copy: scope and metadata retained, body and
    /// embedding dropped. This is what the warm tier keeps after the
    /// body demotes to cold.
    pub fn to_stub(&self) -> Self {
        Self {
            payload: serde_json::Value::Null,
            embedding: None,
            archived: true,
            ..self.clone()
        }
    }

    /// Renders the complete entry as JSON, embedding included.
    ///
    /// The entry's own serde representation omits the embedding (it lives
    /// in a separate warm-tier table); the cold archive and the sync wire
    /// both need the full serialization, so they use this shape:
    /// `{ "entry": <record>, "embedding": <vector|null> }`.
    pub fn to_json_full(&self) -> serde_json::Value {
        serde_json::json!({
            "entry": self,
            "embedding": self.embedding,
        })
    }

    /// Restores a complete entry from its [`to_json_full`](Self::to_json_full)
    /// shape. Returns `None` if the value doesn't carry a valid record.
    pub fn from_json_full(value: &serde_json::Value) -> Option<Self> {
        let mut entry: Self = serde_json::from_value(value.get("entry")?.clone()).ok()?;
        entry.embedding = value.get("embedding").and_then(|v| {
            if v.is_null() {
                None
            } else {
                serde_json::from_value(v.clone()).ok()
            }
        });
        Some(entry)
    }
}

// ============================================================================
// RelationshipEdge
// ============================================================================

/// A directed, typed edge in the memory relationship graph.
///
/// Edges are stored by source id; the `(source, target, kind)` triple is
/// the unique key, so re-inserting an existing edge is a no-op. Edges may
/// dangle after a cold-tier deletion; traversal tolerates them.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationshipEdge {
    /// The entry this edge points at.
    pub target: MemoryId,

    /// Free-form relationship kind (`related_to`, `caused_by`, `led_to`, ...).
    pub kind: String,
}

// ============================================================================
// NewMemoryEntry — input for MemoryEngine::store()
// ============================================================================

/// Input for creating a new memory entry.
///
/// The `id`, `created_at`, `version`, `access_count`, `last_accessed`, and
/// `archived` fields are assigned by the engine.
#[derive(Clone, Debug)]
pub struct NewMemoryEntry {
    /// The service writing the entry.
    pub service_id: ServiceId,

    /// The agent writing the entry.
    pub agent_id: AgentId,

    /// Domain tag.
    pub domain: String,

    /// Entry kind.
    pub kind: MemoryKind,

    /// Opaque payload body.
    pub payload: serde_json::Value,

    /// Tag set.
    pub tags: BTreeSet<String>,

    /// Optional correlation id.
    pub correlation_id: Option<String>,

    /// Optional session id.
    pub session_id: Option<String>,

    /// Optional user id.
    pub user_id: Option<String>,

    /// Importance score in [0, 10].
    pub importance: f32,

    /// Optional hard expiry instant.
    pub expires_at: Option<Timestamp>,

    /// Optional embedding vector.
    pub embedding: Option<Embedding>,

    /// Ids of related entries known at creation time.
    pub related_ids: BTreeSet<MemoryId>,

    /// Optional id of the entry that caused this one.
    pub cause_id: Option<MemoryId>,

    /// Ids of entries this one led to.
    pub effect_ids: BTreeSet<MemoryId>,
}

impl Default for NewMemoryEntry {
    fn default() -> Self {
        Self {
            service_id: ServiceId::new("anonymous"),
            agent_id: AgentId::new("anonymous"),
            domain: String::new(),
            kind: MemoryKind::default(),
            payload: serde_json::Value::Null,
            tags: BTreeSet::new(),
            correlation_id: None,
            session_id: None,
            user_id: None,
            importance: 5.0,
            expires_at: None,
            embedding: None,
            related_ids: BTreeSet::new(),
            cause_id: None,
            effect_ids: BTreeSet::new(),
        }
    }
}

// ============================================================================
// MemoryFilter — query criteria
// ============================================================================

/// Filter criteria for memory queries.
///
/// Fields set to `None` are not filtered on. Results are ordered by
/// creation instant descending; expired and hard-deleted entries are
/// never returned.
#[derive(Clone, Debug, Default)]
pub struct MemoryFilter {
    /// Only entries owned by this service.
    pub service_id: Option<ServiceId>,

    /// Only entries written by this agent.
    pub agent_id: Option<AgentId>,

    /// Only entries of this kind.
    pub kind: Option<MemoryKind>,

    /// Only entries in this domain.
    pub domain: Option<String>,

    /// Only entries carrying at least one of these tags.
    ///
    /// `None` means no tag filtering. An empty set matches nothing.
    pub tags: Option<BTreeSet<String>>,

    /// Only entries created at or after this instant.
    pub since: Option<Timestamp>,

    /// Only entries created strictly before this instant.
    pub until: Option<Timestamp>,

    /// Only entries with importance >= this threshold.
    pub min_importance: Option<f32>,

    /// Case-sensitive substring match over the serialized payload.
    pub text: Option<String>,

    /// Number of leading results to skip (pagination).
    pub offset: usize,

    /// Maximum results to return. 0 means the engine default.
    pub limit: usize,
}

impl MemoryFilter {
    /// Returns `true` if the given entry passes all filter criteria.
    ///
    /// Expiry is checked against `now` separately by the engine; this
    /// method covers the declarative criteria only.
    pub fn matches(&self, entry: &MemoryEntry) -> bool {
        if let Some(ref service_id) = self.service_id {
            if &entry.service_id != service_id {
                return false;
            }
        }

        if let Some(ref agent_id) = self.agent_id {
            if &entry.agent_id != agent_id {
                return false;
            }
        }

        if let Some(kind) = self.kind {
            if entry.kind != kind {
                return false;
            }
        }

        if let Some(ref domain) = self.domain {
            if &entry.domain != domain {
                return false;
            }
        }

        // Tag intersection: at least one requested tag present
        if let Some(ref tags) = self.tags {
            if !tags.iter().any(|t| entry.tags.contains(t)) {
                return false;
            }
        }

        if let Some(since) = self.since {
            if entry.created_at < since {
                return false;
            }
        }

        if let Some(until) = self.until {
            if entry.created_at >= until {
                return false;
            }
        }

        if let Some(min) = self.min_importance {
            if entry.importance < min {
                return false;
            }
        }

        if let Some(ref text) = self.text {
            let rendered = entry.payload.to_string();
            if !rendered.contains(text.as_str()) {
                return false;
            }
        }

        true
    }
}

// ============================================================================
// MemoryAggregation — output of MemoryEngine::aggregate()
// ============================================================================

/// Aggregate view over a (service, domain) scope within a time window.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryAggregation {
    /// The service scope.
    pub service_id: ServiceId,

    /// The domain scope.
    pub domain: String,

    /// Window start (inclusive).
    pub window_start: Timestamp,

    /// Window end (exclusive).
    pub window_end: Timestamp,

    /// Total live entries in the window.
    pub total_entries: u64,

    /// Entry counts broken down by kind.
    pub by_kind: Vec<(MemoryKind, u64)>,

    /// Mean importance across counted entries (0 when empty).
    pub avg_importance: f64,

    /// Sum of access counters across counted entries.
    pub total_accesses: u64,

    /// Count of entries whose bodies live in the cold tier.
    pub archived_entries: u64,

    /// The most frequent tags, descending, capped at ten.
    pub top_tags: Vec<(String, u64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_entry() -> MemoryEntry {
        MemoryEntry {
            id: MemoryId::new(),
            service_id: ServiceId::new("svc-a"),
            agent_id: AgentId::new("agent-1"),
            domain: "legal".to_string(),
            kind: MemoryKind::Semantic,
            payload: serde_json::json!({"clause": "indemnification"}),
            created_at: Timestamp::from_millis(1000),
            version: 1,
            tags: ["contracts".to_string()].into_iter().collect(),
            correlation_id: None,
            session_id: None,
            user_id: None,
            importance: 5.0,
            access_count: 0,
            last_accessed: Timestamp::from_millis(1000),
            expires_at: None,
            embedding: None,
            related_ids: BTreeSet::new(),
            cause_id: None,
            effect_ids: BTreeSet::new(),
            archived: false,
        }
    }

    #[test]
    fn test_kind_tag_roundtrip() {
        for kind in [
            MemoryKind::Working,
            MemoryKind::Episodic,
            MemoryKind::Semantic,
            MemoryKind::Procedural,
            MemoryKind::Business,
        ] {
            assert_eq!(MemoryKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(MemoryKind::from_u8(200), None);
    }

    #[test]
    fn test_expiry_is_half_open() {
        let mut entry = test_entry();
        entry.expires_at = Some(Timestamp::from_millis(2000));

        assert!(!entry.is_expired_at(Timestamp::from_millis(1999)));
        // Exactly at the threshold counts as expired
        assert!(entry.is_expired_at(Timestamp::from_millis(2000)));
        assert!(entry.is_expired_at(Timestamp::from_millis(2001)));
    }

    #[test]
    fn test_no_expiry_never_expires() {
        let entry = test_entry();
        assert!(!entry.is_expired_at(Timestamp::from_millis(i64::MAX)));
    }

    #[test]
    fn test_stub_drops_body_and_embedding() {
        let mut entry = test_entry();
        entry.embedding = Some(vec![0.1; 4]);
        let stub = entry.to_stub();

        assert_eq!(stub.id, entry.id);
        assert_eq!(stub.service_id, entry.service_id);
        assert!(stub.archived);
        assert!(stub.payload.is_null());
        assert!(stub.embedding.is_none());
    }

    #[test]
    fn test_entry_bincode_skips_embedding() {
        let mut entry = test_entry();
        entry.embedding = Some(vec![1.0; 384]);

        let bytes = bincode::serialize(&entry).unwrap();
        let restored: MemoryEntry = bincode::deserialize(&bytes).unwrap();

        assert_eq!(restored.id, entry.id);
        assert!(restored.embedding.is_none());
        assert_eq!(restored.payload, entry.payload);
    }

    #[test]
    fn test_filter_default_matches() {
        let filter = MemoryFilter::default();
        assert!(filter.matches(&test_entry()));
    }

    #[test]
    fn test_filter_by_scope() {
        let entry = test_entry();

        let filter = MemoryFilter {
            service_id: Some(ServiceId::new("svc-a")),
            domain: Some("legal".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&entry));

        let filter = MemoryFilter {
            service_id: Some(ServiceId::new("svc-b")),
            ..Default::default()
        };
        assert!(!filter.matches(&entry));
    }

    #[test]
    fn test_filter_tag_intersection() {
        let entry = test_entry();

        let filter = MemoryFilter {
            tags: Some(
                ["contracts".to_string(), "unrelated".to_string()]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        };
        assert!(filter.matches(&entry));

        let filter = MemoryFilter {
            tags: Some(["unrelated".to_string()].into_iter().collect()),
            ..Default::default()
        };
        assert!(!filter.matches(&entry));

        // Empty requested set matches nothing
        let filter = MemoryFilter {
            tags: Some(BTreeSet::new()),
            ..Default::default()
        };
        assert!(!filter.matches(&entry));
    }

    #[test]
    fn test_filter_time_window() {
        let entry = test_entry(); // created at 1000

        let filter = MemoryFilter {
            since: Some(Timestamp::from_millis(1000)),
            until: Some(Timestamp::from_millis(1001)),
            ..Default::default()
        };
        assert!(filter.matches(&entry));

        let filter = MemoryFilter {
            until: Some(Timestamp::from_millis(1000)),
            ..Default::default()
        };
        assert!(!filter.matches(&entry));
    }

    #[test]
    fn test_filter_min_importance() {
        let entry = test_entry(); // importance 5.0

        let filter = MemoryFilter {
            min_importance: Some(5.0),
            ..Default::default()
        };
        assert!(filter.matches(&entry));

        let filter = MemoryFilter {
            min_importance: Some(7.5),
            ..Default::default()
        };
        assert!(!filter.matches(&entry));
    }

    #[test]
    fn test_filter_payload_text() {
        let entry = test_entry();

        let filter = MemoryFilter {
            text: Some("indemnification".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&entry));

        let filter = MemoryFilter {
            text: Some("force majeure".to_string()),
            ..Default::default()
        };
        assert!(!filter.matches(&entry));
    }
}
