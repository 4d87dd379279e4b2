//! # Membrane
//!
//! Memory persistence and cross-service synchronization core for fleets
//! of AI agent services.
//!
//! Membrane durably stores typed **memory entries** and **learning
//! events**, indexes them for retrieval by id, attribute filter, and
//! vector similarity, ages them across hot/warm/cold storage tiers, and
//! replicates them in near-real-time to peer services over bidirectional
//! streaming connections.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use membrane::{AgentId, Config, MemoryCore, MemoryKind, NewMemoryEntry, ServiceId};
//! use tokio_util::sync::CancellationToken;
//!
//! let core = MemoryCore::open(Config::from_env()?)?;
//! let cancel = CancellationToken::new();
//! core.start(cancel.clone());
//!
//! // Store an entry
//! let entry = core.memory().store(NewMemoryEntry {
//!     service_id: ServiceId::new("legal-svc"),
//!     agent_id: AgentId::new("clause-analyzer"),
//!     domain: "legal".to_string(),
//!     kind: MemoryKind::Semantic,
//!     payload: serde_json::json!({"clause": "indemnification"}),
//!     ..Default::default()
//! })?;
//!
//! // Search by similarity
//! let hits = core.memory().search_similarity(&query_vector, "legal", 10, 0.7)?;
//!
//! cancel.cancel();
//! ```
//!
//! ## Key Concepts
//!
//! ### Memory entry
//!
//! A unit of long-lived agent state: identity, scope (service/agent/
//! domain), kind, an opaque payload, metadata, an optional embedding, and
//! relationship edges. Entries live in three tiers: an expiring hot
//! cache, the warm store (source of truth), and a cold object archive
//! for aged bodies.
//!
//! ### Learning event
//!
//! An immutable record of an agent's learning step. Events feed derived
//! pattern rows, windowed metric rollups, trend analysis, and the hourly
//! insight rules.
//!
//! ### Sync fabric
//!
//! Configured peers each get a durable FIFO queue; sender tasks drain
//! them over websocket connections with reconnect and backpressure.
//! Delivery is at-least-once with idempotent application by envelope id.
//!
//! ## Thread Safety
//!
//! [`MemoryCore`] is `Send + Sync`; share it across tasks with `Arc`.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

// ============================================================================
// Module declarations
// ============================================================================

mod config;
mod core;
mod error;
mod types;

pub mod api;
pub mod bus;
pub mod insight;
pub mod learning;
pub mod memory;
pub mod sync;
pub mod tier;

/// Vector index module for HNSW-based approximate nearest neighbor search.
pub mod vector;

// ============================================================================
// Public API re-exports
// ============================================================================

// Main core interface
pub use crate::core::{HealthReport, MemoryCore};

// Configuration
pub use config::{Config, EmbeddingDimension, HnswConfig, PeerConfig};

// Error handling
pub use error::{
    MembraneError, NotFoundError, Result, StorageError, TransportError, ValidationError,
};

// Core types
pub use types::{
    AgentId, Embedding, EnvelopeId, EventId, InsightId, MemoryId, PeerId, ServiceId, Timestamp,
};

// Domain types
pub use insight::{Insight, InsightType, MetricSnapshot, Severity};
pub use learning::{
    EventFilter, EventKind, LearningEvent, LearningPattern, MetricsRollup, NewLearningEvent,
    TrendDirection, TrendReport,
};
pub use memory::{MemoryAggregation, MemoryEntry, MemoryFilter, MemoryKind, NewMemoryEntry};

// Sync fabric
pub use sync::{PayloadKind, PeerState, SyncAction, SyncEnvelope, SyncFabric};

// ============================================================================
// Prelude module for convenient imports
// ============================================================================

/// Convenient imports for common membrane usage.
///
/// ```rust
/// use membrane::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{Config, EmbeddingDimension, PeerConfig};
    pub use crate::core::MemoryCore;
    pub use crate::error::{MembraneError, Result};
    pub use crate::learning::{EventKind, LearningEvent, NewLearningEvent};
    pub use crate::memory::{MemoryEntry, MemoryFilter, MemoryKind, NewMemoryEntry};
    pub use crate::sync::{PayloadKind, SyncEnvelope};
    pub use crate::types::{MemoryId, ServiceId, Timestamp};
}
