//! Vector indexes for similarity search.
//!
//! One HNSW index per domain, built on [`hnsw_rs`] (pure Rust). Embeddings
//! stored in the warm tier are the **source of truth**: indexes are
//! derived, rebuildable structures reconstructed from warm-tier rows on
//! open. There is no index persistence to go stale.
//!
//! Distances are cosine: the engine converts to similarity as
//! `1 - distance` before applying thresholds.

mod hnsw;

pub use hnsw::HnswIndex;
