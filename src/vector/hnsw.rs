//! HNSW vector index implementation using hnsw_rs.
//!
//! Wraps `hnsw_rs::Hnsw<f32, DistCosine>` with:
//! - Bidirectional `MemoryId` ↔ `usize` ID mapping
//! - Soft-delete via `HashSet` + filtered search
//!
//! Indexes are in-memory only: the warm tier holds the embeddings and a
//! fresh index is rebuilt from them on open, so expired and hard-deleted
//! entries never resurrect across restarts.
//!
//! # Thread Safety
//!
//! The `hnsw_rs::Hnsw` graph uses `parking_lot::RwLock` internally,
//! so `insert()` takes `&self`. Our ID-mapping metadata (`IndexState`)
//! is protected by `std::sync::RwLock`.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use hnsw_rs::prelude::*;

use crate::config::HnswConfig;
use crate::error::{MembraneError, Result};
use crate::types::MemoryId;

/// HNSW vector index backed by `hnsw_rs`.
///
/// Each domain gets its own `HnswIndex` instance, providing complete
/// isolation between domains.
pub struct HnswIndex {
    /// The underlying HNSW graph. Uses `'static` lifetime because
    /// all data is heap-owned (not memory-mapped).
    hnsw: Hnsw<'static, f32, DistCosine>,

    /// Mutable metadata protected by RwLock.
    state: RwLock<IndexState>,

    /// Embedding dimension (must match all inserted vectors).
    dimension: usize,
}

/// Internal mutable state for ID mapping and soft-deletion.
#[derive(Debug)]
struct IndexState {
    /// Forward map: MemoryId → internal usize ID.
    id_to_internal: HashMap<MemoryId, usize>,

    /// Reverse map: internal usize ID → MemoryId.
    /// Uses Vec for O(1) lookup by index.
    internal_to_id: Vec<MemoryId>,

    /// Set of soft-deleted internal IDs (excluded from search).
    deleted: HashSet<usize>,

    /// Next internal ID to assign (monotonically increasing).
    next_id: usize,
}

impl HnswIndex {
    /// Creates a new empty HNSW index.
    ///
    /// # Arguments
    ///
    /// * `dimension` - Expected embedding dimension (validated on insert)
    /// * `config` - HNSW tuning parameters
    pub fn new(dimension: usize, config: &HnswConfig) -> Self {
        let hnsw = Hnsw::new(
            config.max_nb_connection,
            config.max_elements,
            config.max_layer,
            config.ef_construction,
            DistCosine,
        );

        Self {
            hnsw,
            state: RwLock::new(IndexState {
                id_to_internal: HashMap::new(),
                internal_to_id: Vec::new(),
                deleted: HashSet::new(),
                next_id: 0,
            }),
            dimension,
        }
    }

    /// Inserts an entry's embedding into the index.
    ///
    /// Assigns a new internal usize ID and records the mapping. If the
    /// MemoryId is already present and soft-deleted, it is revived; if
    /// present and live, this is a no-op.
    pub fn insert_entry(&self, id: MemoryId, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dimension {
            return Err(MembraneError::vector(format!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                embedding.len()
            )));
        }

        let mut state = self
            .state
            .write()
            .map_err(|_| MembraneError::vector("Index state lock poisoned"))?;

        // Idempotent: revive a soft-deleted entry, skip a live one
        if let Some(&internal_id) = state.id_to_internal.get(&id) {
            state.deleted.remove(&internal_id);
            return Ok(());
        }

        // Assign next sequential internal ID
        let internal_id = state.next_id;
        state.next_id += 1;

        // Record bidirectional mapping
        state.id_to_internal.insert(id, internal_id);
        state.internal_to_id.push(id);

        // Drop the lock before calling hnsw insert (which acquires its own lock)
        drop(state);

        // Insert into HNSW graph (uses interior mutability via parking_lot::RwLock)
        self.hnsw.insert((embedding, internal_id));

        Ok(())
    }

    /// Marks an entry as deleted in the index.
    ///
    /// The vector remains in the graph but is excluded from search
    /// results via filtered search - HNSW graphs don't support point
    /// removal without breaking proximity edges. Returns Ok even if the
    /// entry is not in the index (idempotent).
    pub fn delete_entry(&self, id: MemoryId) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|_| MembraneError::vector("Index state lock poisoned"))?;

        if let Some(&internal_id) = state.id_to_internal.get(&id) {
            state.deleted.insert(internal_id);
        }

        Ok(())
    }

    /// Searches for the k nearest entries, excluding deleted ones.
    ///
    /// Returns `(MemoryId, distance)` pairs sorted by distance ascending
    /// (closest first). Distance is cosine distance:
    /// 0.0 = identical, 2.0 = opposite.
    pub fn search_entries(
        &self,
        query: &[f32],
        k: usize,
        ef_search: usize,
    ) -> Result<Vec<(MemoryId, f32)>> {
        if query.len() != self.dimension {
            return Err(MembraneError::vector(format!(
                "Query dimension mismatch: expected {}, got {}",
                self.dimension,
                query.len()
            )));
        }

        let state = self
            .state
            .read()
            .map_err(|_| MembraneError::vector("Index state lock poisoned"))?;

        // Use filtered search to exclude soft-deleted entries.
        // A concrete closure (not a trait object) auto-implements
        // hnsw_rs::FilterT via the blanket impl.
        let deleted_ref = &state.deleted;
        let filter_fn = |id: &usize| -> bool { !deleted_ref.contains(id) };
        let results = if state.deleted.is_empty() {
            self.hnsw.search(query, k, ef_search)
        } else {
            self.hnsw
                .search_filter(query, k, ef_search, Some(&filter_fn))
        };

        // Map internal IDs back to MemoryIds
        let mapped: Vec<(MemoryId, f32)> = results
            .into_iter()
            .filter_map(|n| {
                state
                    .internal_to_id
                    .get(n.d_id)
                    .map(|&id| (id, n.distance))
            })
            .collect();

        Ok(mapped)
    }

    /// Returns true if the given entry is in the index (and not deleted).
    pub fn contains(&self, id: MemoryId) -> bool {
        let state = self.state.read().ok();
        state.is_some_and(|s| {
            s.id_to_internal
                .get(&id)
                .is_some_and(|internal| !s.deleted.contains(internal))
        })
    }

    /// Returns the number of active (non-deleted) vectors.
    pub fn active_count(&self) -> usize {
        let state = self.state.read().ok();
        state.map_or(0, |s| s.id_to_internal.len() - s.deleted.len())
    }

    /// Rebuilds an index from a set of embeddings.
    ///
    /// Used on open to reconstruct the HNSW graph from warm-tier rows
    /// (the source of truth).
    pub fn rebuild_from_embeddings(
        dimension: usize,
        config: &HnswConfig,
        embeddings: Vec<(MemoryId, Vec<f32>)>,
    ) -> Result<Self> {
        let index = Self::new(dimension, config);

        if embeddings.is_empty() {
            return Ok(index);
        }

        // Prepare batch data for parallel insertion
        let mut state = index
            .state
            .write()
            .map_err(|_| MembraneError::vector("Index state lock poisoned"))?;

        let mut batch: Vec<(&Vec<f32>, usize)> = Vec::with_capacity(embeddings.len());

        for (id, embedding) in &embeddings {
            let internal_id = state.next_id;
            state.next_id += 1;
            state.id_to_internal.insert(*id, internal_id);
            state.internal_to_id.push(*id);
            batch.push((embedding, internal_id));
        }

        drop(state);

        // Parallel bulk insert (uses rayon internally)
        index.hnsw.parallel_insert(&batch);

        Ok(index)
    }
}

impl std::fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("dimension", &self.dimension)
            .field("active_count", &self.active_count())
            .finish_non_exhaustive()
    }
}
