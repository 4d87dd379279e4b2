//! Memory engine: entry lifecycle, tier routing, relationship graph,
//! similarity search.
//!
//! Writes land in the warm tier before the call returns; the hot-tier
//! set and the bus publish are downstream effects that never fail the
//! caller. Entries applied from the inbound sync path go through
//! [`apply_replicated`](MemoryEngine::apply_replicated), which skips the
//! bus publish to avoid replication loops.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use tracing::{info, instrument, warn};

use crate::bus::{BusEvent, EventBus};
use crate::config::Config;
use crate::error::{MembraneError, NotFoundError, Result, ValidationError};
use crate::memory::types::{
    MemoryAggregation, MemoryEntry, MemoryFilter, MemoryKind, NewMemoryEntry, RelationshipEdge,
};
use crate::memory::validate_new_entry;
use crate::tier::schema::{DEFAULT_QUERY_LIMIT, MAX_QUERY_LIMIT};
use crate::tier::TierStore;
use crate::types::{MemoryId, ServiceId, Timestamp};
use crate::vector::HnswIndex;

/// Relationship kind used for plain associations.
pub const KIND_RELATED: &str = "related_to";
/// Relationship kind recording that the source was caused by the target.
pub const KIND_CAUSED_BY: &str = "caused_by";
/// Relationship kind recording that the source led to the target.
pub const KIND_LED_TO: &str = "led_to";

/// The memory engine: entry lifecycle, retrieval, and the relationship
/// graph over the tier store.
pub struct MemoryEngine {
    tiers: Arc<TierStore>,
    bus: Arc<EventBus>,
    config: Config,

    /// Per-domain HNSW indexes.
    ///
    /// Outer RwLock protects the map (new domains appear at runtime);
    /// each index synchronizes internally for concurrent search+insert.
    indexes: RwLock<HashMap<String, HnswIndex>>,
}

impl MemoryEngine {
    /// Builds the engine and rebuilds similarity indexes from the warm
    /// tier for every known domain.
    pub fn open(tiers: Arc<TierStore>, bus: Arc<EventBus>, config: Config) -> Result<Self> {
        let mut indexes = HashMap::new();
        let dimension = config.dimension();

        for domain in tiers.warm().known_domains()? {
            let embeddings = tiers.warm().embeddings_in_domain(&domain)?;
            if embeddings.is_empty() {
                continue;
            }
            let start = std::time::Instant::now();
            let index = HnswIndex::rebuild_from_embeddings(dimension, &config.hnsw, embeddings)?;
            info!(
                domain = %domain,
                vectors = index.active_count(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Rebuilt similarity index from warm tier"
            );
            indexes.insert(domain, index);
        }

        Ok(Self {
            tiers,
            bus,
            config,
            indexes: RwLock::new(indexes),
        })
    }

    /// Stores a new entry.
    ///
    /// Assigns the id, stamps `created_at` and `version = 1`, writes
    /// through the tier store, indexes the embedding, records any
    /// creation-time relationship edges, and emits `memory.stored`.
    ///
    /// # Errors
    ///
    /// [`ValidationError`](crate::ValidationError) if required scope
    /// fields are missing, importance is out of range, the embedding
    /// dimension mismatches, or `expires_at` precedes creation.
    #[instrument(skip(self, new), fields(domain = %new.domain))]
    pub fn store(&self, new: NewMemoryEntry) -> Result<MemoryEntry> {
        validate_new_entry(&new, self.config.dimension())?;

        let now = Timestamp::now();
        if let Some(expires_at) = new.expires_at {
            if expires_at < now {
                return Err(ValidationError::invalid_field(
                    "expires_at",
                    "must not precede the creation instant",
                )
                .into());
            }
        }

        let entry = MemoryEntry {
            id: MemoryId::new(),
            service_id: new.service_id,
            agent_id: new.agent_id,
            domain: new.domain,
            kind: new.kind,
            payload: new.payload,
            created_at: now,
            version: 1,
            tags: new.tags,
            correlation_id: new.correlation_id,
            session_id: new.session_id,
            user_id: new.user_id,
            importance: new.importance,
            access_count: 0,
            last_accessed: now,
            expires_at: new.expires_at,
            embedding: new.embedding,
            related_ids: new.related_ids,
            cause_id: new.cause_id,
            effect_ids: new.effect_ids,
            archived: false,
        };

        // Warm write is the failure boundary; everything after is
        // best-effort downstream.
        self.tiers.write_entry(&entry)?;
        self.index_embedding(&entry);
        self.record_creation_edges(&entry);

        self.bus.publish(BusEvent::MemoryStored(entry.clone()));

        info!(id = %entry.id, "Memory entry stored");
        Ok(entry)
    }

    /// Applies a replicated entry from the inbound sync path.
    ///
    /// Idempotent by id and version: if the id exists locally with a
    /// version at or above the incoming one, nothing is written and
    /// `false` is returned. Accepted applies do NOT re-publish on the
    /// bus - that would loop the envelope back to peers.
    #[instrument(skip(self, entry), fields(id = %entry.id))]
    pub fn apply_replicated(&self, entry: MemoryEntry) -> Result<bool> {
        if let Some(existing) = self.tiers.warm().get_entry(entry.id)? {
            if existing.version >= entry.version {
                return Ok(false);
            }
        }

        self.tiers.write_entry(&entry)?;
        self.index_embedding(&entry);
        Ok(true)
    }

    /// Retrieves an entry by id through the tiered read path.
    ///
    /// Expired entries read as absent. A hit bumps the access counter
    /// and last-accessed instant; the bump is best-effort and never
    /// fails the read.
    #[instrument(skip(self))]
    pub fn get(&self, id: MemoryId) -> Result<Option<MemoryEntry>> {
        let Some(mut entry) = self.tiers.read_entry(id)? else {
            return Ok(None);
        };

        let now = Timestamp::now();
        if entry.is_expired_at(now) {
            return Ok(None);
        }

        match self.tiers.warm().bump_access(id, now) {
            Ok(Some(count)) => {
                entry.access_count = count;
                entry.last_accessed = now;
            }
            Ok(None) => {}
            Err(e) => warn!(id = %id, error = %e, "Access bump failed (read still served)"),
        }

        Ok(Some(entry))
    }

    /// Queries entries by filter, ordered by creation instant descending.
    ///
    /// Never returns expired entries. Archived matches come back with
    /// their cold body inlined; a stub whose cold object is unreadable is
    /// skipped with a warning rather than failing the whole query.
    #[instrument(skip(self, filter))]
    pub fn query(&self, filter: &MemoryFilter) -> Result<Vec<MemoryEntry>> {
        let limit = effective_limit(filter.limit);
        let now = Timestamp::now();

        let ids = self.tiers.warm().recent_entry_ids(
            filter.domain.as_deref(),
            filter.service_id.as_ref().map(|s| s.as_str()),
        )?;

        let mut matches = Vec::new();
        let mut skipped = 0usize;
        for id in ids {
            if matches.len() >= limit {
                break;
            }

            let Some(entry) = self.tiers.warm().get_entry(id)? else {
                continue;
            };
            if entry.is_expired_at(now) || !filter.matches_or_archived(&entry) {
                continue;
            }

            let entry = if entry.archived {
                match self.tiers.read_entry(id) {
                    Ok(Some(full)) => full,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(id = %id, error = %e, "Skipping archived entry with unreadable body");
                        continue;
                    }
                }
            } else {
                entry
            };

            // Text filter needs the real body, so archived entries are
            // re-checked after the cold inline.
            if !filter.matches(&entry) {
                continue;
            }

            if skipped < filter.offset {
                skipped += 1;
                continue;
            }
            matches.push(entry);
        }

        Ok(matches)
    }

    /// Cosine similarity search within a domain.
    ///
    /// Returns `(entry, similarity)` pairs with `similarity > threshold`,
    /// sorted descending, capped at `k`. Expired entries are excluded.
    #[instrument(skip(self, vector))]
    pub fn search_similarity(
        &self,
        vector: &[f32],
        domain: &str,
        k: usize,
        threshold: f32,
    ) -> Result<Vec<(MemoryEntry, f32)>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let indexes = self
            .indexes
            .read()
            .map_err(|_| MembraneError::vector("Index map lock poisoned"))?;
        let Some(index) = indexes.get(domain) else {
            return Ok(Vec::new());
        };

        let ef_search = self.config.hnsw.ef_search.max(k);
        let hits = index.search_entries(vector, k, ef_search)?;
        drop(indexes);

        let now = Timestamp::now();
        let mut results = Vec::with_capacity(hits.len());
        for (id, distance) in hits {
            let similarity = 1.0 - distance;
            if similarity <= threshold {
                continue;
            }
            // Archived hits keep their index row; inline the body
            let Some(entry) = self.tiers.read_entry(id)? else {
                continue;
            };
            if entry.is_expired_at(now) {
                continue;
            }
            results.push((entry, similarity));
        }

        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(k);
        Ok(results)
    }

    /// Hard-deletes an entry from every tier and its domain's similarity
    /// index. Returns `true` if the entry existed.
    ///
    /// Used by the expiry path and by replicated `delete` envelopes.
    #[instrument(skip(self))]
    pub fn delete(&self, id: MemoryId) -> Result<bool> {
        let domain = self.tiers.warm().get_entry(id)?.map(|e| e.domain);
        if !self.tiers.delete_entry(id)? {
            return Ok(false);
        }

        if let Some(domain) = domain {
            let indexes = self
                .indexes
                .read()
                .map_err(|_| MembraneError::vector("Index map lock poisoned"))?;
            if let Some(index) = indexes.get(&domain) {
                index.delete_entry(id)?;
            }
        }

        info!(id = %id, "Memory entry deleted");
        Ok(true)
    }

    /// Inserts a relationship edge. Idempotent over the
    /// (source, target, kind) triple.
    ///
    /// Both endpoints must currently exist; edges are allowed to dangle
    /// later (e.g. after cold-tier deletion), and traversal tolerates
    /// that.
    #[instrument(skip(self))]
    pub fn relate(&self, source: MemoryId, target: MemoryId, kind: &str) -> Result<()> {
        if kind.is_empty() {
            return Err(ValidationError::required_field("kind").into());
        }
        if source == target {
            return Err(ValidationError::invalid_field(
                "target",
                "cannot relate an entry to itself",
            )
            .into());
        }

        self.tiers
            .warm()
            .get_entry(source)?
            .ok_or_else(|| MembraneError::from(NotFoundError::memory(source)))?;
        self.tiers
            .warm()
            .get_entry(target)?
            .ok_or_else(|| MembraneError::from(NotFoundError::memory(target)))?;

        let inserted = self.tiers.warm().add_edge(
            source,
            &RelationshipEdge {
                target,
                kind: kind.to_string(),
            },
        )?;

        if inserted {
            info!(source = %source, target = %target, kind = kind, "Relationship recorded");
        }
        Ok(())
    }

    /// Breadth-first traversal over relationship edges.
    ///
    /// Visits up to `max_depth` hops from `id`, optionally following only
    /// edges of one kind. Cycles are handled with a visited set; returned
    /// entries are deduplicated and exclude the start entry. Dangling
    /// edges (target deleted) are skipped but do not stop the traversal.
    #[instrument(skip(self))]
    pub fn related(
        &self,
        id: MemoryId,
        kind: Option<&str>,
        max_depth: usize,
    ) -> Result<Vec<MemoryEntry>> {
        let mut visited: HashSet<MemoryId> = HashSet::from([id]);
        let mut frontier: VecDeque<(MemoryId, usize)> = VecDeque::from([(id, 0)]);
        let mut found = Vec::new();
        let now = Timestamp::now();

        while let Some((current, depth)) = frontier.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for edge in self.tiers.warm().edges_from(current)? {
                if let Some(kind) = kind {
                    if edge.kind != kind {
                        continue;
                    }
                }
                if !visited.insert(edge.target) {
                    continue;
                }
                frontier.push_back((edge.target, depth + 1));

                // Dangling edge: keep traversing through the id without
                // returning an entry for it
                if let Some(entry) = self.tiers.warm().get_entry(edge.target)? {
                    if !entry.is_expired_at(now) {
                        found.push(entry);
                    }
                }
            }
        }

        Ok(found)
    }

    /// Aggregates a (service, domain) scope over a time window.
    #[instrument(skip(self))]
    pub fn aggregate(
        &self,
        service_id: &ServiceId,
        domain: &str,
        window_start: Timestamp,
        window_end: Timestamp,
    ) -> Result<MemoryAggregation> {
        let now = Timestamp::now();
        let ids = self.tiers.warm().recent_entry_ids(Some(domain), None)?;

        let mut total = 0u64;
        let mut by_kind: HashMap<MemoryKind, u64> = HashMap::new();
        let mut importance_sum = 0.0f64;
        let mut total_accesses = 0u64;
        let mut archived = 0u64;
        let mut tag_counts: HashMap<String, u64> = HashMap::new();

        for id in ids {
            let Some(entry) = self.tiers.warm().get_entry(id)? else {
                continue;
            };
            if &entry.service_id != service_id
                || entry.created_at < window_start
                || entry.created_at >= window_end
                || entry.is_expired_at(now)
            {
                continue;
            }

            total += 1;
            *by_kind.entry(entry.kind).or_default() += 1;
            importance_sum += f64::from(entry.importance);
            total_accesses += entry.access_count;
            if entry.archived {
                archived += 1;
            }
            for tag in &entry.tags {
                *tag_counts.entry(tag.clone()).or_default() += 1;
            }
        }

        let mut top_tags: Vec<(String, u64)> = tag_counts.into_iter().collect();
        top_tags.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_tags.truncate(10);

        let mut by_kind: Vec<(MemoryKind, u64)> = by_kind.into_iter().collect();
        by_kind.sort_by_key(|(kind, _)| kind.as_u8());

        Ok(MemoryAggregation {
            service_id: service_id.clone(),
            domain: domain.to_string(),
            window_start,
            window_end,
            total_entries: total,
            by_kind,
            avg_importance: if total > 0 {
                importance_sum / total as f64
            } else {
                0.0
            },
            total_accesses,
            archived_entries: archived,
            top_tags,
        })
    }

    // =========================================================================
    // Sweeper hooks
    // =========================================================================

    /// Runs one archive pass (see [`TierStore::archive_pass`]).
    pub fn run_archive_sweep(&self, now: Timestamp) -> Result<crate::tier::ArchiveStats> {
        self.tiers.archive_pass(now)
    }

    /// Runs one expiry pass and drops deleted entries from their domain
    /// indexes.
    pub fn run_expiry_sweep(&self, now: Timestamp) -> Result<usize> {
        let deleted = self.tiers.expiry_pass(now)?;
        if deleted.is_empty() {
            return Ok(0);
        }

        let indexes = self
            .indexes
            .read()
            .map_err(|_| MembraneError::vector("Index map lock poisoned"))?;
        for (id, domain) in &deleted {
            if let Some(index) = indexes.get(domain.as_str()) {
                index.delete_entry(*id)?;
            }
        }
        Ok(deleted.len())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Inserts an entry's embedding into its domain index, creating the
    /// index on first use. Failures are downstream of the warm write and
    /// only logged.
    fn index_embedding(&self, entry: &MemoryEntry) {
        let Some(ref embedding) = entry.embedding else {
            return;
        };

        let result = (|| -> Result<()> {
            {
                let indexes = self
                    .indexes
                    .read()
                    .map_err(|_| MembraneError::vector("Index map lock poisoned"))?;
                if let Some(index) = indexes.get(&entry.domain) {
                    return index.insert_entry(entry.id, embedding);
                }
            }

            let mut indexes = self
                .indexes
                .write()
                .map_err(|_| MembraneError::vector("Index map lock poisoned"))?;
            let index = indexes
                .entry(entry.domain.clone())
                .or_insert_with(|| HnswIndex::new(self.config.dimension(), &self.config.hnsw));
            index.insert_entry(entry.id, embedding)
        })();

        if let Err(e) = result {
            warn!(id = %entry.id, error = %e, "Embedding index insert failed (warm row intact)");
        }
    }

    /// Persists the relationship edges implied by a new entry's
    /// creation-time relationship sets. Best-effort.
    fn record_creation_edges(&self, entry: &MemoryEntry) {
        let mut edges: Vec<RelationshipEdge> = Vec::new();
        for &target in &entry.related_ids {
            edges.push(RelationshipEdge {
                target,
                kind: KIND_RELATED.to_string(),
            });
        }
        if let Some(cause) = entry.cause_id {
            edges.push(RelationshipEdge {
                target: cause,
                kind: KIND_CAUSED_BY.to_string(),
            });
        }
        for &effect in &entry.effect_ids {
            edges.push(RelationshipEdge {
                target: effect,
                kind: KIND_LED_TO.to_string(),
            });
        }

        for edge in edges {
            if let Err(e) = self.tiers.warm().add_edge(entry.id, &edge) {
                warn!(id = %entry.id, error = %e, "Creation-time edge insert failed");
            }
        }
    }
}

impl MemoryFilter {
    /// Like [`matches`](Self::matches), but gives archived stubs the
    /// benefit of the doubt on payload-dependent criteria: the stub has
    /// no body yet, so the text filter is re-run after the cold inline.
    fn matches_or_archived(&self, entry: &MemoryEntry) -> bool {
        if !entry.archived {
            return self.matches(entry);
        }
        let mut without_text = self.clone();
        without_text.text = None;
        without_text.matches(entry)
    }
}

/// Clamps a caller-supplied limit to the engine's bounds.
fn effective_limit(requested: usize) -> usize {
    if requested == 0 {
        DEFAULT_QUERY_LIMIT
    } else {
        requested.min(MAX_QUERY_LIMIT)
    }
}
