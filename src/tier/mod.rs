//! Three-tier storage: hot cache, warm store, cold archive.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       TierStore                          │
//! │                           │                              │
//! │      ┌────────────────────┼────────────────────┐         │
//! │      ▼                    ▼                    ▼         │
//! │  ┌────────┐          ┌─────────┐          ┌─────────┐   │
//! │  │HotTier │          │WarmStore│          │ColdStore│   │
//! │  │dashmap │          │  redb   │          │ objects │   │
//! │  └────────┘          └─────────┘          └─────────┘   │
//! │  expiring KV        source of truth      id-keyed JSON  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Policy
//!
//! - **Write path**: warm write, then hot set. The cold tier is skipped.
//!   A warm failure fails the operation; a hot failure after a successful
//!   warm write is logged and ignored.
//! - **Read path**: hot → warm → cold. A warm hit repopulates hot; a cold
//!   hit repopulates hot with the full body while the warm row stays a
//!   stub.
//! - **Archive sweep**: bounded batches of non-archived rows past the age
//!   threshold copy their body to cold, keep a warm stub, and leave the
//!   embedding row for similarity search. A cold failure leaves the row
//!   unarchived for retry on the next pass.
//! - **Expiry sweep**: rows past `expires_at` are hard-deleted from every
//!   tier (half-open interval: exactly-at-threshold is expired).

pub mod cold;
pub mod hot;
pub mod schema;
pub mod warm;

pub use cold::ColdStore;
pub use hot::{HotTier, MetricCell, RealtimeMetric};
pub use schema::StoreMetadata;
pub use warm::WarmStore;

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::error::{Result, StorageError};
use crate::memory::MemoryEntry;
use crate::types::{MemoryId, Timestamp};

/// Outcome of one archive sweep pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct ArchiveStats {
    /// Rows considered by the pass.
    pub scanned: usize,
    /// Rows demoted to cold.
    pub archived: usize,
    /// Rows whose cold write failed (left for retry).
    pub failed: usize,
}

/// The uniform write-through / read-with-promotion facade over the three
/// tiers. Shared by the memory engine, the learning ledger, and the
/// background sweepers.
pub struct TierStore {
    warm: Arc<WarmStore>,
    hot: Arc<HotTier>,
    cold: Arc<ColdStore>,

    /// Age (millis) at which entries demote to cold.
    archive_threshold_millis: i64,

    /// Max rows demoted per archive pass.
    archive_batch: usize,
}

impl TierStore {
    /// Builds the facade over already-opened tiers.
    pub fn new(
        warm: Arc<WarmStore>,
        hot: Arc<HotTier>,
        cold: Arc<ColdStore>,
        archive_threshold_millis: i64,
        archive_batch: usize,
    ) -> Self {
        Self {
            warm,
            hot,
            cold,
            archive_threshold_millis,
            archive_batch,
        }
    }

    /// The warm store (source of truth).
    #[inline]
    pub fn warm(&self) -> &WarmStore {
        &self.warm
    }

    /// The hot cache and counter tier.
    #[inline]
    pub fn hot(&self) -> &HotTier {
        &self.hot
    }

    /// The cold archive.
    #[inline]
    pub fn cold(&self) -> &ColdStore {
        &self.cold
    }

    // =========================================================================
    // Write / read paths
    // =========================================================================

    /// Writes an entry through warm and hot.
    ///
    /// The warm write is the one that can fail the caller; the hot set is
    /// downstream and best-effort.
    pub fn write_entry(&self, entry: &MemoryEntry) -> Result<()> {
        self.warm.save_entry(entry)?;
        self.hot.put_entry(entry.clone());
        Ok(())
    }

    /// Reads an entry through hot → warm → cold with promotion.
    ///
    /// Archived hits come back with their cold body inlined and
    /// `archived` still set; the warm row remains a stub.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Archive`] if a stub's cold object is
    /// missing or unreadable - the body is gone and pretending otherwise
    /// would violate the read contract.
    pub fn read_entry(&self, id: MemoryId) -> Result<Option<MemoryEntry>> {
        if let Some(entry) = self.hot.get_entry(id) {
            return Ok(Some(entry));
        }

        let Some(entry) = self.warm.get_entry(id)? else {
            return Ok(None);
        };

        if !entry.archived {
            self.hot.put_entry(entry.clone());
            return Ok(Some(entry));
        }

        // Stub: inline the body from cold
        let restored = self
            .cold
            .restore(entry.service_id.as_str(), &entry.domain, id)?
            .ok_or_else(|| {
                StorageError::archive(format!("archived entry {} has no cold object", id))
            })?;

        let mut full = restored;
        full.archived = true;
        // Access metadata on the stub is fresher than the archived copy
        full.access_count = full.access_count.max(entry.access_count);
        full.last_accessed = full.last_accessed.max(entry.last_accessed);

        self.hot.put_entry(full.clone());
        Ok(Some(full))
    }

    /// Drops an entry from the hot cache (e.g. after an accepted update
    /// from the sync fabric).
    pub fn invalidate(&self, id: MemoryId) {
        self.hot.invalidate(id);
    }

    /// Hard-deletes an entry from every tier. Returns `true` if the warm
    /// row existed.
    pub fn delete_entry(&self, id: MemoryId) -> Result<bool> {
        let Some(entry) = self.warm.get_entry(id)? else {
            return Ok(false);
        };

        self.warm.delete_entry(id)?;
        self.hot.invalidate(id);
        if let Err(e) = self
            .cold
            .delete(entry.service_id.as_str(), &entry.domain, id)
        {
            // Cold delete is cleanup: the id is already unreachable
            warn!(id = %id, error = %e, "Cold-tier delete failed");
        }
        Ok(true)
    }

    // =========================================================================
    // Sweeps
    // =========================================================================

    /// Runs one archive pass: demote a bounded batch of old rows to cold.
    #[instrument(skip(self))]
    pub fn archive_pass(&self, now: Timestamp) -> Result<ArchiveStats> {
        let cutoff = Timestamp::from_millis(now.as_millis() - self.archive_threshold_millis);
        let candidates = self.warm.archive_candidates(cutoff, self.archive_batch)?;

        let mut stats = ArchiveStats {
            scanned: candidates.len(),
            ..Default::default()
        };

        for id in candidates {
            let Some(entry) = self.warm.get_entry(id)? else {
                continue;
            };
            if let Err(e) = self.cold.archive(&entry) {
                // Leave archived=false so the next pass retries
                warn!(id = %id, error = %e, "Cold archive failed; will retry");
                stats.failed += 1;
                continue;
            }
            self.warm.mark_archived(id)?;
            self.hot.invalidate(id);
            stats.archived += 1;
        }

        if stats.archived > 0 || stats.failed > 0 {
            info!(
                archived = stats.archived,
                failed = stats.failed,
                "Archive pass complete"
            );
        }
        Ok(stats)
    }

    /// Runs one expiry pass: hard-delete every row past its expiry.
    ///
    /// Returns `(id, domain)` pairs for the deleted rows so the caller
    /// can drop them from the per-domain similarity indexes.
    #[instrument(skip(self))]
    pub fn expiry_pass(&self, now: Timestamp) -> Result<Vec<(MemoryId, String)>> {
        let mut deleted = Vec::new();

        loop {
            let batch = self.warm.expired_ids(now, 256)?;
            if batch.is_empty() {
                break;
            }
            for id in batch {
                let domain = self.warm.get_entry(id)?.map(|e| e.domain);
                if self.delete_entry(id)? {
                    deleted.push((id, domain.unwrap_or_default()));
                }
            }
        }

        self.hot.purge_expired();

        if !deleted.is_empty() {
            debug!(count = deleted.len(), "Expiry pass deleted entries");
        }
        Ok(deleted)
    }
}
