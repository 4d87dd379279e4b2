//! Per-peer outbound queues with backpressure.
//!
//! Each peer owns one durable FIFO queue in the warm store: envelopes
//! survive restart and are removed only after a confirmed send. Above the
//! configured high-water mark the newest writes are dropped with a
//! warning - a slow peer never stalls the write path, and it can issue a
//! `sync_request` to catch up on what it missed.

use std::sync::Arc;

use tracing::warn;

use crate::error::Result;
use crate::sync::types::SyncEnvelope;
use crate::tier::WarmStore;
use crate::types::PeerId;

/// Handle to one peer's durable outbound queue.
pub struct PeerQueue {
    peer: PeerId,
    warm: Arc<WarmStore>,
    high_water: u64,
}

impl PeerQueue {
    /// Binds a queue handle for `peer` over the shared warm store.
    pub fn new(peer: PeerId, warm: Arc<WarmStore>, high_water: u64) -> Self {
        Self {
            peer,
            warm,
            high_water,
        }
    }

    /// Appends an envelope, unless the queue is at its high-water mark.
    ///
    /// Returns `true` if enqueued, `false` if dropped. The drop is
    /// surfaced only as a warning - never to the originating write
    /// caller.
    pub fn push(&self, envelope: &SyncEnvelope) -> Result<bool> {
        if self.warm.queue_depth(&self.peer) >= self.high_water {
            warn!(
                peer = %self.peer,
                envelope = %envelope.id,
                high_water = self.high_water,
                "Outbound queue at high-water mark; dropping newest envelope"
            );
            return Ok(false);
        }

        self.warm.enqueue_envelope(&self.peer, envelope)?;
        Ok(true)
    }

    /// Reads up to `n` envelopes from the head without removing them.
    pub fn next_batch(&self, n: usize) -> Result<Vec<(u64, SyncEnvelope)>> {
        self.warm.peek_queue(&self.peer, n)
    }

    /// Removes confirmed-sent entries. A failed send skips this call,
    /// which leaves the batch at the head for the next drain.
    pub fn ack(&self, seqs: &[u64]) -> Result<()> {
        self.warm.ack_queue(&self.peer, seqs)
    }

    /// Current queue depth.
    pub fn depth(&self) -> u64 {
        self.warm.queue_depth(&self.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::sync::types::{PayloadKind, SyncAction};
    use crate::types::{EnvelopeId, ServiceId, Timestamp};
    use tempfile::tempdir;

    fn envelope(n: u64) -> SyncEnvelope {
        SyncEnvelope {
            id: EnvelopeId::new(),
            kind: PayloadKind::Memory,
            action: SyncAction::Create,
            source: ServiceId::new("svc-a"),
            target: None,
            data: serde_json::json!({"n": n}),
            timestamp: Timestamp::now(),
            correlation_id: None,
        }
    }

    fn queue(dir: &tempfile::TempDir, high_water: u64) -> PeerQueue {
        let warm = Arc::new(
            WarmStore::open(dir.path().join("warm.db"), &Config::default()).unwrap(),
        );
        PeerQueue::new(PeerId::new("dspy"), warm, high_water)
    }

    #[test]
    fn test_fifo_order() {
        let dir = tempdir().unwrap();
        let q = queue(&dir, 100);

        for n in 0..5 {
            assert!(q.push(&envelope(n)).unwrap());
        }

        let batch = q.next_batch(3).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].1.data["n"], 0);
        assert_eq!(batch[2].1.data["n"], 2);
    }

    #[test]
    fn test_ack_advances_head() {
        let dir = tempdir().unwrap();
        let q = queue(&dir, 100);

        for n in 0..3 {
            q.push(&envelope(n)).unwrap();
        }

        let batch = q.next_batch(2).unwrap();
        let seqs: Vec<u64> = batch.iter().map(|(seq, _)| *seq).collect();
        q.ack(&seqs).unwrap();

        let next = q.next_batch(10).unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].1.data["n"], 2);
        assert_eq!(q.depth(), 1);
    }

    #[test]
    fn test_unacked_batch_stays_at_head() {
        let dir = tempdir().unwrap();
        let q = queue(&dir, 100);

        q.push(&envelope(0)).unwrap();
        q.push(&envelope(1)).unwrap();

        // Peek without ack (simulating a failed send)
        let first = q.next_batch(2).unwrap();
        let second = q.next_batch(2).unwrap();
        assert_eq!(first[0].0, second[0].0);
        assert_eq!(q.depth(), 2);
    }

    #[test]
    fn test_high_water_drops_newest() {
        let dir = tempdir().unwrap();
        let q = queue(&dir, 2);

        assert!(q.push(&envelope(0)).unwrap());
        assert!(q.push(&envelope(1)).unwrap());
        // At the mark: newest is dropped
        assert!(!q.push(&envelope(2)).unwrap());
        assert_eq!(q.depth(), 2);

        let batch = q.next_batch(10).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].1.data["n"], 1);
    }
}
