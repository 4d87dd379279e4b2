//! Cross-service replication fabric.
//!
//! Replicates memory entries and learning events to configured peers in
//! near-real-time over bidirectional websocket connections, with per-peer
//! durable FIFO queues, reconnect with capped exponential backoff, an
//! identify-first frame protocol, and a backfill path for peers that
//! request history.
//!
//! Consistency model: at-least-once delivery with idempotent application.
//! Envelope ids deduplicate at the receiver; entry versions and event ids
//! make redundant applies no-ops. FIFO holds per (peer, queue); there is
//! no ordering across peers.

pub mod fabric;
pub mod peer;
pub mod queue;
pub mod types;

pub use fabric::{InboundDispatcher, SyncFabric};
pub use peer::{PeerHandle, SenderSettings, BACKFILL_BATCH, SEND_BATCH};
pub use queue::PeerQueue;
pub use types::{
    decode_memory_payload, encode_memory_payload, Frame, IdentifyFrame, PayloadKind, PeerState,
    PeerStatus, SyncAction, SyncEnvelope,
};
