//! Wire types for the sync fabric.
//!
//! The unit of replication is the [`SyncEnvelope`]. On the wire, frames are
//! JSON text messages over a bidirectional websocket: the first frame on any
//! new connection must be an [`IdentifyFrame`]; every subsequent frame is an
//! envelope. Acks and errors are envelopes whose action is
//! [`SyncAction::Ack`] / [`SyncAction::Error`], referencing the original
//! envelope through `correlation_id`.

use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::memory::MemoryEntry;
use crate::types::{EnvelopeId, ServiceId, Timestamp};

// ============================================================================
// PayloadKind / SyncAction
// ============================================================================

/// What kind of payload an envelope carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    /// A memory entry replication.
    Memory,
    /// A learning event replication.
    Learning,
    /// A model artifact notification (passed through to subscribers).
    Model,
    /// A configuration change notification (passed through to subscribers).
    Configuration,
}

impl PayloadKind {
    /// Returns the canonical lowercase name used on the wire.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Learning => "learning",
            Self::Model => "model",
            Self::Configuration => "configuration",
        }
    }
}

/// What the receiver should do with an envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    /// Apply a new record.
    Create,
    /// Apply an updated record (idempotent by id and version).
    Update,
    /// Remove a record.
    Delete,
    /// Request a backfill of history since `data.since`.
    SyncRequest,
    /// Acknowledge successful application of `correlation_id`.
    Ack,
    /// Report failed application of `correlation_id`; reason in `data`.
    Error,
}

// ============================================================================
// SyncEnvelope
// ============================================================================

/// The unit of cross-service replication.
///
/// Envelope ids are the idempotency key: the receiving core records every
/// applied id and treats redelivery as a no-op.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncEnvelope {
    /// Unique envelope identifier.
    pub id: EnvelopeId,

    /// Payload kind, serialized as `type` on the wire.
    #[serde(rename = "type")]
    pub kind: PayloadKind,

    /// Action to take at the receiver.
    pub action: SyncAction,

    /// The originating service.
    pub source: ServiceId,

    /// Optional target service (backfills and acks are addressed; broadcast
    /// replication is not).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target: Option<ServiceId>,

    /// Opaque payload. Shape depends on `kind` and `action`.
    pub data: serde_json::Value,

    /// Origination instant, RFC3339 on the wire.
    #[serde(with = "rfc3339")]
    pub timestamp: Timestamp,

    /// Correlation id linking acks/errors to the envelope they answer.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<String>,
}

impl SyncEnvelope {
    /// Builds an ack envelope answering `original`, targeted at its source.
    pub fn ack_for(original: &SyncEnvelope, source: ServiceId) -> Self {
        Self {
            id: EnvelopeId::new(),
            kind: original.kind,
            action: SyncAction::Ack,
            source,
            target: Some(original.source.clone()),
            data: serde_json::Value::Null,
            timestamp: Timestamp::now(),
            correlation_id: Some(original.id.to_string()),
        }
    }

    /// Builds an error envelope answering `original` with a reason string.
    pub fn error_for(original: &SyncEnvelope, source: ServiceId, reason: &str) -> Self {
        Self {
            id: EnvelopeId::new(),
            kind: original.kind,
            action: SyncAction::Error,
            source,
            target: Some(original.source.clone()),
            data: serde_json::json!({ "reason": reason }),
            timestamp: Timestamp::now(),
            correlation_id: Some(original.id.to_string()),
        }
    }

    /// Builds a sync request asking `target` for history since `since`.
    pub fn sync_request(
        source: ServiceId,
        target: ServiceId,
        kind: PayloadKind,
        since: Timestamp,
    ) -> Self {
        Self {
            id: EnvelopeId::new(),
            kind,
            action: SyncAction::SyncRequest,
            source,
            target: Some(target),
            data: serde_json::json!({ "since": since.to_rfc3339() }),
            timestamp: Timestamp::now(),
            correlation_id: None,
        }
    }

    /// Extracts the `since` instant from a sync request's data.
    pub fn since(&self) -> Option<Timestamp> {
        self.data
            .get("since")
            .and_then(|v| v.as_str())
            .and_then(Timestamp::from_rfc3339)
    }
}

// ============================================================================
// Memory payload codec
// ============================================================================

/// Encodes a memory entry (plus its embedding, which the entry's own serde
/// representation omits) into an envelope data payload.
pub fn encode_memory_payload(entry: &MemoryEntry) -> serde_json::Value {
    entry.to_json_full()
}

/// Decodes an envelope data payload back into a memory entry, restoring
/// the embedding.
pub fn decode_memory_payload(data: &serde_json::Value) -> Result<MemoryEntry, TransportError> {
    MemoryEntry::from_json_full(data)
        .ok_or_else(|| TransportError::malformed("invalid memory payload"))
}

// ============================================================================
// Frames
// ============================================================================

/// The identify handshake frame. Must be the first frame on a connection;
/// envelopes received before it are discarded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentifyFrame {
    /// The sending service's identity.
    pub service_id: ServiceId,

    /// Capability strings the sender declares (payload kinds it accepts).
    pub capabilities: Vec<String>,
}

/// A parsed wire frame.
#[derive(Clone, Debug)]
pub enum Frame {
    /// The connection handshake.
    Identify(IdentifyFrame),
    /// A replication envelope (including acks, errors, sync requests).
    Envelope(SyncEnvelope),
}

impl Frame {
    /// Parses a wire text message into a frame.
    ///
    /// Frames are discriminated by their `type` field: `"identify"` for the
    /// handshake, a payload kind name for envelopes.
    pub fn parse(text: &str) -> Result<Self, TransportError> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| TransportError::malformed(format!("invalid JSON: {}", e)))?;

        let frame_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| TransportError::malformed("frame missing 'type'"))?;

        if frame_type == "identify" {
            let identify: IdentifyFrame = serde_json::from_value(value)
                .map_err(|e| TransportError::malformed(format!("invalid identify: {}", e)))?;
            return Ok(Self::Identify(identify));
        }

        let envelope: SyncEnvelope = serde_json::from_value(value)
            .map_err(|e| TransportError::malformed(format!("invalid envelope: {}", e)))?;
        Ok(Self::Envelope(envelope))
    }

    /// Renders the frame as a wire text message.
    pub fn to_text(&self) -> String {
        match self {
            Self::Identify(identify) => {
                let mut value = serde_json::to_value(identify).unwrap_or_default();
                if let Some(map) = value.as_object_mut() {
                    map.insert("type".to_string(), serde_json::json!("identify"));
                }
                value.to_string()
            }
            Self::Envelope(envelope) => {
                serde_json::to_string(envelope).unwrap_or_default()
            }
        }
    }
}

// ============================================================================
// Peer connection state
// ============================================================================

/// Connection state of a configured peer.
///
/// Transitions: Disconnected → Connecting (on startup/retry); Connecting →
/// Connected (identify handshake sent); Connected → Error (transport or
/// send failure); Error → Disconnected (after the retry delay); any →
/// Disconnected (on shutdown).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    /// Not connected; initial and post-backoff state.
    #[default]
    Disconnected,
    /// Dial in progress.
    Connecting,
    /// Identify sent; envelopes are flowing.
    Connected,
    /// A transport failure occurred; awaiting the retry delay.
    Error,
}

/// Point-in-time status of a peer, surfaced by health checks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerStatus {
    /// The peer's id.
    pub peer_id: crate::types::PeerId,

    /// Current connection state.
    pub state: PeerState,

    /// Last instant any message arrived from the peer.
    pub last_seen: Option<Timestamp>,

    /// Depth of the durable outbound queue.
    pub queue_depth: u64,
}

// ============================================================================
// RFC3339 serde for Timestamp fields
// ============================================================================

/// Serde adapter rendering [`Timestamp`] fields as RFC3339 strings.
pub(crate) mod rfc3339 {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::types::Timestamp;

    pub fn serialize<S: Serializer>(ts: &Timestamp, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Timestamp, D::Error> {
        let text = String::deserialize(deserializer)?;
        Timestamp::from_rfc3339(&text)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid RFC3339 instant: {}", text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_envelope() -> SyncEnvelope {
        SyncEnvelope {
            id: EnvelopeId::new(),
            kind: PayloadKind::Memory,
            action: SyncAction::Create,
            source: ServiceId::new("svc-a"),
            target: None,
            data: serde_json::json!({"k": 1}),
            timestamp: Timestamp::from_millis(1_700_000_000_000),
            correlation_id: None,
        }
    }

    #[test]
    fn test_envelope_wire_roundtrip() {
        let envelope = test_envelope();
        let text = serde_json::to_string(&envelope).unwrap();
        let restored: SyncEnvelope = serde_json::from_str(&text).unwrap();

        assert_eq!(restored.id, envelope.id);
        assert_eq!(restored.kind, envelope.kind);
        assert_eq!(restored.timestamp, envelope.timestamp);
    }

    #[test]
    fn test_envelope_wire_uses_type_and_rfc3339() {
        let envelope = test_envelope();
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&envelope).unwrap()).unwrap();

        assert_eq!(value["type"], "memory");
        assert_eq!(value["action"], "create");
        // RFC3339, not raw millis
        assert!(value["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_ack_references_original() {
        let original = test_envelope();
        let ack = SyncEnvelope::ack_for(&original, ServiceId::new("svc-b"));

        assert_eq!(ack.action, SyncAction::Ack);
        assert_eq!(ack.target.as_ref(), Some(&original.source));
        assert_eq!(ack.correlation_id.as_deref(), Some(original.id.to_string().as_str()));
    }

    #[test]
    fn test_error_carries_reason() {
        let original = test_envelope();
        let err = SyncEnvelope::error_for(&original, ServiceId::new("svc-b"), "bad payload");

        assert_eq!(err.action, SyncAction::Error);
        assert_eq!(err.data["reason"], "bad payload");
    }

    #[test]
    fn test_sync_request_since_roundtrip() {
        let since = Timestamp::from_millis(1_690_000_000_000);
        let request = SyncEnvelope::sync_request(
            ServiceId::new("svc-a"),
            ServiceId::new("svc-b"),
            PayloadKind::Learning,
            since,
        );

        assert_eq!(request.action, SyncAction::SyncRequest);
        assert_eq!(request.since(), Some(since));
    }

    #[test]
    fn test_frame_parse_identify() {
        let text = r#"{"type":"identify","service_id":"svc-a","capabilities":["memory","learning"]}"#;
        match Frame::parse(text).unwrap() {
            Frame::Identify(identify) => {
                assert_eq!(identify.service_id.as_str(), "svc-a");
                assert_eq!(identify.capabilities.len(), 2);
            }
            Frame::Envelope(_) => panic!("expected identify frame"),
        }
    }

    #[test]
    fn test_frame_parse_envelope() {
        let text = Frame::Envelope(test_envelope()).to_text();
        match Frame::parse(&text).unwrap() {
            Frame::Envelope(envelope) => assert_eq!(envelope.kind, PayloadKind::Memory),
            Frame::Identify(_) => panic!("expected envelope frame"),
        }
    }

    #[test]
    fn test_frame_parse_rejects_untyped() {
        assert!(Frame::parse(r#"{"id":"x"}"#).is_err());
        assert!(Frame::parse("not json").is_err());
    }

    #[test]
    fn test_identify_to_text_has_type() {
        let frame = Frame::Identify(IdentifyFrame {
            service_id: ServiceId::new("svc-a"),
            capabilities: vec!["memory".into()],
        });
        let value: serde_json::Value = serde_json::from_str(&frame.to_text()).unwrap();
        assert_eq!(value["type"], "identify");
    }

    #[test]
    fn test_memory_payload_roundtrip_restores_embedding() {
        use crate::memory::{MemoryKind, NewMemoryEntry};
        use crate::types::{AgentId, MemoryId};

        let new = NewMemoryEntry {
            service_id: ServiceId::new("svc-a"),
            agent_id: AgentId::new("agent-1"),
            domain: "legal".into(),
            kind: MemoryKind::Semantic,
            payload: serde_json::json!({"k": 1}),
            embedding: Some(vec![0.5, 0.25, 0.25]),
            ..Default::default()
        };
        let entry = MemoryEntry {
            id: MemoryId::new(),
            service_id: new.service_id,
            agent_id: new.agent_id,
            domain: new.domain,
            kind: new.kind,
            payload: new.payload,
            created_at: Timestamp::now(),
            version: 1,
            tags: Default::default(),
            correlation_id: None,
            session_id: None,
            user_id: None,
            importance: 5.0,
            access_count: 0,
            last_accessed: Timestamp::now(),
            expires_at: None,
            embedding: new.embedding,
            related_ids: Default::default(),
            cause_id: None,
            effect_ids: Default::default(),
            archived: false,
        };

        let data = encode_memory_payload(&entry);
        let restored = decode_memory_payload(&data).unwrap();

        assert_eq!(restored.id, entry.id);
        assert_eq!(restored.embedding, entry.embedding);
        assert_eq!(restored.payload, entry.payload);
    }

    #[test]
    fn test_peer_state_default() {
        assert_eq!(PeerState::default(), PeerState::Disconnected);
    }
}
