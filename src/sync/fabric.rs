//! The sync fabric: outbound fan-out, inbound dispatch, backfill.
//!
//! # Outbound
//!
//! A bus drain task turns locally stored entries and recorded events into
//! envelopes. For each configured peer whose accepted domains and kinds
//! match, the envelope lands on that peer's durable queue (FIFO, drained
//! by the peer's sender task). Every outbound envelope is also published
//! on the process-wide broadcast channel.
//!
//! # Inbound
//!
//! Envelopes arrive on dialed connections and on the accept loop alike;
//! both routes go through [`InboundDispatcher::handle`]:
//!
//! 1. Frames from our own service id are rejected (loop guard).
//! 2. Envelope ids already applied are acked without side effects.
//! 3. `memory` / `learning` payloads apply through the same idempotent
//!    write paths as local writes, without re-publishing on the bus.
//! 4. `model` / `configuration` payloads pass through on the bus.
//! 5. `sync_request` pages history since the requested instant back to
//!    the requester in batches of 50.
//!
//! Successful application answers with an `ack`, failure with an `error`
//! carrying the reason.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use futures_util::{SinkExt, StreamExt};

use crate::bus::{BusEvent, EventBus};
use crate::config::Config;
use crate::error::{MembraneError, Result};
use crate::learning::{EventFilter, LearningEvent, LearningLedger};
use crate::memory::{MemoryEngine, MemoryFilter};
use crate::sync::peer::{run_sender, PeerHandle, SenderSettings, BACKFILL_BATCH};
use crate::sync::queue::PeerQueue;
use crate::sync::types::{
    encode_memory_payload, Frame, IdentifyFrame, PayloadKind, PeerStatus, SyncAction, SyncEnvelope,
};
use crate::tier::WarmStore;
use crate::types::{PeerId, ServiceId, Timestamp};

/// Capacity of the fabric's bus subscription.
const BUS_QUEUE: usize = 1024;

/// Capacity of the process-wide broadcast channel.
const BROADCAST_CAPACITY: usize = 256;

/// Applies inbound envelopes to the local core.
///
/// Shared by every connection (dialed and accepted); owns no connection
/// state itself.
pub struct InboundDispatcher {
    service_id: ServiceId,
    warm: Arc<WarmStore>,
    memory: Arc<MemoryEngine>,
    ledger: Arc<LearningLedger>,
    bus: Arc<EventBus>,
}

impl InboundDispatcher {
    /// Builds the dispatcher over the core's write paths.
    pub fn new(
        service_id: ServiceId,
        warm: Arc<WarmStore>,
        memory: Arc<MemoryEngine>,
        ledger: Arc<LearningLedger>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            service_id,
            warm,
            memory,
            ledger,
            bus,
        }
    }

    /// Processes one inbound envelope, returning the frames to send back
    /// (ack/error, plus backfill pages for sync requests).
    #[instrument(skip(self, envelope), fields(id = %envelope.id, action = ?envelope.action))]
    pub fn handle(&self, envelope: SyncEnvelope) -> Vec<SyncEnvelope> {
        // Loop guard: never apply our own envelopes
        if envelope.source == self.service_id {
            debug!("Rejected own envelope (loop guard)");
            return Vec::new();
        }

        match envelope.action {
            SyncAction::Ack => {
                debug!(correlation = ?envelope.correlation_id, "Peer acked");
                Vec::new()
            }
            SyncAction::Error => {
                warn!(
                    correlation = ?envelope.correlation_id,
                    reason = %envelope.data.get("reason").and_then(|r| r.as_str()).unwrap_or("unknown"),
                    "Peer reported apply error"
                );
                Vec::new()
            }
            SyncAction::SyncRequest => self.backfill(&envelope),
            SyncAction::Create | SyncAction::Update | SyncAction::Delete => {
                match self.apply(&envelope) {
                    Ok(()) => vec![SyncEnvelope::ack_for(&envelope, self.service_id.clone())],
                    Err(e) => vec![SyncEnvelope::error_for(
                        &envelope,
                        self.service_id.clone(),
                        &e.to_string(),
                    )],
                }
            }
        }
    }

    /// Applies a create/update/delete envelope idempotently.
    fn apply(&self, envelope: &SyncEnvelope) -> Result<()> {
        // Envelope-id idempotency: a redelivery is a no-op
        if self.warm.is_applied(envelope.id)? {
            debug!("Duplicate envelope; acking without side effects");
            return Ok(());
        }

        match (envelope.kind, envelope.action) {
            (PayloadKind::Memory, SyncAction::Create | SyncAction::Update) => {
                let entry = crate::sync::types::decode_memory_payload(&envelope.data)?;
                let applied = self.memory.apply_replicated(entry)?;
                if !applied {
                    debug!("Replicated entry at or below local version; no-op");
                }
            }
            (PayloadKind::Memory, SyncAction::Delete) => {
                let id = envelope
                    .data
                    .get("id")
                    .and_then(|v| v.as_str())
                    .and_then(|s| uuid::Uuid::parse_str(s).ok())
                    .map(|u| crate::types::MemoryId(u))
                    .ok_or_else(|| MembraneError::internal("delete envelope missing id"))?;
                self.memory.delete(id)?;
            }
            (PayloadKind::Learning, SyncAction::Create | SyncAction::Update) => {
                let event: LearningEvent = serde_json::from_value(envelope.data.clone())
                    .map_err(|e| MembraneError::internal(format!("invalid learning payload: {}", e)))?;
                let applied = self.ledger.apply_replicated(event)?;
                if !applied {
                    debug!("Replicated event already recorded; no-op");
                }
            }
            (PayloadKind::Learning, SyncAction::Delete) => {
                return Err(MembraneError::conflict(
                    "learning events are immutable and cannot be deleted",
                ));
            }
            (PayloadKind::Model | PayloadKind::Configuration, _) => {
                // Not ours to apply; hand to subscribers outside the core
                self.bus.publish(BusEvent::SyncPassThrough(envelope.clone()));
            }
            // Routed before apply(); nothing to do if reached
            (_, SyncAction::SyncRequest | SyncAction::Ack | SyncAction::Error) => return Ok(()),
        }

        self.warm.mark_applied(envelope.id, Timestamp::now())?;
        Ok(())
    }

    /// Pages history since the requested instant back to the requester.
    ///
    /// One envelope per historical record, oldest first, with the request
    /// id as the correlation id; the transport flushes them in batches of
    /// [`BACKFILL_BATCH`]. The trailing ack marks completion.
    fn backfill(&self, request: &SyncEnvelope) -> Vec<SyncEnvelope> {
        let since = request.since().unwrap_or(Timestamp::from_millis(0));
        let domain = request
            .data
            .get("domain")
            .and_then(|d| d.as_str())
            .map(str::to_string);

        info!(
            requester = %request.source,
            kind = request.kind.as_str(),
            since = since.as_millis(),
            "Backfill requested"
        );

        let mut pages = match request.kind {
            PayloadKind::Learning => self.backfill_learning(request, since, domain),
            PayloadKind::Memory => self.backfill_memory(request, since, domain),
            PayloadKind::Model | PayloadKind::Configuration => Vec::new(),
        };

        pages.push(SyncEnvelope::ack_for(request, self.service_id.clone()));
        pages
    }

    fn backfill_learning(
        &self,
        request: &SyncEnvelope,
        since: Timestamp,
        domain: Option<String>,
    ) -> Vec<SyncEnvelope> {
        let filter = EventFilter {
            domain,
            since: Some(since),
            limit: crate::tier::schema::MAX_QUERY_LIMIT,
            ..Default::default()
        };
        let mut events = match self.ledger.history(&filter) {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "Learning backfill query failed");
                return Vec::new();
            }
        };
        // History is newest-first; backfills replay oldest-first
        events.reverse();

        events
            .into_iter()
            .map(|event| SyncEnvelope {
                id: crate::types::EnvelopeId::new(),
                kind: PayloadKind::Learning,
                action: SyncAction::Create,
                source: self.service_id.clone(),
                target: Some(request.source.clone()),
                data: serde_json::to_value(&event).unwrap_or_default(),
                timestamp: Timestamp::now(),
                correlation_id: Some(request.id.to_string()),
            })
            .collect()
    }

    fn backfill_memory(
        &self,
        request: &SyncEnvelope,
        since: Timestamp,
        domain: Option<String>,
    ) -> Vec<SyncEnvelope> {
        let filter = MemoryFilter {
            domain,
            since: Some(since),
            limit: crate::tier::schema::MAX_QUERY_LIMIT,
            ..Default::default()
        };
        let mut entries = match self.memory.query(&filter) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Memory backfill query failed");
                return Vec::new();
            }
        };
        entries.reverse();

        entries
            .into_iter()
            .map(|entry| SyncEnvelope {
                id: crate::types::EnvelopeId::new(),
                kind: PayloadKind::Memory,
                action: SyncAction::Create,
                source: self.service_id.clone(),
                target: Some(request.source.clone()),
                data: encode_memory_payload(&entry),
                timestamp: Timestamp::now(),
                correlation_id: Some(request.id.to_string()),
            })
            .collect()
    }
}

/// The sync fabric: peer registry, queues, senders, accept loop.
pub struct SyncFabric {
    config: Config,
    dispatcher: Arc<InboundDispatcher>,
    peers: HashMap<PeerId, Arc<PeerHandle>>,
    broadcast: broadcast::Sender<SyncEnvelope>,
    bus: Arc<EventBus>,
}

impl SyncFabric {
    /// Builds the fabric from the configured peer table.
    pub fn new(
        config: Config,
        warm: Arc<WarmStore>,
        memory: Arc<MemoryEngine>,
        ledger: Arc<LearningLedger>,
        bus: Arc<EventBus>,
    ) -> Self {
        let dispatcher = Arc::new(InboundDispatcher::new(
            config.service_id.clone(),
            Arc::clone(&warm),
            memory,
            ledger,
            Arc::clone(&bus),
        ));

        let mut peers = HashMap::new();
        for peer_config in &config.peers {
            let queue = PeerQueue::new(
                peer_config.id.clone(),
                Arc::clone(&warm),
                config.queue_high_water,
            );
            peers.insert(
                peer_config.id.clone(),
                Arc::new(PeerHandle::new(peer_config.clone(), queue)),
            );
        }

        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);

        Self {
            config,
            dispatcher,
            peers,
            broadcast,
            bus,
        }
    }

    /// The shared inbound dispatcher (exposed for accepted connections
    /// and tests).
    pub fn dispatcher(&self) -> Arc<InboundDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Looks up a configured peer.
    pub fn peer(&self, id: &PeerId) -> Option<Arc<PeerHandle>> {
        self.peers.get(id).cloned()
    }

    /// Point-in-time status of every configured peer.
    pub fn peer_statuses(&self) -> Vec<PeerStatus> {
        let mut statuses: Vec<PeerStatus> = self.peers.values().map(|p| p.status()).collect();
        statuses.sort_by(|a, b| a.peer_id.as_str().cmp(b.peer_id.as_str()));
        statuses
    }

    /// Subscribes to the process-wide broadcast of outbound envelopes.
    pub fn subscribe_broadcast(&self) -> broadcast::Receiver<SyncEnvelope> {
        self.broadcast.subscribe()
    }

    /// Fans an envelope out to every peer accepting its (domain, kind),
    /// and onto the broadcast channel.
    pub fn fan_out(&self, envelope: &SyncEnvelope, domain: &str) {
        for peer in self.peers.values() {
            if !peer.config.accepts(domain, envelope.kind) {
                continue;
            }
            match peer.queue().push(envelope) {
                Ok(true) => {}
                Ok(false) => {} // dropped at high-water; already logged
                Err(e) => {
                    warn!(peer = %peer.config.id, error = %e, "Enqueue failed");
                }
            }
        }

        // Broadcast is fire-and-forget; no receivers is fine
        let _ = self.broadcast.send(envelope.clone());
    }

    /// Builds and fans out the replication envelope for a stored entry.
    pub fn replicate_memory(&self, entry: &crate::memory::MemoryEntry) {
        let action = if entry.version > 1 {
            SyncAction::Update
        } else {
            SyncAction::Create
        };
        let envelope = SyncEnvelope {
            id: crate::types::EnvelopeId::new(),
            kind: PayloadKind::Memory,
            action,
            source: self.config.service_id.clone(),
            target: None,
            data: encode_memory_payload(entry),
            timestamp: Timestamp::now(),
            correlation_id: entry.correlation_id.clone(),
        };
        self.fan_out(&envelope, &entry.domain);
    }

    /// Builds and fans out the replication envelope for a recorded event.
    pub fn replicate_learning(&self, event: &LearningEvent) {
        let envelope = SyncEnvelope {
            id: crate::types::EnvelopeId::new(),
            kind: PayloadKind::Learning,
            action: SyncAction::Create,
            source: self.config.service_id.clone(),
            target: None,
            data: serde_json::to_value(event).unwrap_or_default(),
            timestamp: Timestamp::now(),
            correlation_id: None,
        };
        self.fan_out(&envelope, &event.domain);
    }

    /// Starts the fabric: one sender task per configured peer, plus the
    /// bus drain that feeds local writes into the queues.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) {
        let settings = SenderSettings {
            sync_interval: self.config.sync_interval,
            retry_delay: self.config.retry_delay,
            retry_delay_cap: self.config.retry_delay_cap,
        };
        let identity = self.identity();

        for peer in self.peers.values() {
            tokio::spawn(run_sender(
                Arc::clone(peer),
                self.dispatcher(),
                identity.clone(),
                settings,
                cancel.clone(),
            ));
        }

        info!(peers = self.peers.len(), "Sync fabric started");

        let mut events = self.bus.subscribe("sync-fabric", BUS_QUEUE);
        let fabric = self;
        let drain_cancel = cancel;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = drain_cancel.cancelled() => return,
                    event = events.recv() => match event {
                        Some(BusEvent::MemoryStored(entry)) => fabric.replicate_memory(&entry),
                        Some(BusEvent::LearningRecorded(learning)) => {
                            fabric.replicate_learning(&learning)
                        }
                        Some(_) => {}
                        None => return,
                    },
                }
            }
        });
    }

    /// Runs the accept loop for inbound peer connections.
    pub async fn serve_inbound(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        info!("Sync accept loop listening");
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    debug!(peer_addr = %addr, "Inbound sync connection");
                    let dispatcher = self.dispatcher();
                    let identity = self.identity();
                    let fabric = Arc::clone(&self);
                    let conn_cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_inbound_connection(dispatcher, fabric, identity, stream, conn_cancel)
                                .await
                        {
                            debug!(error = %e, "Inbound connection ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                }
            }
        }
    }

    fn identity(&self) -> IdentifyFrame {
        IdentifyFrame {
            service_id: self.config.service_id.clone(),
            capabilities: vec![
                "memory".to_string(),
                "learning".to_string(),
                "model".to_string(),
                "configuration".to_string(),
            ],
        }
    }
}

/// Serves one accepted connection: identify handshake, then envelope
/// dispatch with replies on the same socket.
async fn handle_inbound_connection(
    dispatcher: Arc<InboundDispatcher>,
    fabric: Arc<SyncFabric>,
    identity: IdentifyFrame,
    stream: tokio::net::TcpStream,
    cancel: CancellationToken,
) -> Result<()> {
    let ws = accept_async(stream)
        .await
        .map_err(|e| crate::error::TransportError::malformed(e.to_string()))?;
    let (mut writer, mut reader) = ws.split();

    writer
        .send(Message::Text(Frame::Identify(identity).to_text().into()))
        .await
        .map_err(|e| crate::error::TransportError::malformed(e.to_string()))?;

    let mut identified: Option<ServiceId> = None;

    loop {
        let inbound = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = writer.close().await;
                return Ok(());
            }
            inbound = reader.next() => inbound,
        };

        match inbound {
            Some(Ok(Message::Text(text))) => {
                match Frame::parse(text.as_ref()) {
                    Ok(Frame::Identify(frame)) => {
                        debug!(peer = %frame.service_id, "Inbound peer identified");
                        if let Some(peer) = fabric.peer(&PeerId::new(frame.service_id.as_str())) {
                            peer.touch_last_seen();
                        }
                        identified = Some(frame.service_id);
                    }
                    Ok(Frame::Envelope(envelope)) => {
                        // Identify must come first; early envelopes are discarded
                        let Some(ref peer_service) = identified else {
                            warn!(envelope = %envelope.id, "Envelope before identify; discarded");
                            continue;
                        };
                        if let Some(peer) = fabric.peer(&PeerId::new(peer_service.as_str())) {
                            peer.touch_last_seen();
                        }

                        let replies = dispatcher.handle(envelope);
                        for chunk in replies.chunks(BACKFILL_BATCH) {
                            for reply in chunk {
                                let text = Frame::Envelope(reply.clone()).to_text();
                                if writer.send(Message::Text(text.into())).await.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Dropping malformed inbound frame");
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                return Err(crate::error::TransportError::malformed(e.to_string()).into());
            }
        }
    }
}
