//! Peer connection management: state machine, sender task, reconnect.
//!
//! One sender task runs per configured peer. It dials the peer's
//! websocket endpoint, leads with the identify frame, then interleaves
//! two duties on the same connection:
//!
//! - draining the peer's durable queue in FIFO batches of at most
//!   [`SEND_BATCH`] envelopes, removing entries only after the whole
//!   batch went out;
//! - reading inbound frames (the transport is bidirectional) and
//!   dispatching them through the shared [`InboundDispatcher`], writing
//!   any replies straight back on the socket.
//!
//! On any transport failure the peer moves to `Error`, the unacked batch
//! stays at the head of the queue, and the task redials after an
//! exponentially growing delay (capped).

use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PeerConfig;
use crate::sync::fabric::InboundDispatcher;
use crate::sync::queue::PeerQueue;
use crate::sync::types::{Frame, IdentifyFrame, PeerState, PeerStatus};
use crate::types::Timestamp;

/// Maximum envelopes per outbound send batch.
pub const SEND_BATCH: usize = 10;

/// Backfill replies flush in chunks of this many frames.
pub const BACKFILL_BATCH: usize = 50;

/// Cadence and retry policy for a sender task.
#[derive(Clone, Copy, Debug)]
pub struct SenderSettings {
    /// Queue drain cadence while connected.
    pub sync_interval: Duration,

    /// Initial reconnect delay.
    pub retry_delay: Duration,

    /// Upper bound on the exponential reconnect delay.
    pub retry_delay_cap: Duration,
}

/// A configured peer: registry entry, queue handle, connection state.
pub struct PeerHandle {
    /// The peer's registry entry (endpoint, accepted domains/kinds).
    pub config: PeerConfig,

    queue: PeerQueue,
    state: RwLock<PeerState>,
    last_seen: RwLock<Option<Timestamp>>,
}

impl PeerHandle {
    /// Builds a handle from the registry entry and its durable queue.
    pub fn new(config: PeerConfig, queue: PeerQueue) -> Self {
        Self {
            config,
            queue,
            state: RwLock::new(PeerState::Disconnected),
            last_seen: RwLock::new(None),
        }
    }

    /// The peer's durable outbound queue.
    pub fn queue(&self) -> &PeerQueue {
        &self.queue
    }

    /// Current connection state.
    pub fn state(&self) -> PeerState {
        self.state.read().map(|s| *s).unwrap_or(PeerState::Error)
    }

    pub(crate) fn set_state(&self, state: PeerState) {
        if let Ok(mut current) = self.state.write() {
            if *current != state {
                debug!(peer = %self.config.id, from = ?*current, to = ?state, "Peer state");
                *current = state;
            }
        }
    }

    /// Records that any message arrived from the peer.
    pub(crate) fn touch_last_seen(&self) {
        if let Ok(mut last_seen) = self.last_seen.write() {
            *last_seen = Some(Timestamp::now());
        }
    }

    /// Point-in-time status for health surfaces.
    pub fn status(&self) -> PeerStatus {
        PeerStatus {
            peer_id: self.config.id.clone(),
            state: self.state(),
            last_seen: self.last_seen.read().ok().and_then(|l| *l),
            queue_depth: self.queue.depth(),
        }
    }
}

/// Runs the sender loop for one peer until cancellation.
pub(crate) async fn run_sender(
    handle: Arc<PeerHandle>,
    dispatcher: Arc<InboundDispatcher>,
    identity: IdentifyFrame,
    settings: SenderSettings,
    cancel: CancellationToken,
) {
    let mut backoff = settings.retry_delay;

    loop {
        if cancel.is_cancelled() {
            handle.set_state(PeerState::Disconnected);
            return;
        }

        handle.set_state(PeerState::Connecting);
        let connected = tokio::select! {
            _ = cancel.cancelled() => {
                handle.set_state(PeerState::Disconnected);
                return;
            }
            result = connect_async(handle.config.endpoint.as_str()) => result,
        };

        let mut ws = match connected {
            Ok((ws, _)) => ws,
            Err(e) => {
                warn!(peer = %handle.config.id, error = %e, "Dial failed");
                handle.set_state(PeerState::Error);
                if wait_backoff(&handle, &cancel, &mut backoff, settings).await {
                    return;
                }
                continue;
            }
        };

        // Identify must be the first frame on a new connection
        let identify = Frame::Identify(identity.clone()).to_text();
        if let Err(e) = ws.send(Message::Text(identify.into())).await {
            warn!(peer = %handle.config.id, error = %e, "Identify send failed");
            handle.set_state(PeerState::Error);
            if wait_backoff(&handle, &cancel, &mut backoff, settings).await {
                return;
            }
            continue;
        }

        info!(peer = %handle.config.id, "Peer connected");
        handle.set_state(PeerState::Connected);
        backoff = settings.retry_delay;

        let (mut writer, mut reader) = ws.split();
        let mut ticker = tokio::time::interval(settings.sync_interval);

        'connection: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = writer.close().await;
                    handle.set_state(PeerState::Disconnected);
                    return;
                }

                inbound = reader.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            handle.touch_last_seen();
                            let replies = match Frame::parse(text.as_ref()) {
                                Ok(Frame::Envelope(envelope)) => dispatcher.handle(envelope),
                                Ok(Frame::Identify(frame)) => {
                                    debug!(peer = %frame.service_id, "Peer identified on dialed connection");
                                    Vec::new()
                                }
                                Err(e) => {
                                    warn!(peer = %handle.config.id, error = %e, "Dropping malformed frame");
                                    Vec::new()
                                }
                            };
                            for chunk in replies.chunks(BACKFILL_BATCH) {
                                for reply in chunk {
                                    let text = Frame::Envelope(reply.clone()).to_text();
                                    if writer.send(Message::Text(text.into())).await.is_err() {
                                        break 'connection;
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => {
                            handle.touch_last_seen();
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(peer = %handle.config.id, "Connection closed by peer");
                            break 'connection;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(peer = %handle.config.id, error = %e, "Read failed");
                            break 'connection;
                        }
                    }
                }

                _ = ticker.tick() => {
                    let batch = match handle.queue().next_batch(SEND_BATCH) {
                        Ok(batch) => batch,
                        Err(e) => {
                            warn!(peer = %handle.config.id, error = %e, "Queue read failed");
                            continue;
                        }
                    };
                    if batch.is_empty() {
                        continue;
                    }

                    let mut sent = Vec::with_capacity(batch.len());
                    let mut failed = false;
                    for (seq, envelope) in &batch {
                        let text = Frame::Envelope(envelope.clone()).to_text();
                        if writer.send(Message::Text(text.into())).await.is_err() {
                            failed = true;
                            break;
                        }
                        sent.push(*seq);
                    }

                    if failed {
                        // Nothing is acked: the whole batch stays at the
                        // head of the queue for the next connection
                        warn!(peer = %handle.config.id, "Batch send failed; requeued");
                        break 'connection;
                    }

                    if let Err(e) = handle.queue().ack(&sent) {
                        warn!(peer = %handle.config.id, error = %e, "Queue ack failed");
                    }
                }
            }
        }

        handle.set_state(PeerState::Error);
        if wait_backoff(&handle, &cancel, &mut backoff, settings).await {
            return;
        }
    }
}

/// Sleeps through the current backoff, advances the exponential delay,
/// and parks the peer at Disconnected. Returns `true` if cancelled - the
/// caller's task must exit.
async fn wait_backoff(
    handle: &PeerHandle,
    cancel: &CancellationToken,
    backoff: &mut Duration,
    settings: SenderSettings,
) -> bool {
    let cancelled = tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(*backoff) => false,
    };
    *backoff = (*backoff * 2).min(settings.retry_delay_cap);
    handle.set_state(PeerState::Disconnected);
    cancelled
}
