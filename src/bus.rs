//! In-process event bus connecting the write paths to the sync fabric
//! and the insight pipeline.
//!
//! Fan-out is per-subscriber bounded channels: a publish clones the event
//! into every subscriber's queue with `try_send`, so one slow or failed
//! subscriber never blocks the publishing caller or its sibling
//! subscribers. Delivery is best-effort within the process - durability
//! beyond this point belongs to the sync fabric's queues.
//!
//! Ordering: FIFO per subscriber with respect to the publisher's ordering
//! of publish calls. No cross-subscriber ordering.

use std::panic::AssertUnwindSafe;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::insight::Insight;
use crate::learning::LearningEvent;
use crate::memory::MemoryEntry;
use crate::sync::SyncEnvelope;

/// Topic name for stored memory entries.
pub const TOPIC_MEMORY_STORED: &str = "memory.stored";
/// Topic name for recorded learning events.
pub const TOPIC_LEARNING_RECORDED: &str = "learning.recorded";
/// Topic name for generated insights.
pub const TOPIC_INSIGHT_CREATED: &str = "insight.created";
/// Topic name for inbound model/configuration envelopes passed through
/// to subscribers outside the core.
pub const TOPIC_SYNC_PASSTHROUGH: &str = "sync.passthrough";

/// An event on the process-internal bus.
#[derive(Clone, Debug)]
pub enum BusEvent {
    /// A memory entry was written through the local write path.
    ///
    /// Carries the full entry (embedding included) so the sync fabric can
    /// replicate without a re-read. Not emitted for entries applied from
    /// the inbound sync path - that would loop.
    MemoryStored(MemoryEntry),

    /// A learning event was recorded through the local write path.
    LearningRecorded(LearningEvent),

    /// The insight generator persisted a finding.
    InsightCreated(Insight),

    /// An inbound `model` / `configuration` envelope for subscribers
    /// outside the core.
    SyncPassThrough(SyncEnvelope),
}

impl BusEvent {
    /// Returns the topic this event belongs to.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::MemoryStored(_) => TOPIC_MEMORY_STORED,
            Self::LearningRecorded(_) => TOPIC_LEARNING_RECORDED,
            Self::InsightCreated(_) => TOPIC_INSIGHT_CREATED,
            Self::SyncPassThrough(_) => TOPIC_SYNC_PASSTHROUGH,
        }
    }
}

/// One registered subscriber.
struct Subscriber {
    name: String,
    sender: mpsc::Sender<BusEvent>,
}

/// Process-internal fan-out bus.
///
/// `Send + Sync`; construct once per core and share by reference.
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a subscriber and returns its receiving end.
    ///
    /// The caller drains the channel from its own task; dropping the
    /// receiver unsubscribes (the dead sender is pruned on the next
    /// publish).
    pub fn subscribe(&self, name: &str, capacity: usize) -> mpsc::Receiver<BusEvent> {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(Subscriber {
                name: name.to_string(),
                sender,
            });
        }
        debug!(subscriber = name, "Bus subscriber registered");
        receiver
    }

    /// Registers a handler invoked from its own task for every event.
    ///
    /// Handler panics are caught and logged; a panicking subscriber keeps
    /// receiving subsequent events. Requires a tokio runtime.
    pub fn subscribe_fn<F>(&self, name: &str, capacity: usize, handler: F)
    where
        F: Fn(BusEvent) + Send + Sync + 'static,
    {
        let mut receiver = self.subscribe(name, capacity);
        let task_name = name.to_string();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(event)));
                if result.is_err() {
                    warn!(subscriber = %task_name, "Bus handler panicked; continuing");
                }
            }
        });
    }

    /// Publishes an event to every live subscriber.
    ///
    /// Never blocks and never fails the caller: a full subscriber queue
    /// drops that subscriber's copy with a warning, and closed
    /// subscribers are pruned.
    pub fn publish(&self, event: BusEvent) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            warn!("Bus subscriber list poisoned; dropping event");
            return;
        };

        subscribers.retain(|subscriber| {
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        subscriber = %subscriber.name,
                        topic = event.topic(),
                        "Subscriber queue full; dropping event copy"
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(subscriber = %subscriber.name, "Pruning closed subscriber");
                    false
                }
            }
        });
    }

    /// Returns the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insight::{InsightType, MetricSnapshot, Severity};
    use crate::types::{InsightId, Timestamp};

    fn insight_event() -> BusEvent {
        BusEvent::InsightCreated(Insight {
            id: InsightId::new(),
            domain: "support".into(),
            insight_type: InsightType::Anomaly,
            severity: Severity::High,
            title: "t".into(),
            description: "d".into(),
            metrics: MetricSnapshot::default(),
            recommendations: vec![],
            created_at: Timestamp::now(),
        })
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe("a", 8);
        let mut rx2 = bus.subscribe("b", 8);

        bus.publish(insight_event());

        assert!(matches!(rx1.recv().await, Some(BusEvent::InsightCreated(_))));
        assert!(matches!(rx2.recv().await, Some(BusEvent::InsightCreated(_))));
    }

    #[tokio::test]
    async fn test_fifo_per_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("ordered", 8);

        for _ in 0..3 {
            bus.publish(insight_event());
        }

        let mut seen = 0;
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.topic(), TOPIC_INSIGHT_CREATED);
            seen += 1;
        }
        assert_eq!(seen, 3);
    }

    #[tokio::test]
    async fn test_full_subscriber_drops_copy_without_blocking() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("slow", 1);

        bus.publish(insight_event());
        bus.publish(insight_event()); // dropped: queue full

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        // Subscriber survives the overflow
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_subscriber_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe("gone", 1);
        drop(rx);

        bus.publish(insight_event());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_handler_panic_is_isolated() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);

        bus.subscribe_fn("flaky", 8, move |_| {
            if seen_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first event hurts");
            }
        });

        bus.publish(insight_event());
        bus.publish(insight_event());

        // Give the drain task time to process both
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
