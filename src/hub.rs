use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::events::EngineEvent;

/// Fan-out of committed events to independently paced subscribers.
///
/// Every subscriber has its own cursor over a bounded ring. A subscriber
/// that falls more than the buffer capacity behind loses its oldest
/// unseen events (counted, logged, and surfaced on the subscriber) while
/// every other subscriber is unaffected; publishers never block.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventHub {
    pub fn new(subscriber_buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(subscriber_buffer);
        Self { tx }
    }

    /// Publish one committed event. Returns the number of subscribers that
    /// will observe it; an event published with no subscribers is gone.
    pub fn publish(&self, event: EngineEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> HubSubscriber {
        HubSubscriber {
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One subscriber cursor.
pub struct HubSubscriber {
    rx: broadcast::Receiver<EngineEvent>,
    dropped: u64,
}

impl HubSubscriber {
    /// Next event in publish order. `None` once the hub shuts down and the
    /// buffer is drained. Overflow is absorbed here: the oldest unseen
    /// events are skipped and counted, never redelivered out of order.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.dropped += skipped;
                    warn!("Hub subscriber lagged; dropped {} oldest events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Hub closed");
                    return None;
                }
            }
        }
    }

    /// Non-blocking variant; `None` when no event is ready.
    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    self.dropped += skipped;
                    warn!("Hub subscriber lagged; dropped {} oldest events", skipped);
                }
                Err(_) => return None,
            }
        }
    }

    /// Total events this subscriber has lost to backpressure.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
