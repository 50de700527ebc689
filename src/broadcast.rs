//! Worker broadcast channel (C10): fans UI-server requests out to every
//! station worker and carries their responses back for aggregation.
//!
//! Built on `tokio::sync::broadcast` with lagged-receiver handling and
//! subscriber-count tracking, carrying an explicit `Request`/`Response`
//! envelope rather than an arity-sniffed payload.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 1024;

/// A message carried on the worker broadcast bus.
#[derive(Debug, Clone)]
pub enum BroadcastEnvelope {
    /// The control plane asking every (or one) station to run a procedure.
    Request {
        correlation_id: String,
        hash_ids: Option<Vec<String>>,
        procedure_name: String,
        payload: Value,
    },
    /// A station's answer to a `Request`.
    Response {
        correlation_id: String,
        hash_id: String,
        success: bool,
        payload: Value,
    },
}

impl BroadcastEnvelope {
    pub fn correlation_id(&self) -> &str {
        match self {
            Self::Request { correlation_id, .. } | Self::Response { correlation_id, .. } => correlation_id,
        }
    }
}

#[derive(Clone)]
pub struct WorkerBus {
    sender: broadcast::Sender<BroadcastEnvelope>,
    subscriber_count: Arc<AtomicUsize>,
}

impl WorkerBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscriber_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn publish(&self, envelope: BroadcastEnvelope) {
        match self.sender.send(envelope) {
            Ok(count) => debug!(subscribers = count, "broadcast envelope published"),
            Err(_) => debug!("broadcast envelope published (no subscribers)"),
        }
    }

    pub fn subscribe(&self) -> WorkerBusSubscriber {
        let receiver = self.sender.subscribe();
        self.subscriber_count.fetch_add(1, Ordering::SeqCst);
        WorkerBusSubscriber {
            receiver,
            subscriber_count: self.subscriber_count.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count.load(Ordering::SeqCst)
    }
}

impl Default for WorkerBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct WorkerBusSubscriber {
    receiver: broadcast::Receiver<BroadcastEnvelope>,
    subscriber_count: Arc<AtomicUsize>,
}

impl WorkerBusSubscriber {
    pub async fn recv(&mut self) -> Option<BroadcastEnvelope> {
        loop {
            match self.receiver.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    warn!(missed = count, "worker bus subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for WorkerBusSubscriber {
    fn drop(&mut self) {
        self.subscriber_count.fetch_sub(1, Ordering::SeqCst);
    }
}

pub type SharedWorkerBus = Arc<WorkerBus>;

pub fn create_worker_bus() -> SharedWorkerBus {
    Arc::new(WorkerBus::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscriber_receives_published_envelope() {
        let bus = WorkerBus::new();
        let mut sub = bus.subscribe();
        bus.publish(BroadcastEnvelope::Request {
            correlation_id: "c1".into(),
            hash_ids: None,
            procedure_name: "heartbeat".into(),
            payload: json!({}),
        });
        let received = sub.recv().await.unwrap();
        assert_eq!(received.correlation_id(), "c1");
    }

    #[test]
    fn subscriber_count_tracks_subscribe_and_drop() {
        let bus = WorkerBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
