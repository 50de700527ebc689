//! Request registry (C2) and outbound buffer (C3).
//!
//! A `DashMap<messageId, PendingRequest>` correlation table resolved via
//! `oneshot`, with a `sweep(now)` entry point per spec.md §4.2 rather than
//! relying solely on a per-call `tokio::time::timeout`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;

use crate::error::{OcppError, TransportError};
use crate::support::ocpp_frame::OcppFrame;

/// Outcome of an outgoing request, resolved by `complete`/`fail`/sweep-timeout.
pub type RequestOutcome = Result<Value, RequestFailure>;

#[derive(Debug, Clone)]
pub enum RequestFailure {
    Ocpp(OcppError),
    Timeout,
    Canceled,
    /// Raised at the call site, never through the oneshot: the connection
    /// was down and the caller asked to skip buffering (spec.md §4.4 step 3).
    NotConnected,
}

struct RegistryEntry {
    command_name: String,
    deadline: Instant,
    resolver: oneshot::Sender<RequestOutcome>,
}

/// In-flight request table keyed by message-id, with per-entry timeout.
pub struct RequestRegistry {
    entries: DashMap<String, RegistryEntry>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register a new in-flight request. Fails with `DuplicateId` if the
    /// message-id is already present.
    pub fn register(
        &self,
        message_id: &str,
        command_name: &str,
        deadline: Instant,
    ) -> Result<oneshot::Receiver<RequestOutcome>, TransportError> {
        if self.entries.contains_key(message_id) {
            return Err(TransportError::DuplicateId(message_id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            message_id.to_string(),
            RegistryEntry {
                command_name: command_name.to_string(),
                deadline,
                resolver: tx,
            },
        );
        Ok(rx)
    }

    /// Resolve a registered request with a CALLRESULT payload. An absent id
    /// is logged but never crashes the dispatcher (spec.md §4.2).
    pub fn complete(&self, message_id: &str, payload: Value) {
        match self.entries.remove(message_id) {
            Some((_, entry)) => {
                let _ = entry.resolver.send(Ok(payload));
            }
            None => warn!(message_id, "complete() for unknown response id"),
        }
    }

    /// Resolve a registered request with a CALLERROR.
    pub fn fail(&self, message_id: &str, error: OcppError) {
        match self.entries.remove(message_id) {
            Some((_, entry)) => {
                let _ = entry.resolver.send(Err(RequestFailure::Ocpp(error)));
            }
            None => warn!(message_id, "fail() for unknown response id"),
        }
    }

    /// Fail every in-flight entry with `Canceled` (station stop, spec.md §5).
    pub fn cancel_all(&self) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, entry)) = self.entries.remove(&id) {
                let _ = entry.resolver.send(Err(RequestFailure::Canceled));
            }
        }
    }

    /// Fail every entry whose deadline has passed with `Timeout`. Invoked on
    /// a ticker and whenever a message is received (spec.md §4.2).
    pub fn sweep(&self, now: Instant) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.deadline <= now)
            .map(|e| e.key().clone())
            .collect();
        for id in expired {
            if let Some((_, entry)) = self.entries.remove(&id) {
                warn!(
                    message_id = id.as_str(),
                    command = entry.command_name.as_str(),
                    "request timed out"
                );
                let _ = entry.resolver.send(Err(RequestFailure::Timeout));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A frame parked while the connection is not open.
pub struct OutboundBufferEntry {
    pub frame: OcppFrame,
    pub enqueued_at: Instant,
}

/// Ordered queue of pending frames, drained FIFO on (re)connect (C3).
pub struct OutboundBuffer {
    queue: VecDeque<OutboundBufferEntry>,
}

impl OutboundBuffer {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    pub fn push_back(&mut self, frame: OcppFrame) {
        self.queue.push_back(OutboundBufferEntry {
            frame,
            enqueued_at: Instant::now(),
        });
    }

    /// Re-enqueue at the head (a send failed but the registry entry, if
    /// any, has not yet expired).
    pub fn push_front(&mut self, entry: OutboundBufferEntry) {
        self.queue.push_front(entry);
    }

    pub fn pop_front(&mut self) -> Option<OutboundBufferEntry> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

impl Default for OutboundBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic message-id-free counter retained for diagnostics (actual
/// message ids are UUIDv4, generated at the call site per spec.md §4.4).
pub struct CallCounter(AtomicU64);

impl CallCounter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for CallCounter {
    fn default() -> Self {
        Self::new()
    }
}

pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn register_then_complete_resolves_receiver() {
        let registry = RequestRegistry::new();
        let rx = registry
            .register("m1", "Heartbeat", Instant::now() + Duration::from_secs(1))
            .unwrap();
        registry.complete("m1", serde_json::json!({"currentTime": "now"}));
        let outcome = rx.await.unwrap();
        assert!(outcome.is_ok());
    }

    #[test]
    fn duplicate_register_is_rejected() {
        let registry = RequestRegistry::new();
        let _rx = registry
            .register("m1", "Heartbeat", Instant::now() + Duration::from_secs(1))
            .unwrap();
        let second = registry.register("m1", "Heartbeat", Instant::now());
        assert!(matches!(second, Err(TransportError::DuplicateId(_))));
    }

    #[tokio::test]
    async fn sweep_times_out_expired_entries() {
        let registry = RequestRegistry::new();
        let rx = registry
            .register("m1", "Heartbeat", Instant::now())
            .unwrap();
        registry.sweep(Instant::now() + Duration::from_millis(1));
        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, Err(RequestFailure::Timeout)));
    }

    #[tokio::test]
    async fn cancel_all_fails_every_entry() {
        let registry = RequestRegistry::new();
        let rx1 = registry
            .register("m1", "Heartbeat", Instant::now() + Duration::from_secs(5))
            .unwrap();
        let rx2 = registry
            .register("m2", "Heartbeat", Instant::now() + Duration::from_secs(5))
            .unwrap();
        registry.cancel_all();
        assert!(matches!(rx1.await.unwrap(), Err(RequestFailure::Canceled)));
        assert!(matches!(rx2.await.unwrap(), Err(RequestFailure::Canceled)));
    }

    #[test]
    fn outbound_buffer_is_fifo() {
        let mut buf = OutboundBuffer::new();
        buf.push_back(OcppFrame::Call {
            unique_id: "a".into(),
            action: "Heartbeat".into(),
            payload: serde_json::json!({}),
        });
        buf.push_back(OcppFrame::Call {
            unique_id: "b".into(),
            action: "Heartbeat".into(),
            payload: serde_json::json!({}),
        });
        let first = buf.pop_front().unwrap();
        assert_eq!(first.frame.unique_id(), "a");
        let second = buf.pop_front().unwrap();
        assert_eq!(second.frame.unique_id(), "b");
        assert!(buf.is_empty());
    }
}
