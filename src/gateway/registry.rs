//! Live web client sessions and the non-blocking broadcast over them

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::types::ChatMessage;

/// Identifies one session for its lifetime
pub type SessionId = u64;

/// One connected client: the sending half of its outbound queue
#[derive(Debug)]
pub struct ClientSession {
    queue: mpsc::Sender<String>,
    pub remote: Option<SocketAddr>,
    pub connected_at: Instant,
}

/// Outcome of one broadcast across all sessions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Enqueued
    pub delivered: usize,
    /// Queue full; this session misses the message
    pub dropped: usize,
    /// Writer already gone; session is being torn down
    pub closed: usize,
}

/// Sessions keyed by id, behind one reader/writer lock.
///
/// Register and remove take the write lock. Broadcast takes the read lock
/// and only ever does `try_send` while holding it.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    sessions: RwLock<HashMap<SessionId, ClientSession>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session with a queue of `capacity` frames. The receiver is for
    /// the session's writer.
    pub fn register(
        &self,
        capacity: usize,
        remote: Option<SocketAddr>,
    ) -> (SessionId, mpsc::Receiver<String>) {
        let (queue, rx) = mpsc::channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.write().insert(
            id,
            ClientSession {
                queue,
                remote,
                connected_at: Instant::now(),
            },
        );
        debug!("Session {} registered ({:?})", id, remote);
        (id, rx)
    }

    /// Drop a session. Its writer sees the queue close once drained.
    pub fn remove(&self, id: SessionId) -> Option<ClientSession> {
        let session = self.sessions.write().remove(&id);
        if let Some(session) = &session {
            debug!(
                "Session {} removed after {:?}",
                id,
                session.connected_at.elapsed()
            );
        }
        session
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Serialize `msg` once and offer it to every session
    pub fn broadcast(&self, msg: &ChatMessage) -> BroadcastReport {
        match msg.to_json() {
            Ok(frame) => self.broadcast_frame(frame),
            Err(e) => {
                warn!("Failed to encode chat message: {}", e);
                BroadcastReport::default()
            }
        }
    }

    /// Offer a pre-encoded frame to every session without waiting on any of them
    pub fn broadcast_frame(&self, frame: String) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let sessions = self.sessions.read();

        for (id, session) in sessions.iter() {
            match session.queue.try_send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!("Session {} queue full, dropping message", id);
                    report.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => report.closed += 1,
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(text: &str) -> ChatMessage {
        ChatMessage::with_timestamp("abcdef", text, 1_700_000_000)
    }

    #[test]
    fn test_register_and_remove() {
        let registry = ClientRegistry::new();
        let (a, _rx_a) = registry.register(4, None);
        let (b, _rx_b) = registry.register(4, None);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(a).is_some());
        assert!(registry.remove(a).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_broadcast_to_empty_registry() {
        let registry = ClientRegistry::new();
        assert_eq!(registry.broadcast(&msg("hi")), BroadcastReport::default());
    }

    #[test]
    fn test_full_queue_does_not_block_others() {
        let registry = ClientRegistry::new();
        let (_stalled, _stalled_rx) = registry.register(2, None);
        let (_healthy, mut healthy_rx) = registry.register(8, None);

        // Fill the stalled session; nobody drains it
        for i in 0..2 {
            let report = registry.broadcast(&msg(&format!("fill {}", i)));
            assert_eq!(report.delivered, 2);
        }
        let _ = healthy_rx.try_recv();
        let _ = healthy_rx.try_recv();

        let report = registry.broadcast(&msg("after"));
        assert_eq!(
            report,
            BroadcastReport {
                delivered: 1,
                dropped: 1,
                closed: 0
            }
        );

        let frame = healthy_rx.try_recv().unwrap();
        assert_eq!(ChatMessage::from_slice(frame.as_bytes()).unwrap().text, "after");
    }

    #[test]
    fn test_queue_preserves_enqueue_order() {
        let registry = ClientRegistry::new();
        let (_id, mut rx) = registry.register(32, None);

        for i in 0..10 {
            registry.broadcast(&msg(&i.to_string()));
        }
        let received: Vec<String> = (0..10)
            .map(|_| ChatMessage::from_slice(rx.try_recv().unwrap().as_bytes()).unwrap().text)
            .collect();
        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn test_closed_writer_is_counted() {
        let registry = ClientRegistry::new();
        let (_id, rx) = registry.register(4, None);
        drop(rx);

        let report = registry.broadcast(&msg("hi"));
        assert_eq!(report.closed, 1);
        assert_eq!(report.delivered, 0);
    }

    #[test]
    fn test_every_session_gets_identical_frame() {
        let registry = ClientRegistry::new();
        let receivers: Vec<_> = (0..3).map(|_| registry.register(4, None).1).collect();

        registry.broadcast(&msg("same"));
        let frames: Vec<String> = receivers
            .into_iter()
            .map(|mut rx| rx.try_recv().unwrap())
            .collect();
        assert!(frames.iter().all(|f| f == &frames[0]));
        assert_eq!(frames[0], r#"{"from":"abcdef","text":"same","ts":1700000000}"#);
    }
}
