//! # Broadcast Hub
//!
//! The `BroadcastHub` owns the registry of connected streaming clients and is the
//! single fan-out point between an ingestor (broker subscriber or synthetic
//! generator) and every client session.
//!
//! ## Core Design Principles:
//!
//! 1.  **Shared Payloads**: A `TelemetryPayload` is an `Arc<str>`. Fan-out clones
//!     the pointer, never the text.
//!
//! 2.  **Snapshot Fan-out**: `publish` copies the registry under the lock and sends
//!     without holding it, so sessions can register and unregister while a
//!     broadcast is in flight.
//!
//! 3.  **Bounded Sends**: Every client owns a bounded channel. A send waits at most
//!     the hub's `send_timeout`, and all sends of one publish run concurrently, so a
//!     stalled client costs the others at most one timeout.
//!
//! 4.  **Immediate Pruning**: A client whose send fails (session gone or timed out)
//!     is removed before `publish` returns. That is an expected disconnect, not an
//!     error.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

use crate::core::payload::TelemetryPayload;

/// Unique identity of one streaming connection. Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// # Client Handle
///
/// The hub's view of one connected client: its id, the peer it came from (for
/// logs), and the sending half of the channel drained by the client's session task.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    peer: String,
    sender: mpsc::Sender<TelemetryPayload>,
}

impl ClientHandle {
    /// Builds a handle plus the receiver its session will drain.
    pub fn channel(
        id: ClientId,
        peer: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<TelemetryPayload>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id,
            peer: peer.into(),
            sender,
        };
        (handle, receiver)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

/// Outcome of one `publish` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Handles present in the snapshot.
    pub attempted: usize,
    /// Handles that accepted the payload.
    pub delivered: usize,
    /// Handles removed because their send failed.
    pub pruned: usize,
}

/// # Broadcast Hub
///
/// Registry plus fan-out. All registry access goes through these methods.
pub struct BroadcastHub {
    clients: Mutex<HashMap<ClientId, ClientHandle>>,
    next_id: AtomicU64,
    send_timeout: Duration,
}

impl BroadcastHub {
    /// Creates an empty hub whose per-client sends give up after `send_timeout`.
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            send_timeout,
        }
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Hands out the next unique client id.
    pub fn next_client_id(&self) -> ClientId {
        ClientId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// # Register
    ///
    /// Adds `handle` to the registry. Registering an id that is already present
    /// keeps the existing handle. Returns `true` when the handle was newly added.
    pub fn register(&self, handle: ClientHandle) -> bool {
        let mut clients = self.lock_clients();
        if clients.contains_key(&handle.id) {
            return false;
        }
        log::info!("{} ({}) registered", handle.id, handle.peer);
        clients.insert(handle.id, handle);
        log::debug!("Active clients: {}", clients.len());
        true
    }

    /// Removes the client if present. Returns `true` when something was removed.
    pub fn unregister(&self, id: ClientId) -> bool {
        let mut clients = self.lock_clients();
        match clients.remove(&id) {
            Some(handle) => {
                log::info!(
                    "{} ({}) unregistered. Active clients: {}",
                    id,
                    handle.peer,
                    clients.len()
                );
                true
            }
            None => false,
        }
    }

    /// # Publish
    ///
    /// Delivers `payload` to every client registered at the moment of the call.
    ///
    /// ## Logic:
    /// 1.  Snapshot the registry and release the lock.
    /// 2.  Send to every snapshotted client concurrently, each bounded by
    ///     `send_timeout`.
    /// 3.  Remove every client whose send failed, then report the counts.
    pub async fn publish(&self, payload: TelemetryPayload) -> PublishReport {
        let snapshot: Vec<ClientHandle> = self.lock_clients().values().cloned().collect();
        if snapshot.is_empty() {
            log::trace!("No clients connected, payload of {} bytes dropped", payload.len());
            return PublishReport::default();
        }

        let timeout = self.send_timeout;
        let outcomes = join_all(snapshot.iter().map(|handle| {
            let payload = payload.clone();
            async move { (handle, handle.sender.send_timeout(payload, timeout).await) }
        }))
        .await;

        let mut report = PublishReport {
            attempted: snapshot.len(),
            ..PublishReport::default()
        };
        let mut failed = Vec::new();
        for (handle, outcome) in outcomes {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(SendTimeoutError::Timeout(_)) => {
                    log::warn!(
                        "{} ({}) did not accept a payload within {:?}. Dropping client.",
                        handle.id,
                        handle.peer,
                        timeout
                    );
                    failed.push(handle.id);
                }
                Err(SendTimeoutError::Closed(_)) => {
                    log::info!("{} ({}) disconnected. Removing from hub.", handle.id, handle.peer);
                    failed.push(handle.id);
                }
            }
        }

        if !failed.is_empty() {
            let mut clients = self.lock_clients();
            for id in failed {
                if clients.remove(&id).is_some() {
                    report.pruned += 1;
                }
            }
        }

        log::trace!(
            "Broadcast: attempted={} delivered={} pruned={}",
            report.attempted,
            report.delivered,
            report.pruned
        );
        report
    }

    /// Number of registered clients.
    pub fn client_count(&self) -> usize {
        self.lock_clients().len()
    }

    pub fn is_registered(&self, id: ClientId) -> bool {
        self.lock_clients().contains_key(&id)
    }

    // The registry holds no invariant a panicking holder could break halfway.
    fn lock_clients(&self) -> MutexGuard<'_, HashMap<ClientId, ClientHandle>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn payload(text: &str) -> TelemetryPayload {
        TelemetryPayload::from_text(text).unwrap()
    }

    fn connect(hub: &BroadcastHub, capacity: usize) -> (ClientId, mpsc::Receiver<TelemetryPayload>) {
        let id = hub.next_client_id();
        let (handle, rx) = ClientHandle::channel(id, "127.0.0.1:9", capacity);
        assert!(hub.register(handle));
        (id, rx)
    }

    #[tokio::test]
    async fn test_publish_reaches_every_registered_client() {
        let hub = BroadcastHub::new(Duration::from_millis(200));
        let mut receivers: Vec<_> = (0..5).map(|_| connect(&hub, 8).1).collect();

        let report = hub.publish(payload(r#"{"Moisture":55}"#)).await;

        assert_eq!(report, PublishReport { attempted: 5, delivered: 5, pruned: 0 });
        for rx in receivers.iter_mut() {
            assert_eq!(rx.try_recv().unwrap().as_str(), r#"{"Moisture":55}"#);
        }
    }

    #[tokio::test]
    async fn test_failed_client_is_pruned_and_skipped_afterwards() {
        let hub = BroadcastHub::new(Duration::from_millis(200));
        let (alive, mut alive_rx) = connect(&hub, 8);
        let (gone, gone_rx) = connect(&hub, 8);
        drop(gone_rx);

        let first = hub.publish(payload("1")).await;
        assert_eq!(first.pruned, 1);
        assert!(!hub.is_registered(gone));
        assert!(hub.is_registered(alive));

        let second = hub.publish(payload("2")).await;
        assert_eq!(second.attempted, 1);
        assert_eq!(alive_rx.try_recv().unwrap().as_str(), "1");
        assert_eq!(alive_rx.try_recv().unwrap().as_str(), "2");
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let hub = BroadcastHub::new(Duration::from_millis(200));
        let id = hub.next_client_id();
        let (first, mut first_rx) = ClientHandle::channel(id, "a", 4);
        let (second, _second_rx) = ClientHandle::channel(id, "a", 4);

        assert!(hub.register(first));
        assert!(!hub.register(second));
        assert_eq!(hub.client_count(), 1);

        // The first handle stays in place.
        hub.publish(payload("true")).await;
        assert_eq!(first_rx.try_recv().unwrap().as_str(), "true");
    }

    #[tokio::test]
    async fn test_unregister_twice_and_after_prune_is_harmless() {
        let hub = BroadcastHub::new(Duration::from_millis(200));
        let (id, rx) = connect(&hub, 4);

        assert!(hub.unregister(id));
        assert!(!hub.unregister(id));

        let (pruned, pruned_rx) = connect(&hub, 4);
        drop(rx);
        drop(pruned_rx);
        hub.publish(payload("null")).await;
        assert!(!hub.unregister(pruned));
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_client_costs_at_most_one_timeout() {
        let timeout = Duration::from_millis(500);
        let hub = BroadcastHub::new(timeout);

        // Capacity 1 and never drained: the second publish finds it full.
        let (stalled, _stalled_rx) = connect(&hub, 1);
        let (_, mut healthy_rx) = connect(&hub, 8);
        hub.publish(payload("1")).await;

        let started = Instant::now();
        let report = hub.publish(payload("2")).await;
        let elapsed = started.elapsed();

        assert!(elapsed <= timeout + Duration::from_millis(50), "took {:?}", elapsed);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.pruned, 1);
        assert!(!hub.is_registered(stalled));
        assert_eq!(healthy_rx.try_recv().unwrap().as_str(), "1");
        assert_eq!(healthy_rx.try_recv().unwrap().as_str(), "2");
    }

    #[tokio::test]
    async fn test_publish_with_no_clients_is_a_no_op() {
        let hub = BroadcastHub::new(Duration::from_millis(200));
        assert_eq!(hub.publish(payload("{}")).await, PublishReport::default());
    }

    #[tokio::test]
    async fn test_concurrent_churn_keeps_registry_consistent() {
        let hub = std::sync::Arc::new(BroadcastHub::new(Duration::from_millis(100)));

        let publisher = {
            let hub = hub.clone();
            tokio::spawn(async move {
                for i in 0..50 {
                    hub.publish(payload(&i.to_string())).await;
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut sessions = Vec::new();
        for _ in 0..20 {
            let hub = hub.clone();
            sessions.push(tokio::spawn(async move {
                let (id, mut rx) = connect(&hub, 64);
                tokio::task::yield_now().await;
                while rx.try_recv().is_ok() {}
                hub.unregister(id);
            }));
        }

        publisher.await.unwrap();
        for session in sessions {
            session.await.unwrap();
        }
        assert_eq!(hub.client_count(), 0);
    }
}
