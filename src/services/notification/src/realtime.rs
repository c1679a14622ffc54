//! Real-time delivery hub
//!
//! The [`ConnectionRegistry`] maps a user id to at most one live connection.
//! Registering a second connection for the same user closes the first one
//! (last writer wins). The registry is the only place connections are added
//! or removed; sockets talk to it through [`ConnectionHandle`]s so the hub can
//! be exercised without a real WebSocket.

use crate::error::{NotificationError, Result};
use crate::metrics::NotificationMetrics;
use chrono::{DateTime, Utc};
use fileshare_shared::RealtimeMessage;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Frame queued for a connection's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Ping,
    Close,
}

struct Connection {
    id: Uuid,
    sender: mpsc::Sender<OutboundFrame>,
    closed: CancellationToken,
    connected_at: DateTime<Utc>,
}

impl Connection {
    fn close(&self) {
        self.closed.cancel();
        let _ = self.sender.try_send(OutboundFrame::Close);
    }
}

/// Socket side of a registered connection
pub struct ConnectionHandle {
    pub connection_id: Uuid,
    pub user_id: String,
    pub receiver: mpsc::Receiver<OutboundFrame>,
    /// Cancelled when the connection is superseded or the hub evicts it
    pub closed: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub user_id: String,
    pub connection_id: Uuid,
    sender: mpsc::Sender<OutboundFrame>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for `user_id`, closing any connection it replaces
    pub fn add(&self, user_id: &str, buffer: usize) -> ConnectionHandle {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let closed = CancellationToken::new();
        let connection = Connection {
            id: Uuid::new_v4(),
            sender,
            closed: closed.clone(),
            connected_at: Utc::now(),
        };
        let connection_id = connection.id;

        let superseded = self
            .connections
            .write()
            .insert(user_id.to_string(), connection);

        if let Some(previous) = superseded {
            info!(user_id, old_connection = %previous.id, new_connection = %connection_id, "Replacing existing real-time connection");
            previous.close();
        }

        ConnectionHandle {
            connection_id,
            user_id: user_id.to_string(),
            receiver,
            closed,
        }
    }

    /// Remove the user's connection if it is still `connection_id`
    pub fn remove(&self, user_id: &str, connection_id: Uuid) -> bool {
        let removed = {
            let mut connections = self.connections.write();
            match connections.get(user_id) {
                Some(current) if current.id == connection_id => connections.remove(user_id),
                _ => None,
            }
        };

        match removed {
            Some(connection) => {
                connection.close();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, user_id: &str) -> Option<ConnectionSnapshot> {
        self.connections
            .read()
            .get(user_id)
            .map(|connection| ConnectionSnapshot {
                user_id: user_id.to_string(),
                connection_id: connection.id,
                sender: connection.sender.clone(),
            })
    }

    /// Copy of every live connection, taken under the read lock
    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        self.connections
            .read()
            .iter()
            .map(|(user_id, connection)| ConnectionSnapshot {
                user_id: user_id.clone(),
                connection_id: connection.id,
                sender: connection.sender.clone(),
            })
            .collect()
    }

    pub fn connected_since(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.connections.read().get(user_id).map(|c| c.connected_at)
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.connections.read().contains_key(user_id)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub total_connections: u64,
    pub messages_sent: u64,
    pub evictions: u64,
}

pub struct RealtimeHub {
    registry: Arc<ConnectionRegistry>,
    buffer: usize,
    metrics: Arc<NotificationMetrics>,
    total_connections: AtomicU64,
    messages_sent: AtomicU64,
    evictions: AtomicU64,
}

impl RealtimeHub {
    pub fn new(registry: Arc<ConnectionRegistry>, buffer: usize, metrics: Arc<NotificationMetrics>) -> Self {
        Self {
            registry,
            buffer,
            metrics,
            total_connections: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn connect(&self, user_id: &str) -> ConnectionHandle {
        let handle = self.registry.add(user_id, self.buffer);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.metrics.set_realtime_connections(self.registry.len());
        handle
    }

    pub fn disconnect(&self, user_id: &str, connection_id: Uuid) {
        if self.registry.remove(user_id, connection_id) {
            debug!(user_id, %connection_id, "Real-time connection closed");
        }
        self.metrics.set_realtime_connections(self.registry.len());
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.registry.is_connected(user_id)
    }

    /// Push a message to one user. A user without a live connection is an
    /// immediate failure.
    pub fn send_to_user(&self, user_id: &str, message: &RealtimeMessage) -> Result<()> {
        let connection = self
            .registry
            .get(user_id)
            .ok_or_else(|| NotificationError::not_connected(user_id))?;

        let text = serde_json::to_string(message)?;
        self.deliver(&connection, OutboundFrame::Text(text))
    }

    /// Send to every live connection; connections whose write fails are evicted
    pub fn broadcast(&self, message: &RealtimeMessage) -> Result<BroadcastReport> {
        let text = serde_json::to_string(message)?;
        let mut report = BroadcastReport::default();

        for connection in self.registry.snapshot() {
            match self.deliver(&connection, OutboundFrame::Text(text.clone())) {
                Ok(()) => report.delivered += 1,
                Err(NotificationError::NotConnected { .. }) => report.evicted += 1,
                Err(e) => {
                    debug!(user_id = %connection.user_id, error = %e, "Skipped broadcast recipient");
                }
            }
        }

        info!(delivered = report.delivered, evicted = report.evicted, "Broadcast complete");
        Ok(report)
    }

    /// Queue a ping on every connection, evicting dead ones
    pub fn ping_all(&self) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for connection in self.registry.snapshot() {
            match self.deliver(&connection, OutboundFrame::Ping) {
                Ok(()) => report.delivered += 1,
                Err(NotificationError::NotConnected { .. }) => report.evicted += 1,
                Err(_) => {}
            }
        }
        report
    }

    fn deliver(&self, connection: &ConnectionSnapshot, frame: OutboundFrame) -> Result<()> {
        match connection.sender.try_send(frame) {
            Ok(()) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                warn!(user_id = %connection.user_id, "Real-time send buffer full");
                Err(NotificationError::websocket("send buffer full"))
            }
            Err(TrySendError::Closed(_)) => {
                warn!(user_id = %connection.user_id, connection_id = %connection.connection_id, "Evicting closed real-time connection");
                self.evictions.fetch_add(1, Ordering::Relaxed);
                self.disconnect(&connection.user_id, connection.connection_id);
                Err(NotificationError::not_connected(&connection.user_id))
            }
        }
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.registry.len(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsConfig;
    use fileshare_shared::RealtimeMessageType;
    use serde_json::json;

    fn hub() -> RealtimeHub {
        let metrics = Arc::new(NotificationMetrics::new(&MetricsConfig::default()).unwrap());
        RealtimeHub::new(Arc::new(ConnectionRegistry::new()), 8, metrics)
    }

    fn message() -> RealtimeMessage {
        RealtimeMessage::notification(json!({"title": "hello"}))
    }

    #[tokio::test]
    async fn test_send_to_connected_user() {
        let hub = hub();
        let mut handle = hub.connect("u1");

        hub.send_to_user("u1", &message()).unwrap();

        match handle.receiver.recv().await {
            Some(OutboundFrame::Text(text)) => {
                let parsed: RealtimeMessage = serde_json::from_str(&text).unwrap();
                assert_eq!(parsed.message_type, RealtimeMessageType::Notification);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_to_absent_user_fails_immediately() {
        let hub = hub();
        let err = hub.send_to_user("nobody", &message()).unwrap_err();
        assert!(matches!(err, NotificationError::NotConnected { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_new_connection_replaces_old() {
        let hub = hub();
        let mut first = hub.connect("u1");
        let first_since = hub.registry().connected_since("u1").unwrap();
        let mut second = hub.connect("u1");

        assert!(first.closed.is_cancelled());
        assert!(hub.registry().connected_since("u1").unwrap() >= first_since);
        assert_eq!(first.receiver.recv().await, Some(OutboundFrame::Close));
        assert!(!second.closed.is_cancelled());
        assert_eq!(hub.registry().len(), 1);

        let report = hub.broadcast(&message()).unwrap();
        assert_eq!(report.delivered, 1);
        assert!(matches!(second.receiver.recv().await, Some(OutboundFrame::Text(_))));
        assert!(first.receiver.try_recv().is_err());

        // the superseded socket's cleanup must not drop the new connection
        hub.disconnect("u1", first.connection_id);
        assert!(hub.is_connected("u1"));
    }

    #[tokio::test]
    async fn test_broadcast_evicts_dead_connections() {
        let hub = hub();
        let _alive = hub.connect("u1");
        let dead = hub.connect("u2");
        drop(dead);

        let report = hub.broadcast(&message()).unwrap();
        assert_eq!(report, BroadcastReport { delivered: 1, evicted: 1 });
        assert!(!hub.is_connected("u2"));
        assert_eq!(hub.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_ping_all() {
        let hub = hub();
        let mut handle = hub.connect("u1");
        let report = hub.ping_all();
        assert_eq!(report.delivered, 1);
        assert_eq!(handle.receiver.recv().await, Some(OutboundFrame::Ping));
    }
}
