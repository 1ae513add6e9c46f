//! Connection registry: the push side of the signaling channel.
//!
//! Each WebSocket session registers an unbounded sender at upgrade time;
//! the gateway addresses pushes by connection id, with room membership
//! coming from the room registry (single source of truth). Injected as a
//! `Broadcaster` so any layer can push events without reaching into the
//! realtime stack.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    RwLock,
};

use crate::services::participant::ConnectionId;
use crate::signaling::messages::ServerEvent;

#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn send_to_many(&self, targets: &[ConnectionId], event: &ServerEvent);

    async fn send_to_one(&self, target: ConnectionId, event: &ServerEvent);
}

#[derive(Default, Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<ConnectionId, UnboundedSender<String>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection and returns the receiving half its session
    /// forwards to the socket.
    pub async fn register(&self, conn_id: ConnectionId) -> UnboundedReceiver<String> {
        let (tx, rx) = unbounded_channel();
        self.inner.write().await.insert(conn_id, tx);
        tracing::debug!(%conn_id, "connection registered");
        rx
    }

    /// Must be called when a connection closes; senders left behind would
    /// only be reaped lazily on the next failed push.
    pub async fn unregister(&self, conn_id: ConnectionId) {
        if self.inner.write().await.remove(&conn_id).is_some() {
            tracing::debug!(%conn_id, "connection unregistered");
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.len()
    }

    async fn push(&self, targets: &[ConnectionId], payload: &str) {
        let mut dead = Vec::new();
        {
            let connections = self.inner.read().await;
            for conn_id in targets {
                if let Some(sender) = connections.get(conn_id) {
                    if sender.send(payload.to_string()).is_err() {
                        dead.push(*conn_id);
                    }
                }
            }
        }
        if !dead.is_empty() {
            let mut connections = self.inner.write().await;
            for conn_id in &dead {
                connections.remove(conn_id);
            }
            tracing::debug!(count = dead.len(), "dead connections cleaned up");
        }
    }
}

#[async_trait]
impl Broadcaster for ConnectionRegistry {
    async fn send_to_many(&self, targets: &[ConnectionId], event: &ServerEvent) {
        if targets.is_empty() {
            return;
        }
        match serde_json::to_string(event) {
            Ok(payload) => self.push(targets, &payload).await,
            Err(err) => tracing::error!(error = %err, "failed to serialize server event"),
        }
    }

    async fn send_to_one(&self, target: ConnectionId, event: &ServerEvent) {
        self.send_to_many(&[target], event).await;
    }
}
