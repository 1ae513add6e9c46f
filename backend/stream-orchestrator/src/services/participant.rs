//! Per-connection participant state: role, transports, producers,
//! consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::engine::{
    ConsumerId, ProducerId, SfuConsumer, SfuProducer, SfuTransport, TransportDirection, TransportId,
};

/// Identity of one signaling connection. A user reconnecting gets a fresh
/// one; all media bookkeeping is keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Performer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Performer => "performer",
        }
    }
}

pub struct ParticipantSession {
    pub conn_id: ConnectionId,
    pub user_id: Uuid,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    /// Serializes media operations for this participant. Held across
    /// engine calls, so it must never be taken under a room lock.
    op_lock: Arc<Mutex<()>>,
    send_transport: Option<Arc<dyn SfuTransport>>,
    recv_transport: Option<Arc<dyn SfuTransport>>,
    producers: HashMap<ProducerId, Arc<dyn SfuProducer>>,
    consumers: HashMap<ConsumerId, Arc<dyn SfuConsumer>>,
}

impl ParticipantSession {
    pub fn new(conn_id: ConnectionId, user_id: Uuid, role: Role) -> Self {
        Self {
            conn_id,
            user_id,
            role,
            joined_at: Utc::now(),
            op_lock: Arc::new(Mutex::new(())),
            send_transport: None,
            recv_transport: None,
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    pub fn op_lock(&self) -> Arc<Mutex<()>> {
        self.op_lock.clone()
    }

    pub fn transport(&self, direction: TransportDirection) -> Option<Arc<dyn SfuTransport>> {
        match direction {
            TransportDirection::Send => self.send_transport.clone(),
            TransportDirection::Recv => self.recv_transport.clone(),
        }
    }

    pub fn transport_by_id(&self, transport_id: TransportId) -> Option<Arc<dyn SfuTransport>> {
        [&self.send_transport, &self.recv_transport]
            .into_iter()
            .flatten()
            .find(|t| t.id() == transport_id)
            .cloned()
    }

    pub fn set_transport(&mut self, direction: TransportDirection, transport: Arc<dyn SfuTransport>) {
        match direction {
            TransportDirection::Send => self.send_transport = Some(transport),
            TransportDirection::Recv => self.recv_transport = Some(transport),
        }
    }

    /// Detaches the transport for a direction together with everything that
    /// was created over it (producers ride the send transport, consumers
    /// the recv transport). The caller closes the returned objects outside
    /// any room lock.
    pub fn take_transport(&mut self, direction: TransportDirection) -> Option<MediaTeardown> {
        let transport = match direction {
            TransportDirection::Send => self.send_transport.take(),
            TransportDirection::Recv => self.recv_transport.take(),
        }?;

        let mut teardown = MediaTeardown::default();
        match direction {
            TransportDirection::Send => {
                teardown.producers = self.producers.drain().map(|(_, p)| p).collect()
            }
            TransportDirection::Recv => {
                teardown.consumers = self.consumers.drain().map(|(_, c)| c).collect()
            }
        }
        teardown.transports.push(transport);
        Some(teardown)
    }

    /// Like `take_transport`, but looked up by id. Returns the direction
    /// the transport was attached to.
    pub fn take_transport_by_id(
        &mut self,
        transport_id: TransportId,
    ) -> Option<(TransportDirection, MediaTeardown)> {
        let direction = if self.send_transport.as_ref().map(|t| t.id()) == Some(transport_id) {
            TransportDirection::Send
        } else if self.recv_transport.as_ref().map(|t| t.id()) == Some(transport_id) {
            TransportDirection::Recv
        } else {
            return None;
        };
        self.take_transport(direction).map(|t| (direction, t))
    }

    pub fn add_producer(&mut self, producer: Arc<dyn SfuProducer>) {
        self.producers.insert(producer.id(), producer);
    }

    pub fn remove_producer(&mut self, producer_id: ProducerId) -> Option<Arc<dyn SfuProducer>> {
        self.producers.remove(&producer_id)
    }

    pub fn add_consumer(&mut self, consumer: Arc<dyn SfuConsumer>) {
        self.consumers.insert(consumer.id(), consumer);
    }

    pub fn remove_consumer(&mut self, consumer_id: ConsumerId) -> Option<Arc<dyn SfuConsumer>> {
        self.consumers.remove(&consumer_id)
    }

    pub fn producer_ids(&self) -> Vec<ProducerId> {
        self.producers.keys().copied().collect()
    }

    pub fn consumer_ids(&self) -> Vec<ConsumerId> {
        self.consumers.keys().copied().collect()
    }

    /// Detaches every media object the participant owns, for the
    /// leave/disconnect cascade.
    pub fn drain_media(&mut self) -> MediaTeardown {
        MediaTeardown {
            transports: self
                .send_transport
                .take()
                .into_iter()
                .chain(self.recv_transport.take())
                .collect(),
            producers: self.producers.drain().map(|(_, p)| p).collect(),
            consumers: self.consumers.drain().map(|(_, c)| c).collect(),
        }
    }
}

/// Media objects detached from a session, pending engine close. Closing a
/// transport cascades engine-side closure of everything created over it;
/// producers and consumers are still closed explicitly because close is
/// idempotent and a leave must not depend on engine-side cascade timing.
#[derive(Default)]
pub struct MediaTeardown {
    pub transports: Vec<Arc<dyn SfuTransport>>,
    pub producers: Vec<Arc<dyn SfuProducer>>,
    pub consumers: Vec<Arc<dyn SfuConsumer>>,
}

impl MediaTeardown {
    pub fn is_empty(&self) -> bool {
        self.transports.is_empty() && self.producers.is_empty() && self.consumers.is_empty()
    }

    pub async fn close_all(self) {
        for consumer in self.consumers {
            consumer.close().await;
        }
        for producer in self.producers {
            producer.close().await;
        }
        for transport in self.transports {
            transport.close().await;
        }
    }
}
