//! Contract to the external SFU engine.
//!
//! The orchestration layer never touches media bits; it drives the engine
//! through these traits and consumes its lifecycle events. A production
//! deployment binds them to the real SFU process; tests bind a mock.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine processed the request and said no (bad parameters,
    /// unsupported codec, unknown producer, ...).
    #[error("engine rejected request: {0}")]
    Rejected(String),

    /// The engine could not be reached or its process is gone.
    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransportId(Uuid);

impl TransportId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransportId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProducerId(Uuid);

impl ProducerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProducerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsumerId(Uuid);

impl ConsumerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConsumerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl TransportDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Recv => "recv",
        }
    }
}

/// Disjoint UDP port range assigned to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub port_range: PortRange,
}

/// Codec preferences handed to the engine at router creation. Opaque to
/// the orchestration layer.
#[derive(Debug, Clone, Default)]
pub struct RouterOptions {
    pub media_codecs: Value,
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub direction: TransportDirection,
}

/// Lifecycle events pushed by the engine. Consumed by a single event loop
/// in the signaling gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    WorkerDied { worker_id: WorkerId },
    TransportClosed { transport_id: TransportId },
    ProducerClosed { producer_id: ProducerId },
    ConsumerClosed { consumer_id: ConsumerId },
}

#[async_trait]
pub trait SfuEngine: Send + Sync {
    async fn create_worker(&self, opts: WorkerOptions) -> EngineResult<Arc<dyn SfuWorker>>;

    /// Hands over the engine's event stream. Single consumer; subsequent
    /// calls return `None`.
    fn take_events(&self) -> Option<UnboundedReceiver<EngineEvent>>;
}

#[async_trait]
pub trait SfuWorker: Send + Sync {
    fn id(&self) -> WorkerId;

    async fn create_router(&self, opts: RouterOptions) -> EngineResult<Arc<dyn SfuRouter>>;

    async fn close(&self);
}

#[async_trait]
pub trait SfuRouter: Send + Sync {
    /// Capability set clients need for capability negotiation.
    fn rtp_capabilities(&self) -> Value;

    async fn create_transport(&self, opts: TransportOptions) -> EngineResult<Arc<dyn SfuTransport>>;

    async fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &Value) -> bool;

    async fn close(&self);
}

#[async_trait]
pub trait SfuTransport: Send + Sync {
    fn id(&self) -> TransportId;

    /// ICE/DTLS parameter bundle the client needs to connect.
    fn parameters(&self) -> Value;

    async fn connect(&self, dtls_parameters: Value) -> EngineResult<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> EngineResult<Arc<dyn SfuProducer>>;

    async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: Value,
    ) -> EngineResult<Arc<dyn SfuConsumer>>;

    async fn close(&self);
}

#[async_trait]
pub trait SfuProducer: Send + Sync {
    fn id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    async fn close(&self);
}

#[async_trait]
pub trait SfuConsumer: Send + Sync {
    fn id(&self) -> ConsumerId;

    fn producer_id(&self) -> ProducerId;

    /// Consumer parameters (codec selection, RTP settings) for the client.
    fn parameters(&self) -> Value;

    async fn close(&self);
}
