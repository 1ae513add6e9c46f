//! The signaling wire contract: a closed set of inbound client events and
//! outbound server events, matched exhaustively by the gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::engine::{ConsumerId, MediaKind, ProducerId, TransportDirection, TransportId};
use crate::error::{AppError, WireError};
use crate::services::participant::Role;
use crate::services::rooms::RoomId;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinStream {
        stream_id: Uuid,
        role: Role,
    },
    LeaveStream,
    CreateTransport {
        direction: TransportDirection,
    },
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: Value,
    },
    CreateProducer {
        kind: MediaKind,
        rtp_parameters: Value,
    },
    CreateConsumer {
        producer_id: ProducerId,
        rtp_capabilities: Value,
    },
    SendTip {
        amount: u64,
        #[serde(default)]
        note: Option<String>,
    },
    SendMessage {
        text: String,
    },
}

impl ClientEvent {
    /// Stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JoinStream { .. } => "join_stream",
            Self::LeaveStream => "leave_stream",
            Self::CreateTransport { .. } => "create_transport",
            Self::ConnectTransport { .. } => "connect_transport",
            Self::CreateProducer { .. } => "create_producer",
            Self::CreateConsumer { .. } => "create_consumer",
            Self::SendTip { .. } => "send_tip",
            Self::SendMessage { .. } => "send_message",
        }
    }
}

/// Inbound frame: an event plus an optional client correlation id echoed
/// back on the reply.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ClientRequest {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub event: ClientEvent,
}

/// Server-push events, broadcast to rooms or sent to one connection.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    UserJoined {
        stream_id: Uuid,
        user_id: Uuid,
        role: Role,
        viewer_count: u32,
    },
    UserLeft {
        stream_id: Uuid,
        user_id: Uuid,
        viewer_count: u32,
    },
    NewProducer {
        producer_id: ProducerId,
        user_id: Uuid,
        kind: MediaKind,
    },
    ProducerClosed {
        producer_id: ProducerId,
    },
    ConsumerClosed {
        consumer_id: ConsumerId,
    },
    TipReceived {
        stream_id: Uuid,
        from_user: Uuid,
        amount: u64,
        note: Option<String>,
        tip_id: Uuid,
    },
    MessageReceived {
        stream_id: Uuid,
        user_id: Uuid,
        text: String,
        sent_at: DateTime<Utc>,
    },
    StreamStarted {
        stream_id: Uuid,
    },
    StreamEnded {
        stream_id: Uuid,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinReply {
    pub room_id: RoomId,
    pub stream_id: Uuid,
    pub router_rtp_capabilities: Value,
    pub viewer_count: u32,
    pub performer_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransportReply {
    pub transport_id: TransportId,
    pub direction: TransportDirection,
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProducerReply {
    pub producer_id: ProducerId,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerReply {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct TipReply {
    pub tip_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ReplyBody {
    Join(JoinReply),
    Transport(TransportReply),
    Producer(ProducerReply),
    Consumer(ConsumerReply),
    Tip(TipReply),
    /// Plain acknowledgement; serializes as `null`.
    None,
}

/// Outbound reply frame for a `ClientRequest`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ReplyBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl ServerReply {
    pub fn success(id: Option<u64>, body: ReplyBody) -> Self {
        Self {
            id,
            ok: true,
            data: Some(body),
            error: None,
        }
    }

    pub fn failure(id: Option<u64>, err: &AppError) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(err.wire()),
        }
    }
}
