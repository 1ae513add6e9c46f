//! Ports to the external persistence and ledger collaborators.
//!
//! The orchestration layer never owns schema: stream metadata, viewer
//! counts, tips and chat history all live behind these traits.

pub mod http_sink;
pub mod postgres;
pub mod redis_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppResult;

pub use http_sink::HttpEventSink;
pub use postgres::PgStreamDirectory;
pub use redis_store::RedisViewerCountStore;

/// What the gateway needs to know about a stream before admitting joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRoute {
    pub host_user_id: Uuid,
    pub live: bool,
}

/// Stream metadata lookup, consulted on every join.
#[async_trait]
pub trait StreamDirectory: Send + Sync {
    async fn stream_route(&self, stream_id: Uuid) -> AppResult<Option<StreamRoute>>;
}

/// Flush target of the viewer-count aggregator: one net update per stream
/// per flush interval.
#[async_trait]
pub trait ViewerCountStore: Send + Sync {
    async fn apply_viewer_delta(&self, stream_id: Uuid, delta: i64) -> AppResult<()>;
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TipRecord {
    pub stream_id: Uuid,
    pub from_user: Uuid,
    pub amount: u64,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TipReceipt {
    pub tip_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRecord {
    pub stream_id: Uuid,
    pub user_id: Uuid,
    pub message: String,
    pub sent_at: DateTime<Utc>,
}

/// Delegation point for the financial ledger and chat history. The core
/// only triggers these writes and rebroadcasts their results; balances and
/// persistence are entirely the external services' business.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn tip_sent(&self, tip: &TipRecord) -> AppResult<TipReceipt>;

    async fn chat_message(&self, chat: &ChatRecord) -> AppResult<()>;
}
