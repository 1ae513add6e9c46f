//! Redis-backed viewer-count store: the flush target of the aggregator.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use super::ViewerCountStore;
use crate::error::{AppError, AppResult};

fn viewer_key(stream_id: Uuid) -> String {
    format!("orchestrator:viewers:{stream_id}")
}

#[derive(Clone)]
pub struct RedisViewerCountStore {
    conn: ConnectionManager,
}

impl RedisViewerCountStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(redis_url: &str) -> AppResult<Self> {
        let client = redis::Client::open(redis_url).map_err(|err| {
            tracing::error!(error = %err, "invalid redis url");
            AppError::Config("invalid REDIS_URL".into())
        })?;
        let conn = client.get_tokio_connection_manager().await.map_err(|err| {
            tracing::error!(error = %err, "failed to connect redis viewer-count store");
            AppError::Config("redis connection failed".into())
        })?;
        Ok(Self::new(conn))
    }
}

#[async_trait]
impl ViewerCountStore for RedisViewerCountStore {
    async fn apply_viewer_delta(&self, stream_id: Uuid, delta: i64) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let count: i64 = redis::cmd("INCRBY")
            .arg(viewer_key(stream_id))
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(|err| {
                tracing::warn!(%stream_id, delta, error = %err, "viewer count update failed");
                AppError::Internal
            })?;

        // Leaves racing a flush of stale joins can briefly push the stored
        // count negative; clamp rather than propagate nonsense.
        if count < 0 {
            let _: Result<(), _> = redis::cmd("SET")
                .arg(viewer_key(stream_id))
                .arg(0)
                .query_async(&mut conn)
                .await;
        }
        Ok(())
    }
}
