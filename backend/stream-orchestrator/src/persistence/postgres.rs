//! Postgres-backed stream directory.
//!
//! Read-only: the stream catalog is owned by the platform's CRUD services;
//! this lookup only answers "who hosts this stream and is it live" for
//! join admission.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{StreamDirectory, StreamRoute};
use crate::error::{AppError, AppResult};

pub struct PgStreamDirectory {
    pool: PgPool,
}

impl PgStreamDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> AppResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "failed to connect stream directory database");
                AppError::Config("database connection failed".into())
            })?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl StreamDirectory for PgStreamDirectory {
    async fn stream_route(&self, stream_id: Uuid) -> AppResult<Option<StreamRoute>> {
        let row = sqlx::query("SELECT creator_id, status FROM streams WHERE id = $1")
            .bind(stream_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| {
                tracing::error!(%stream_id, error = %err, "stream directory query failed");
                AppError::Internal
            })?;

        row.map(|row| {
            let host_user_id: Uuid = row.try_get("creator_id").map_err(|err| {
                tracing::error!(%stream_id, error = %err, "stream row missing creator_id");
                AppError::Internal
            })?;
            let status: String = row.try_get("status").map_err(|err| {
                tracing::error!(%stream_id, error = %err, "stream row missing status");
                AppError::Internal
            })?;
            Ok(StreamRoute {
                host_user_id,
                live: status == "live",
            })
        })
        .transpose()
    }
}
