//! Stream-room orchestration layer for the live tipping platform.
//!
//! Control plane in front of the WebRTC SFU engine: worker placement and
//! load tracking, room and participant lifecycle, transport/producer/
//! consumer bookkeeping, connection and message rate limiting, and batched
//! viewer-count aggregation. Media itself never passes through this crate;
//! the engine, stream catalog, wallet and chat services are injected
//! behind traits.

pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod persistence;
pub mod services;
pub mod signaling;

pub use config::Config;
pub use error::{AppError, AppResult};

/// Installs the standard `tracing` subscriber. Called once by the
/// deployment binary before anything else.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .init();
}
