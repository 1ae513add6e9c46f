//! Orchestration services:
//! - worker pool and load-balanced placement
//! - room registry and lifecycle
//! - participant sessions and media bookkeeping
//! - connection/message admission control
//! - batched viewer-count aggregation

pub mod participant;
pub mod rate_limit;
pub mod rooms;
pub mod tasks;
pub mod viewer_count;
pub mod worker_pool;

pub use participant::{ConnectionId, MediaTeardown, ParticipantSession, Role};
pub use rate_limit::{ConnectionGate, FixedWindowLimiter};
pub use rooms::{JoinSnapshot, LeaveSnapshot, Room, RoomId, RoomLifecycle, RoomRegistry};
pub use tasks::PeriodicTask;
pub use viewer_count::ViewerCountAggregator;
pub use worker_pool::WorkerPool;
