//! Signaling boundary: wire contract, connection registry, gateway and
//! the WebSocket endpoint.

pub mod gateway;
pub mod messages;
pub mod registry;
pub mod ws;

pub use gateway::{ConnContext, SignalingGateway};
pub use messages::{ClientEvent, ClientRequest, ReplyBody, ServerEvent, ServerReply};
pub use registry::{Broadcaster, ConnectionRegistry};
pub use ws::{SignalingState, WsParams};
