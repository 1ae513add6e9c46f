//! WebSocket endpoint for the signaling channel.
//!
//! Upgrade flow: rate-limit admission -> connection registration ->
//! actor start. Inbound frames are parsed into the closed `ClientRequest`
//! union and dispatched to the gateway; pushes arrive through the
//! connection registry and are forwarded to the socket.

use actix::{Actor, ActorContext, ActorFutureExt, AsyncContext, Handler, Message as ActixMessage, StreamHandler, WrapFuture};
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::AppError;
use crate::metrics;
use crate::services::participant::ConnectionId;
use crate::signaling::gateway::{ConnContext, SignalingGateway};
use crate::signaling::messages::{ClientRequest, ServerReply};
use crate::signaling::registry::ConnectionRegistry;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state for the WebSocket route.
#[derive(Clone)]
pub struct SignalingState {
    pub gateway: Arc<SignalingGateway>,
    pub registry: ConnectionRegistry,
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    /// Authenticated upstream by the API gateway; trusted here.
    pub user_id: Uuid,
}

#[derive(ActixMessage)]
#[rtype(result = "()")]
struct Push(String);

pub struct SignalingSession {
    ctx: ConnContext,
    gateway: Arc<SignalingGateway>,
    registry: ConnectionRegistry,
    hb: Instant,
}

impl SignalingSession {
    fn new(ctx: ConnContext, gateway: Arc<SignalingGateway>, registry: ConnectionRegistry) -> Self {
        Self {
            ctx,
            gateway,
            registry,
            hb: Instant::now(),
        }
    }

    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                tracing::warn!(conn_id = %act.ctx.conn_id, "heartbeat timed out, disconnecting");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn reply(ctx: &mut ws::WebsocketContext<Self>, reply: &ServerReply) {
        match serde_json::to_string(reply) {
            Ok(payload) => ctx.text(payload),
            Err(err) => tracing::error!(error = %err, "failed to serialize reply"),
        }
    }
}

impl Actor for SignalingSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(
            conn_id = %self.ctx.conn_id,
            user_id = %self.ctx.user_id,
            "signaling session started"
        );
        self.heartbeat(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!(conn_id = %self.ctx.conn_id, "signaling session stopped");
        let gateway = self.gateway.clone();
        let registry = self.registry.clone();
        let conn_id = self.ctx.conn_id;
        actix::spawn(async move {
            registry.unregister(conn_id).await;
            gateway.disconnect(conn_id).await;
        });
    }
}

impl Handler<Push> for SignalingSession {
    type Result = ();

    fn handle(&mut self, msg: Push, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SignalingSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(payload)) => {
                self.hb = Instant::now();
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientRequest>(&text) {
                Ok(request) => {
                    let gateway = self.gateway.clone();
                    let conn_ctx = self.ctx;
                    let id = request.id;
                    let fut = async move { gateway.handle_event(&conn_ctx, request.event).await }
                        .into_actor(self)
                        .map(move |result, _act, ctx| {
                            let reply = match result {
                                Ok(body) => ServerReply::success(id, body),
                                Err(err) => ServerReply::failure(id, &err),
                            };
                            Self::reply(ctx, &reply);
                        });
                    ctx.spawn(fut);
                }
                Err(err) => {
                    tracing::warn!(conn_id = %self.ctx.conn_id, error = %err, "malformed signaling frame");
                    let reply = ServerReply::failure(
                        None,
                        &AppError::Validation("malformed signaling frame".into()),
                    );
                    Self::reply(ctx, &reply);
                }
            },
            Ok(ws::Message::Binary(_)) => {
                tracing::warn!(conn_id = %self.ctx.conn_id, "binary frames not supported");
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::debug!(conn_id = %self.ctx.conn_id, ?reason, "close frame received");
                ctx.stop();
            }
            _ => {}
        }
    }
}

fn client_ip(req: &HttpRequest) -> IpAddr {
    req.connection_info()
        .realip_remote_addr()
        .and_then(|addr| addr.split(':').next())
        .and_then(|host| host.parse().ok())
        .or_else(|| req.peer_addr().map(|addr| addr.ip()))
        .unwrap_or(IpAddr::from([127, 0, 0, 1]))
}

/// `GET /ws/streams?user_id=...` -> WebSocket upgrade.
pub async fn ws_handler(
    req: HttpRequest,
    payload: web::Payload,
    state: web::Data<SignalingState>,
    query: web::Query<WsParams>,
) -> Result<HttpResponse, actix_web::Error> {
    let params = query.into_inner();
    let ip = client_ip(&req);

    state.gateway.admit(ip, params.user_id)?;

    let conn_ctx = ConnContext {
        conn_id: ConnectionId::new(),
        user_id: params.user_id,
        ip,
    };
    let mut rx = state.registry.register(conn_ctx.conn_id).await;
    let session = SignalingSession::new(conn_ctx, state.gateway.clone(), state.registry.clone());

    let (addr, resp) = ws::WsResponseBuilder::new(session, &req, payload).start_with_addr()?;

    // Bridge registry pushes into the actor mailbox.
    tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            addr.do_send(Push(payload));
        }
    });

    Ok(resp)
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().body("ok")
}

/// Mounts the signaling endpoint plus health and metrics routes on an
/// actix `App`. The caller registers `SignalingState` as app data first.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/ws/streams", web::get().to(ws_handler))
        .route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics::serve_metrics));
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_client_ip_prefers_forwarded_header() {
        let req = TestRequest::default()
            .insert_header(("x-forwarded-for", "203.0.113.7"))
            .peer_addr("10.0.0.1:12345".parse().unwrap())
            .to_http_request();
        assert_eq!(client_ip(&req), "203.0.113.7".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_client_ip_falls_back_to_peer_addr() {
        let req = TestRequest::default()
            .peer_addr("10.0.0.9:44444".parse().unwrap())
            .to_http_request();
        assert_eq!(client_ip(&req), "10.0.0.9".parse::<IpAddr>().unwrap());
    }
}
