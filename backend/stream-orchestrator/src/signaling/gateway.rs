//! Signaling gateway: dispatches client events into the orchestration
//! services and consumes the engine's lifecycle events.
//!
//! All collaborators are injected at construction; the gateway owns no
//! ambient state. Validation, authorization, not-found and capacity
//! failures come back as structured replies and never cross the boundary
//! as panics.

use std::net::IpAddr;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::engine::{
    EngineEvent, MediaKind, ProducerId, SfuEngine, TransportDirection, TransportId, TransportOptions,
    WorkerId,
};
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::persistence::{ChatRecord, EventSink, StreamDirectory, TipRecord};
use crate::services::participant::{ConnectionId, Role};
use crate::services::rate_limit::ConnectionGate;
use crate::services::rooms::{Room, RoomRegistry};
use crate::services::tasks::PeriodicTask;
use crate::services::viewer_count::ViewerCountAggregator;
use crate::services::worker_pool::WorkerPool;
use crate::signaling::messages::{
    ClientEvent, ConsumerReply, JoinReply, ProducerReply, ReplyBody, ServerEvent, TipReply,
    TransportReply,
};
use crate::signaling::registry::Broadcaster;

/// Identity of one admitted connection, fixed for its lifetime.
#[derive(Debug, Clone, Copy)]
pub struct ConnContext {
    pub conn_id: ConnectionId,
    pub user_id: Uuid,
    pub ip: IpAddr,
}

pub struct SignalingGateway {
    cfg: Config,
    workers: Arc<WorkerPool>,
    rooms: Arc<RoomRegistry>,
    gate: Arc<ConnectionGate>,
    viewers: Arc<ViewerCountAggregator>,
    directory: Arc<dyn StreamDirectory>,
    events: Arc<dyn EventSink>,
    broadcaster: Arc<dyn Broadcaster>,
    tasks: StdMutex<Vec<PeriodicTask>>,
    engine_loop: StdMutex<Option<JoinHandle<()>>>,
}

impl SignalingGateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Config,
        workers: Arc<WorkerPool>,
        rooms: Arc<RoomRegistry>,
        gate: Arc<ConnectionGate>,
        viewers: Arc<ViewerCountAggregator>,
        directory: Arc<dyn StreamDirectory>,
        events: Arc<dyn EventSink>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            workers,
            rooms,
            gate,
            viewers,
            directory,
            events,
            broadcaster,
            tasks: StdMutex::new(Vec::new()),
            engine_loop: StdMutex::new(None),
        })
    }

    /// Starts the background machinery: the engine event loop, the room
    /// sweep (which also prunes rate-limit buckets) and the viewer-count
    /// flush.
    pub fn start(self: Arc<Self>, engine: &Arc<dyn SfuEngine>) {
        match engine.take_events() {
            Some(rx) => {
                let gateway = self.clone();
                let handle = tokio::spawn(async move {
                    gateway.run_engine_events(rx).await;
                });
                self.engine_loop
                    .lock()
                    .expect("gateway mutex poisoned")
                    .replace(handle);
            }
            None => tracing::warn!("engine event stream already taken, events will be ignored"),
        }

        let rooms = self.rooms.clone();
        let gate = self.gate.clone();
        let sweeper = PeriodicTask::spawn("room-sweep", self.cfg.rooms.sweep_interval, move || {
            let rooms = rooms.clone();
            let gate = gate.clone();
            async move {
                rooms.sweep_inactive().await;
                gate.prune_expired();
            }
        });
        let flusher = self
            .viewers
            .clone()
            .spawn_flusher(self.cfg.signaling.viewer_flush_interval);

        let mut tasks = self.tasks.lock().expect("gateway mutex poisoned");
        tasks.push(sweeper);
        tasks.push(flusher);
    }

    pub fn shutdown(&self) {
        for task in self.tasks.lock().expect("gateway mutex poisoned").drain(..) {
            task.cancel();
        }
        if let Some(handle) = self
            .engine_loop
            .lock()
            .expect("gateway mutex poisoned")
            .take()
        {
            handle.abort();
        }
    }

    /// Connection admission, called before the WebSocket upgrade.
    pub fn admit(&self, ip: IpAddr, user_id: Uuid) -> AppResult<()> {
        self.gate.admit_connection(ip, user_id)
    }

    pub async fn handle_event(&self, ctx: &ConnContext, event: ClientEvent) -> AppResult<ReplyBody> {
        let kind = event.kind();
        let result = match event {
            ClientEvent::JoinStream { stream_id, role } => {
                self.join_stream(ctx, stream_id, role).await
            }
            ClientEvent::LeaveStream => self.leave_stream(ctx).await,
            ClientEvent::CreateTransport { direction } => {
                self.create_transport(ctx, direction).await
            }
            ClientEvent::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => self.connect_transport(ctx, transport_id, dtls_parameters).await,
            ClientEvent::CreateProducer {
                kind,
                rtp_parameters,
            } => self.create_producer(ctx, kind, rtp_parameters).await,
            ClientEvent::CreateConsumer {
                producer_id,
                rtp_capabilities,
            } => self.create_consumer(ctx, producer_id, rtp_capabilities).await,
            ClientEvent::SendTip { amount, note } => self.send_tip(ctx, amount, note).await,
            ClientEvent::SendMessage { text } => self.send_message(ctx, text).await,
        };

        metrics::observe_event(kind, result.is_ok());
        if let Err(err) = &result {
            tracing::debug!(conn_id = %ctx.conn_id, event = kind, code = err.code(), "signaling event rejected");
        }
        result
    }

    /// Best-effort cleanup on socket close. A vanished room is fine.
    pub async fn disconnect(&self, conn_id: ConnectionId) {
        if let Err(err) = self.leave_room(conn_id).await {
            tracing::debug!(%conn_id, code = err.code(), "disconnect cleanup skipped");
        }
    }

    async fn join_stream(
        &self,
        ctx: &ConnContext,
        stream_id: Uuid,
        role: Role,
    ) -> AppResult<ReplyBody> {
        let route = self
            .directory
            .stream_route(stream_id)
            .await?
            .ok_or(AppError::NotFound("stream"))?;

        match role {
            Role::Performer if route.host_user_id != ctx.user_id => {
                return Err(AppError::Authorization(
                    "only the stream host may join as performer".into(),
                ));
            }
            Role::Viewer if !route.live => {
                return Err(AppError::Validation("stream is not live".into()));
            }
            _ => {}
        }

        let room = self.rooms.create_or_get(stream_id).await?;
        let snapshot = self
            .rooms
            .add_participant(stream_id, ctx.conn_id, ctx.user_id, role)
            .await?;

        if role == Role::Viewer {
            self.viewers.record(stream_id, 1);
        }

        let others = self.other_participants(&room, ctx.conn_id).await;
        self.broadcaster
            .send_to_many(
                &others,
                &ServerEvent::UserJoined {
                    stream_id,
                    user_id: ctx.user_id,
                    role,
                    viewer_count: snapshot.viewer_count,
                },
            )
            .await;
        if role == Role::Performer {
            self.broadcaster
                .send_to_many(&others, &ServerEvent::StreamStarted { stream_id })
                .await;
        }

        Ok(ReplyBody::Join(JoinReply {
            room_id: room.id,
            stream_id,
            router_rtp_capabilities: room.router.rtp_capabilities(),
            viewer_count: snapshot.viewer_count,
            performer_count: snapshot.performer_count,
        }))
    }

    async fn leave_stream(&self, ctx: &ConnContext) -> AppResult<ReplyBody> {
        self.leave_room(ctx.conn_id).await?;
        Ok(ReplyBody::None)
    }

    async fn leave_room(&self, conn_id: ConnectionId) -> AppResult<()> {
        let room = self
            .rooms
            .room_of_connection(conn_id)
            .await
            .ok_or(AppError::NotFound("participant"))?;
        let stream_id = room.stream_id;
        let snapshot = self.rooms.remove_participant(stream_id, conn_id).await?;

        if snapshot.role == Role::Viewer {
            self.viewers.record(stream_id, -1);
        }

        let remaining = room.participant_conn_ids().await;
        self.broadcaster
            .send_to_many(
                &remaining,
                &ServerEvent::UserLeft {
                    stream_id,
                    user_id: snapshot.user_id,
                    viewer_count: snapshot.viewer_count,
                },
            )
            .await;
        if snapshot.role == Role::Performer {
            self.broadcaster
                .send_to_many(
                    &remaining,
                    &ServerEvent::StreamEnded {
                        stream_id,
                        reason: "host ended the stream".into(),
                    },
                )
                .await;
        }
        Ok(())
    }

    async fn create_transport(
        &self,
        ctx: &ConnContext,
        direction: TransportDirection,
    ) -> AppResult<ReplyBody> {
        let room = self.room_of(ctx.conn_id).await?;
        let op_lock = room.op_lock_for(ctx.conn_id).await?;
        let _guard = op_lock.lock().await;

        // One transport per direction: an existing one is explicitly
        // closed (with its producers/consumers) before the replacement is
        // created, so clients can renegotiate after a network change.
        if let Some(teardown) = room.replace_transport(ctx.conn_id, direction).await? {
            tracing::info!(
                conn_id = %ctx.conn_id,
                direction = direction.as_str(),
                "closing existing transport before replacement"
            );
            teardown.close_all().await;
        }

        let transport = room
            .router
            .create_transport(TransportOptions { direction })
            .await
            .map_err(|e| AppError::from_engine("create_transport", e))?;

        match room
            .store_transport(ctx.conn_id, direction, transport.clone())
            .await
        {
            Ok(()) => Ok(ReplyBody::Transport(TransportReply {
                transport_id: transport.id(),
                direction,
                parameters: transport.parameters(),
            })),
            Err(err) => {
                // Participant left while the engine call was in flight;
                // close the orphan instead of leaking it.
                transport.close().await;
                Err(err)
            }
        }
    }

    async fn connect_transport(
        &self,
        ctx: &ConnContext,
        transport_id: TransportId,
        dtls_parameters: serde_json::Value,
    ) -> AppResult<ReplyBody> {
        let room = self.room_of(ctx.conn_id).await?;
        let transport = room.transport_by_id_for(ctx.conn_id, transport_id).await?;
        transport
            .connect(dtls_parameters)
            .await
            .map_err(|e| AppError::from_engine("connect_transport", e))?;
        Ok(ReplyBody::None)
    }

    async fn create_producer(
        &self,
        ctx: &ConnContext,
        kind: MediaKind,
        rtp_parameters: serde_json::Value,
    ) -> AppResult<ReplyBody> {
        let room = self.room_of(ctx.conn_id).await?;
        if room.role_of(ctx.conn_id).await? != Role::Performer {
            return Err(AppError::Authorization(
                "only performers may publish media".into(),
            ));
        }
        let op_lock = room.op_lock_for(ctx.conn_id).await?;
        let _guard = op_lock.lock().await;

        let transport = room
            .transport_for(ctx.conn_id, TransportDirection::Send)
            .await?;
        let producer = transport
            .produce(kind, rtp_parameters)
            .await
            .map_err(|e| AppError::from_engine("create_producer", e))?;

        if let Err(err) = room.register_producer(ctx.conn_id, producer.clone()).await {
            producer.close().await;
            return Err(err);
        }

        let others = self.other_participants(&room, ctx.conn_id).await;
        self.broadcaster
            .send_to_many(
                &others,
                &ServerEvent::NewProducer {
                    producer_id: producer.id(),
                    user_id: ctx.user_id,
                    kind,
                },
            )
            .await;

        Ok(ReplyBody::Producer(ProducerReply {
            producer_id: producer.id(),
        }))
    }

    async fn create_consumer(
        &self,
        ctx: &ConnContext,
        producer_id: ProducerId,
        rtp_capabilities: serde_json::Value,
    ) -> AppResult<ReplyBody> {
        let room = self.room_of(ctx.conn_id).await?;
        let op_lock = room.op_lock_for(ctx.conn_id).await?;
        let _guard = op_lock.lock().await;

        let transport = room
            .transport_for(ctx.conn_id, TransportDirection::Recv)
            .await?;
        if !room.producer_exists(producer_id).await {
            return Err(AppError::NotFound("producer"));
        }
        if !room.router.can_consume(producer_id, &rtp_capabilities).await {
            return Err(AppError::IncompatibleCapabilities);
        }

        let consumer = transport
            .consume(producer_id, rtp_capabilities)
            .await
            .map_err(|e| AppError::from_engine("create_consumer", e))?;

        if let Err(err) = room.register_consumer(ctx.conn_id, consumer.clone()).await {
            consumer.close().await;
            return Err(err);
        }

        Ok(ReplyBody::Consumer(ConsumerReply {
            consumer_id: consumer.id(),
            producer_id,
            parameters: consumer.parameters(),
        }))
    }

    /// Tip ceiling is enforced here, independent of wallet balance; the
    /// ledger write itself is the wallet service's business.
    async fn send_tip(
        &self,
        ctx: &ConnContext,
        amount: u64,
        note: Option<String>,
    ) -> AppResult<ReplyBody> {
        let room = self.room_of(ctx.conn_id).await?;

        if amount == 0 {
            return Err(AppError::Validation("tip amount must be positive".into()));
        }
        if amount > self.cfg.signaling.max_tip_amount {
            return Err(AppError::Validation(format!(
                "tip amount exceeds maximum of {}",
                self.cfg.signaling.max_tip_amount
            )));
        }
        if let Some(note) = &note {
            if note.len() > self.cfg.signaling.max_message_len {
                return Err(AppError::Validation("tip note too long".into()));
            }
        }

        let record = TipRecord {
            stream_id: room.stream_id,
            from_user: ctx.user_id,
            amount,
            note: note.clone(),
        };
        let receipt = self.events.tip_sent(&record).await?;

        metrics::tip_accepted();
        let everyone = room.participant_conn_ids().await;
        self.broadcaster
            .send_to_many(
                &everyone,
                &ServerEvent::TipReceived {
                    stream_id: room.stream_id,
                    from_user: ctx.user_id,
                    amount,
                    note,
                    tip_id: receipt.tip_id,
                },
            )
            .await;

        Ok(ReplyBody::Tip(TipReply {
            tip_id: receipt.tip_id,
        }))
    }

    async fn send_message(&self, ctx: &ConnContext, text: String) -> AppResult<ReplyBody> {
        let room = self.room_of(ctx.conn_id).await?;
        self.gate.allow_message(ctx.user_id)?;

        if text.trim().is_empty() {
            return Err(AppError::Validation("message is empty".into()));
        }
        if text.len() > self.cfg.signaling.max_message_len {
            return Err(AppError::Validation("message too long".into()));
        }

        let record = ChatRecord {
            stream_id: room.stream_id,
            user_id: ctx.user_id,
            message: text.clone(),
            sent_at: chrono::Utc::now(),
        };
        self.events.chat_message(&record).await?;

        let everyone = room.participant_conn_ids().await;
        self.broadcaster
            .send_to_many(
                &everyone,
                &ServerEvent::MessageReceived {
                    stream_id: room.stream_id,
                    user_id: ctx.user_id,
                    text,
                    sent_at: record.sent_at,
                },
            )
            .await;

        Ok(ReplyBody::None)
    }

    async fn room_of(&self, conn_id: ConnectionId) -> AppResult<Arc<Room>> {
        self.rooms
            .room_of_connection(conn_id)
            .await
            .ok_or(AppError::NotFound("participant"))
    }

    async fn other_participants(&self, room: &Arc<Room>, except: ConnectionId) -> Vec<ConnectionId> {
        room.participant_conn_ids()
            .await
            .into_iter()
            .filter(|conn| *conn != except)
            .collect()
    }

    async fn run_engine_events(self: Arc<Self>, mut rx: UnboundedReceiver<EngineEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                EngineEvent::WorkerDied { worker_id } => self.handle_worker_died(worker_id).await,
                EngineEvent::TransportClosed { transport_id } => {
                    if let Some((_, owner, teardown)) =
                        self.rooms.detach_transport(transport_id).await
                    {
                        tracing::info!(%transport_id, conn_id = %owner, "transport closed by engine");
                        teardown.close_all().await;
                    }
                }
                EngineEvent::ProducerClosed { producer_id } => {
                    if let Some((room, _, _)) = self.rooms.detach_producer(producer_id).await {
                        let everyone = room.participant_conn_ids().await;
                        self.broadcaster
                            .send_to_many(&everyone, &ServerEvent::ProducerClosed { producer_id })
                            .await;
                    }
                }
                EngineEvent::ConsumerClosed { consumer_id } => {
                    if let Some((_, owner, _)) = self.rooms.detach_consumer(consumer_id).await {
                        self.broadcaster
                            .send_to_one(owner, &ServerEvent::ConsumerClosed { consumer_id })
                            .await;
                    }
                }
            }
        }
        tracing::info!("engine event stream ended");
    }

    /// A worker crash is never surfaced to an individual caller: the slot
    /// is replaced in the background and every room bound to the dead
    /// worker is terminated so clients rejoin onto a healthy one.
    async fn handle_worker_died(&self, worker_id: WorkerId) {
        self.workers.handle_worker_failure(worker_id).await;

        for room in self.rooms.rooms_on_worker(worker_id).await {
            let stream_id = room.stream_id;
            let (viewer_count, _) = room.counts().await;
            if viewer_count > 0 {
                self.viewers.record(stream_id, -(viewer_count as i64));
            }

            let everyone = room.participant_conn_ids().await;
            self.broadcaster
                .send_to_many(
                    &everyone,
                    &ServerEvent::StreamEnded {
                        stream_id,
                        reason: "media server failure, please rejoin".into(),
                    },
                )
                .await;

            match self.rooms.close_room(stream_id).await {
                Ok(evicted) => {
                    tracing::warn!(
                        %stream_id,
                        %worker_id,
                        evicted = evicted.len(),
                        "room terminated after worker failure"
                    );
                }
                Err(err) => {
                    tracing::error!(%stream_id, error = %err, "failed to terminate room after worker failure");
                }
            }
        }
    }
}
