//! Shared test fixtures: a scriptable mock SFU engine, in-memory
//! collaborators, and a wired-up gateway harness.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use stream_orchestrator::config::Config;
use stream_orchestrator::engine::{
    ConsumerId, EngineError, EngineEvent, EngineResult, MediaKind, PortRange, ProducerId,
    RouterOptions, SfuConsumer, SfuEngine, SfuProducer, SfuRouter, SfuTransport, SfuWorker,
    TransportDirection, TransportId, TransportOptions, WorkerId, WorkerOptions,
};
use stream_orchestrator::error::{AppError, AppResult};
use stream_orchestrator::persistence::{
    ChatRecord, EventSink, StreamDirectory, StreamRoute, TipReceipt, TipRecord, ViewerCountStore,
};
use stream_orchestrator::services::{
    ConnectionGate, ConnectionId, RoomRegistry, ViewerCountAggregator, WorkerPool,
};
use stream_orchestrator::signaling::gateway::ConnContext;
use stream_orchestrator::signaling::{Broadcaster, ServerEvent, SignalingGateway};

/// Records every engine object that was closed, keyed by a type-prefixed
/// id string.
#[derive(Default, Clone)]
pub struct CloseLedger(Arc<Mutex<HashSet<String>>>);

impl CloseLedger {
    fn mark(&self, id: String) {
        self.0.lock().unwrap().insert(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.lock().unwrap().contains(id)
    }

    pub fn closed_count(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

pub struct MockEngine {
    events_tx: UnboundedSender<EngineEvent>,
    events_rx: Mutex<Option<UnboundedReceiver<EngineEvent>>>,
    /// Scripted outcomes for upcoming `create_worker` calls; exhausted
    /// entries mean success.
    worker_script: Mutex<VecDeque<bool>>,
    pub workers: Mutex<Vec<Arc<MockWorker>>>,
    pub can_consume: Arc<AtomicBool>,
    pub closed: CloseLedger,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = unbounded_channel();
        Arc::new(Self {
            events_tx: tx,
            events_rx: Mutex::new(Some(rx)),
            worker_script: Mutex::new(VecDeque::new()),
            workers: Mutex::new(Vec::new()),
            can_consume: Arc::new(AtomicBool::new(true)),
            closed: CloseLedger::default(),
        })
    }

    pub fn script_worker_results(&self, results: &[bool]) {
        *self.worker_script.lock().unwrap() = results.iter().copied().collect();
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.lock().unwrap().iter().map(|w| w.id).collect()
    }
}

#[async_trait]
impl SfuEngine for MockEngine {
    async fn create_worker(&self, opts: WorkerOptions) -> EngineResult<Arc<dyn SfuWorker>> {
        let ok = self.worker_script.lock().unwrap().pop_front().unwrap_or(true);
        if !ok {
            return Err(EngineError::Unavailable("scripted worker failure".into()));
        }
        let worker = Arc::new(MockWorker {
            id: WorkerId::new(),
            port_range: opts.port_range,
            can_consume: self.can_consume.clone(),
            closed: self.closed.clone(),
        });
        self.workers.lock().unwrap().push(worker.clone());
        Ok(worker)
    }

    fn take_events(&self) -> Option<UnboundedReceiver<EngineEvent>> {
        self.events_rx.lock().unwrap().take()
    }
}

pub struct MockWorker {
    pub id: WorkerId,
    pub port_range: PortRange,
    can_consume: Arc<AtomicBool>,
    closed: CloseLedger,
}

#[async_trait]
impl SfuWorker for MockWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    async fn create_router(&self, _opts: RouterOptions) -> EngineResult<Arc<dyn SfuRouter>> {
        Ok(Arc::new(MockRouter {
            id: Uuid::new_v4(),
            can_consume: self.can_consume.clone(),
            closed: self.closed.clone(),
        }))
    }

    async fn close(&self) {
        self.closed.mark(format!("worker:{}", self.id));
    }
}

pub struct MockRouter {
    id: Uuid,
    can_consume: Arc<AtomicBool>,
    closed: CloseLedger,
}

#[async_trait]
impl SfuRouter for MockRouter {
    fn rtp_capabilities(&self) -> Value {
        json!({ "codecs": ["audio/opus", "video/VP8"] })
    }

    async fn create_transport(&self, opts: TransportOptions) -> EngineResult<Arc<dyn SfuTransport>> {
        Ok(Arc::new(MockTransport {
            id: TransportId::new(),
            direction: opts.direction,
            connected: AtomicBool::new(false),
            can_consume: self.can_consume.clone(),
            closed: self.closed.clone(),
        }))
    }

    async fn can_consume(&self, _producer_id: ProducerId, _rtp_capabilities: &Value) -> bool {
        self.can_consume.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.mark(format!("router:{}", self.id));
    }
}

pub struct MockTransport {
    id: TransportId,
    direction: TransportDirection,
    connected: AtomicBool,
    can_consume: Arc<AtomicBool>,
    closed: CloseLedger,
}

#[async_trait]
impl SfuTransport for MockTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn parameters(&self) -> Value {
        json!({ "transport_id": self.id, "ice_role": "controlled" })
    }

    async fn connect(&self, _dtls_parameters: Value) -> EngineResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        _rtp_parameters: Value,
    ) -> EngineResult<Arc<dyn SfuProducer>> {
        Ok(Arc::new(MockProducer {
            id: ProducerId::new(),
            kind,
            closed: self.closed.clone(),
        }))
    }

    async fn consume(
        &self,
        producer_id: ProducerId,
        _rtp_capabilities: Value,
    ) -> EngineResult<Arc<dyn SfuConsumer>> {
        Ok(Arc::new(MockConsumer {
            id: ConsumerId::new(),
            producer_id,
            closed: self.closed.clone(),
        }))
    }

    async fn close(&self) {
        self.closed.mark(format!("transport:{}", self.id));
    }
}

pub struct MockProducer {
    id: ProducerId,
    kind: MediaKind,
    closed: CloseLedger,
}

#[async_trait]
impl SfuProducer for MockProducer {
    fn id(&self) -> ProducerId {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn close(&self) {
        self.closed.mark(format!("producer:{}", self.id));
    }
}

pub struct MockConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    closed: CloseLedger,
}

#[async_trait]
impl SfuConsumer for MockConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    fn parameters(&self) -> Value {
        json!({ "consumer_id": self.id, "producer_id": self.producer_id })
    }

    async fn close(&self) {
        self.closed.mark(format!("consumer:{}", self.id));
    }
}

#[derive(Default)]
pub struct MockDirectory {
    routes: Mutex<HashMap<Uuid, StreamRoute>>,
}

impl MockDirectory {
    pub fn add_live_stream(&self, host_user_id: Uuid) -> Uuid {
        let stream_id = Uuid::new_v4();
        self.routes.lock().unwrap().insert(
            stream_id,
            StreamRoute {
                host_user_id,
                live: true,
            },
        );
        stream_id
    }

    pub fn set_live(&self, stream_id: Uuid, live: bool) {
        if let Some(route) = self.routes.lock().unwrap().get_mut(&stream_id) {
            route.live = live;
        }
    }
}

#[async_trait]
impl StreamDirectory for MockDirectory {
    async fn stream_route(&self, stream_id: Uuid) -> AppResult<Option<StreamRoute>> {
        Ok(self.routes.lock().unwrap().get(&stream_id).copied())
    }
}

#[derive(Default)]
pub struct MockViewerStore {
    pub applied: Mutex<Vec<(Uuid, i64)>>,
}

#[async_trait]
impl ViewerCountStore for MockViewerStore {
    async fn apply_viewer_delta(&self, stream_id: Uuid, delta: i64) -> AppResult<()> {
        self.applied.lock().unwrap().push((stream_id, delta));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockEventSink {
    pub tips: Mutex<Vec<TipRecord>>,
    pub chats: Mutex<Vec<ChatRecord>>,
    pub reject_tips: AtomicBool,
}

#[async_trait]
impl EventSink for MockEventSink {
    async fn tip_sent(&self, tip: &TipRecord) -> AppResult<TipReceipt> {
        if self.reject_tips.load(Ordering::SeqCst) {
            return Err(AppError::Validation("insufficient balance".into()));
        }
        self.tips.lock().unwrap().push(tip.clone());
        Ok(TipReceipt {
            tip_id: Uuid::new_v4(),
        })
    }

    async fn chat_message(&self, chat: &ChatRecord) -> AppResult<()> {
        self.chats.lock().unwrap().push(chat.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MockBroadcaster {
    pub sent: Mutex<Vec<(Vec<ConnectionId>, ServerEvent)>>,
}

impl MockBroadcaster {
    pub fn events(&self) -> Vec<ServerEvent> {
        self.sent.lock().unwrap().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn events_for(&self, conn_id: ConnectionId) -> Vec<ServerEvent> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(targets, _)| targets.contains(&conn_id))
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl Broadcaster for MockBroadcaster {
    async fn send_to_many(&self, targets: &[ConnectionId], event: &ServerEvent) {
        if targets.is_empty() {
            return;
        }
        self.sent
            .lock()
            .unwrap()
            .push((targets.to_vec(), event.clone()));
    }

    async fn send_to_one(&self, target: ConnectionId, event: &ServerEvent) {
        self.send_to_many(&[target], event).await;
    }
}

pub struct Harness {
    pub engine: Arc<MockEngine>,
    pub workers: Arc<WorkerPool>,
    pub rooms: Arc<RoomRegistry>,
    pub gate: Arc<ConnectionGate>,
    pub viewers: Arc<ViewerCountAggregator>,
    pub viewer_store: Arc<MockViewerStore>,
    pub directory: Arc<MockDirectory>,
    pub sink: Arc<MockEventSink>,
    pub broadcaster: Arc<MockBroadcaster>,
    pub gateway: Arc<SignalingGateway>,
}

pub fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.workers.initial_workers = 2;
    cfg.workers.max_workers = 3;
    cfg.rooms.max_participants = 3;
    cfg
}

pub async fn harness() -> Harness {
    harness_with(test_config()).await
}

pub async fn harness_with(cfg: Config) -> Harness {
    let engine = MockEngine::new();
    let engine_dyn: Arc<dyn SfuEngine> = engine.clone();

    let workers = WorkerPool::initialize(engine_dyn.clone(), cfg.workers.clone())
        .await
        .expect("worker pool");
    let rooms = Arc::new(RoomRegistry::new(
        workers.clone(),
        cfg.rooms.clone(),
        RouterOptions::default(),
    ));
    let gate = Arc::new(ConnectionGate::new(&cfg.gate));
    let viewer_store = Arc::new(MockViewerStore::default());
    let viewers = Arc::new(ViewerCountAggregator::new(viewer_store.clone()));
    let directory = Arc::new(MockDirectory::default());
    let sink = Arc::new(MockEventSink::default());
    let broadcaster = Arc::new(MockBroadcaster::default());

    let gateway = SignalingGateway::new(
        cfg,
        workers.clone(),
        rooms.clone(),
        gate.clone(),
        viewers.clone(),
        directory.clone(),
        sink.clone(),
        broadcaster.clone(),
    );
    gateway.clone().start(&engine_dyn);

    Harness {
        engine,
        workers,
        rooms,
        gate,
        viewers,
        viewer_store,
        directory,
        sink,
        broadcaster,
        gateway,
    }
}

pub fn conn(user_id: Uuid) -> ConnContext {
    ConnContext {
        conn_id: ConnectionId::new(),
        user_id,
        ip: "127.0.0.1".parse().unwrap(),
    }
}

pub fn conn_from(user_id: Uuid, ip: &str) -> ConnContext {
    ConnContext {
        conn_id: ConnectionId::new(),
        user_id,
        ip: ip.parse().unwrap(),
    }
}

/// Lets spawned tasks (engine event loop, restarts) run. Instant under a
/// paused clock, a short real wait otherwise.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

use stream_orchestrator::engine::MediaKind as Kind;
use stream_orchestrator::services::Role;
use stream_orchestrator::signaling::messages::{
    ConsumerReply, JoinReply, ProducerReply, TransportReply,
};
use stream_orchestrator::signaling::{ClientEvent, ReplyBody};

pub fn expect_join(body: ReplyBody) -> JoinReply {
    match body {
        ReplyBody::Join(reply) => reply,
        other => panic!("expected join reply, got {other:?}"),
    }
}

pub fn expect_transport(body: ReplyBody) -> TransportReply {
    match body {
        ReplyBody::Transport(reply) => reply,
        other => panic!("expected transport reply, got {other:?}"),
    }
}

pub fn expect_producer(body: ReplyBody) -> ProducerReply {
    match body {
        ReplyBody::Producer(reply) => reply,
        other => panic!("expected producer reply, got {other:?}"),
    }
}

pub fn expect_consumer(body: ReplyBody) -> ConsumerReply {
    match body {
        ReplyBody::Consumer(reply) => reply,
        other => panic!("expected consumer reply, got {other:?}"),
    }
}

/// Joins a fresh viewer connection to the stream.
pub async fn join_viewer(h: &Harness, stream_id: Uuid) -> ConnContext {
    let ctx = conn(Uuid::new_v4());
    h.gateway
        .handle_event(
            &ctx,
            ClientEvent::JoinStream {
                stream_id,
                role: Role::Viewer,
            },
        )
        .await
        .expect("viewer join");
    ctx
}

/// Joins the host as performer.
pub async fn join_performer(h: &Harness, stream_id: Uuid, host: Uuid) -> ConnContext {
    let ctx = conn(host);
    h.gateway
        .handle_event(
            &ctx,
            ClientEvent::JoinStream {
                stream_id,
                role: Role::Performer,
            },
        )
        .await
        .expect("performer join");
    ctx
}

/// Creates a send transport and an audio producer for an already-joined
/// performer, returning the producer reply.
pub async fn publish_audio(h: &Harness, ctx: &ConnContext) -> ProducerReply {
    h.gateway
        .handle_event(
            ctx,
            ClientEvent::CreateTransport {
                direction: TransportDirection::Send,
            },
        )
        .await
        .expect("send transport");
    let body = h
        .gateway
        .handle_event(
            ctx,
            ClientEvent::CreateProducer {
                kind: Kind::Audio,
                rtp_parameters: json!({}),
            },
        )
        .await
        .expect("producer");
    expect_producer(body)
}
