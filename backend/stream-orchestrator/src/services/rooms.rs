//! Room registry and lifecycle.
//!
//! One room per live stream, bound to one SFU worker. Rooms move through
//! `Created -> Active -> Draining -> Deleted`; an empty room lingers in
//! `Draining` until the inactivity sweep so brief reconnects do not churn
//! routers.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::RoomConfig;
use crate::engine::{
    ConsumerId, ProducerId, RouterOptions, SfuConsumer, SfuProducer, SfuRouter, SfuTransport,
    TransportDirection, TransportId, WorkerId,
};
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::services::participant::{ConnectionId, MediaTeardown, ParticipantSession, Role};
use crate::services::worker_pool::WorkerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RoomId(Uuid);

impl RoomId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RoomId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomLifecycle {
    Created,
    Active,
    Draining,
    Deleted,
}

impl RoomLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Deleted => "deleted",
        }
    }
}

struct RoomState {
    lifecycle: RoomLifecycle,
    participants: HashMap<ConnectionId, ParticipantSession>,
    producers: HashMap<ProducerId, ConnectionId>,
    consumers: HashMap<ConsumerId, ConnectionId>,
    viewer_count: u32,
    performer_count: u32,
    last_activity: Instant,
}

pub struct Room {
    pub id: RoomId,
    pub stream_id: Uuid,
    /// Worker slot this room is bound to; released on deletion.
    pub slot: usize,
    pub worker_id: WorkerId,
    pub router: Arc<dyn SfuRouter>,
    state: Mutex<RoomState>,
}

/// Room counters right after a join.
#[derive(Debug, Clone, Copy)]
pub struct JoinSnapshot {
    pub viewer_count: u32,
    pub performer_count: u32,
}

/// What a leave/disconnect removed, for broadcasting and viewer-count
/// accounting.
#[derive(Debug, Clone, Copy)]
pub struct LeaveSnapshot {
    pub user_id: Uuid,
    pub role: Role,
    pub viewer_count: u32,
    pub performer_count: u32,
}

impl Room {
    fn new(stream_id: Uuid, slot: usize, worker_id: WorkerId, router: Arc<dyn SfuRouter>) -> Self {
        Self {
            id: RoomId::new(),
            stream_id,
            slot,
            worker_id,
            router,
            state: Mutex::new(RoomState {
                lifecycle: RoomLifecycle::Created,
                participants: HashMap::new(),
                producers: HashMap::new(),
                consumers: HashMap::new(),
                viewer_count: 0,
                performer_count: 0,
                last_activity: Instant::now(),
            }),
        }
    }

    pub async fn lifecycle(&self) -> RoomLifecycle {
        self.state.lock().await.lifecycle
    }

    pub async fn participant_count(&self) -> usize {
        self.state.lock().await.participants.len()
    }

    /// (viewers, performers)
    pub async fn counts(&self) -> (u32, u32) {
        let st = self.state.lock().await;
        (st.viewer_count, st.performer_count)
    }

    pub async fn participant_conn_ids(&self) -> Vec<ConnectionId> {
        self.state.lock().await.participants.keys().copied().collect()
    }

    /// (tracked producers, tracked consumers)
    pub async fn media_counts(&self) -> (usize, usize) {
        let st = self.state.lock().await;
        (st.producers.len(), st.consumers.len())
    }

    pub async fn role_of(&self, conn_id: ConnectionId) -> AppResult<Role> {
        self.state
            .lock()
            .await
            .participants
            .get(&conn_id)
            .map(|s| s.role)
            .ok_or(AppError::NotFound("participant"))
    }

    /// Per-participant operation lock; held across engine calls, never
    /// taken while the room state lock is held by the same task.
    pub async fn op_lock_for(&self, conn_id: ConnectionId) -> AppResult<Arc<Mutex<()>>> {
        self.state
            .lock()
            .await
            .participants
            .get(&conn_id)
            .map(|s| s.op_lock())
            .ok_or(AppError::NotFound("participant"))
    }

    pub async fn transport_for(
        &self,
        conn_id: ConnectionId,
        direction: TransportDirection,
    ) -> AppResult<Arc<dyn SfuTransport>> {
        let st = self.state.lock().await;
        let session = st
            .participants
            .get(&conn_id)
            .ok_or(AppError::NotFound("participant"))?;
        session
            .transport(direction)
            .ok_or(AppError::NotFound("transport"))
    }

    pub async fn transport_by_id_for(
        &self,
        conn_id: ConnectionId,
        transport_id: TransportId,
    ) -> AppResult<Arc<dyn SfuTransport>> {
        let st = self.state.lock().await;
        let session = st
            .participants
            .get(&conn_id)
            .ok_or(AppError::NotFound("participant"))?;
        session
            .transport_by_id(transport_id)
            .ok_or(AppError::NotFound("transport"))
    }

    /// Detaches the participant's transport for `direction` (with its
    /// cascade) so the caller can close it and install a replacement.
    pub async fn replace_transport(
        &self,
        conn_id: ConnectionId,
        direction: TransportDirection,
    ) -> AppResult<Option<MediaTeardown>> {
        let mut st = self.state.lock().await;
        let session = st
            .participants
            .get_mut(&conn_id)
            .ok_or(AppError::NotFound("participant"))?;
        let teardown = session.take_transport(direction);
        if let Some(teardown) = &teardown {
            for producer in &teardown.producers {
                st.producers.remove(&producer.id());
            }
            for consumer in &teardown.consumers {
                st.consumers.remove(&consumer.id());
            }
        }
        Ok(teardown)
    }

    /// Attaches a freshly created transport. Fails when the participant
    /// left while the engine call was in flight; the caller then closes
    /// the transport instead of leaking it.
    pub async fn store_transport(
        &self,
        conn_id: ConnectionId,
        direction: TransportDirection,
        transport: Arc<dyn SfuTransport>,
    ) -> AppResult<()> {
        let mut st = self.state.lock().await;
        let session = st
            .participants
            .get_mut(&conn_id)
            .ok_or(AppError::NotFound("participant"))?;
        session.set_transport(direction, transport);
        st.last_activity = Instant::now();
        Ok(())
    }

    pub async fn register_producer(
        &self,
        conn_id: ConnectionId,
        producer: Arc<dyn SfuProducer>,
    ) -> AppResult<()> {
        let mut st = self.state.lock().await;
        let session = st
            .participants
            .get_mut(&conn_id)
            .ok_or(AppError::NotFound("participant"))?;
        session.add_producer(producer.clone());
        st.producers.insert(producer.id(), conn_id);
        st.last_activity = Instant::now();
        Ok(())
    }

    pub async fn register_consumer(
        &self,
        conn_id: ConnectionId,
        consumer: Arc<dyn SfuConsumer>,
    ) -> AppResult<()> {
        let mut st = self.state.lock().await;
        let session = st
            .participants
            .get_mut(&conn_id)
            .ok_or(AppError::NotFound("participant"))?;
        session.add_consumer(consumer.clone());
        st.consumers.insert(consumer.id(), conn_id);
        st.last_activity = Instant::now();
        Ok(())
    }

    pub async fn producer_exists(&self, producer_id: ProducerId) -> bool {
        self.state.lock().await.producers.contains_key(&producer_id)
    }

    /// Removes a producer from both the room map and its owner's session.
    pub async fn detach_producer(
        &self,
        producer_id: ProducerId,
    ) -> Option<(ConnectionId, Arc<dyn SfuProducer>)> {
        let mut st = self.state.lock().await;
        let owner = st.producers.remove(&producer_id)?;
        let producer = st
            .participants
            .get_mut(&owner)
            .and_then(|s| s.remove_producer(producer_id))?;
        Some((owner, producer))
    }

    pub async fn detach_consumer(
        &self,
        consumer_id: ConsumerId,
    ) -> Option<(ConnectionId, Arc<dyn SfuConsumer>)> {
        let mut st = self.state.lock().await;
        let owner = st.consumers.remove(&consumer_id)?;
        let consumer = st
            .participants
            .get_mut(&owner)
            .and_then(|s| s.remove_consumer(consumer_id))?;
        Some((owner, consumer))
    }

    /// Removes a transport (engine-closed) together with everything that
    /// rode it from both the session and the room maps.
    pub async fn detach_transport(
        &self,
        transport_id: TransportId,
    ) -> Option<(ConnectionId, MediaTeardown)> {
        let mut st = self.state.lock().await;
        let owner = *st
            .participants
            .iter()
            .find(|(_, s)| s.transport_by_id(transport_id).is_some())
            .map(|(conn, _)| conn)?;
        let (_, teardown) = st
            .participants
            .get_mut(&owner)
            .and_then(|s| s.take_transport_by_id(transport_id))?;
        for producer in &teardown.producers {
            st.producers.remove(&producer.id());
        }
        for consumer in &teardown.consumers {
            st.consumers.remove(&consumer.id());
        }
        Some((owner, teardown))
    }
}

pub struct RoomRegistry {
    cfg: RoomConfig,
    workers: Arc<WorkerPool>,
    router_options: RouterOptions,
    rooms: RwLock<HashMap<Uuid, Arc<Room>>>,
    /// Reverse index: which stream each connection is in.
    connections: RwLock<HashMap<ConnectionId, Uuid>>,
}

impl RoomRegistry {
    pub fn new(workers: Arc<WorkerPool>, cfg: RoomConfig, router_options: RouterOptions) -> Self {
        Self {
            cfg,
            workers,
            router_options,
            rooms: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, stream_id: Uuid) -> Option<Arc<Room>> {
        self.rooms.read().await.get(&stream_id).cloned()
    }

    pub async fn room_of_connection(&self, conn_id: ConnectionId) -> Option<Arc<Room>> {
        let stream_id = *self.connections.read().await.get(&conn_id)?;
        self.get(stream_id).await
    }

    pub async fn rooms_on_worker(&self, worker_id: WorkerId) -> Vec<Arc<Room>> {
        self.rooms
            .read()
            .await
            .values()
            .filter(|room| room.worker_id == worker_id)
            .cloned()
            .collect()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Idempotent: returns the live room for the stream, creating and
    /// binding one to the least-loaded worker when absent.
    pub async fn create_or_get(&self, stream_id: Uuid) -> AppResult<Arc<Room>> {
        if let Some(room) = self.get(stream_id).await {
            if room.lifecycle().await != RoomLifecycle::Deleted {
                return Ok(room);
            }
        }

        let (slot, worker) = self.workers.optimal_worker().await?;
        let router = worker
            .create_router(self.router_options.clone())
            .await
            .map_err(|e| AppError::from_engine("create_router", e))?;
        let room = Arc::new(Room::new(stream_id, slot, worker.id(), router));

        {
            let mut rooms = self.rooms.write().await;
            if let Some(existing) = rooms.get(&stream_id) {
                if existing.state.lock().await.lifecycle != RoomLifecycle::Deleted {
                    // Lost a creation race; discard the spare router.
                    let existing = existing.clone();
                    drop(rooms);
                    room.router.close().await;
                    return Ok(existing);
                }
            }
            rooms.insert(stream_id, room.clone());
        }

        self.workers.assign(slot, room.worker_id).await;
        metrics::room_opened();
        tracing::info!(
            room_id = %room.id,
            %stream_id,
            slot,
            worker_id = %room.worker_id,
            "room created"
        );
        self.workers.scale_up_in_background();
        Ok(room)
    }

    pub async fn add_participant(
        &self,
        stream_id: Uuid,
        conn_id: ConnectionId,
        user_id: Uuid,
        role: Role,
    ) -> AppResult<JoinSnapshot> {
        let room = self
            .get(stream_id)
            .await
            .ok_or(AppError::NotFound("room"))?;

        let snapshot = {
            let mut st = room.state.lock().await;
            if st.lifecycle == RoomLifecycle::Deleted {
                return Err(AppError::NotFound("room"));
            }
            if st.participants.contains_key(&conn_id) {
                return Err(AppError::Validation("connection already joined".into()));
            }
            if st.participants.len() >= self.cfg.max_participants {
                return Err(AppError::Capacity("room is full".into()));
            }

            st.participants
                .insert(conn_id, ParticipantSession::new(conn_id, user_id, role));
            match role {
                Role::Viewer => st.viewer_count += 1,
                Role::Performer => st.performer_count += 1,
            }
            st.last_activity = Instant::now();
            if st.lifecycle == RoomLifecycle::Draining {
                tracing::info!(%stream_id, "draining room reactivated");
            }
            st.lifecycle = RoomLifecycle::Active;
            JoinSnapshot {
                viewer_count: st.viewer_count,
                performer_count: st.performer_count,
            }
        };

        self.connections.write().await.insert(conn_id, stream_id);
        metrics::participant_joined(role.as_str());
        tracing::info!(%conn_id, %user_id, role = role.as_str(), %stream_id, "participant joined");
        Ok(snapshot)
    }

    /// Removes the participant and closes everything it owned. An empty
    /// room transitions to `Draining`; deletion is deferred to the sweep.
    pub async fn remove_participant(
        &self,
        stream_id: Uuid,
        conn_id: ConnectionId,
    ) -> AppResult<LeaveSnapshot> {
        let room = self
            .get(stream_id)
            .await
            .ok_or(AppError::NotFound("room"))?;

        let (snapshot, teardown, drained) = {
            let mut st = room.state.lock().await;
            let mut session = st
                .participants
                .remove(&conn_id)
                .ok_or(AppError::NotFound("participant"))?;
            for producer_id in session.producer_ids() {
                st.producers.remove(&producer_id);
            }
            for consumer_id in session.consumer_ids() {
                st.consumers.remove(&consumer_id);
            }
            match session.role {
                Role::Viewer => st.viewer_count = st.viewer_count.saturating_sub(1),
                Role::Performer => st.performer_count = st.performer_count.saturating_sub(1),
            }
            st.last_activity = Instant::now();
            let drained = st.participants.is_empty();
            if drained {
                st.lifecycle = RoomLifecycle::Draining;
            }
            (
                LeaveSnapshot {
                    user_id: session.user_id,
                    role: session.role,
                    viewer_count: st.viewer_count,
                    performer_count: st.performer_count,
                },
                session.drain_media(),
                drained,
            )
        };

        self.connections.write().await.remove(&conn_id);
        metrics::participant_left(snapshot.role.as_str());
        if drained {
            tracing::info!(%stream_id, "room drained, deletion deferred to sweep");
        }
        teardown.close_all().await;
        Ok(snapshot)
    }

    /// Deletes an empty room. Idempotent; refuses while participants
    /// remain.
    pub async fn delete_room(&self, stream_id: Uuid) -> AppResult<bool> {
        let Some(room) = self.get(stream_id).await else {
            return Ok(false);
        };
        {
            let mut st = room.state.lock().await;
            if !st.participants.is_empty() {
                return Err(AppError::Validation("room has participants".into()));
            }
            if st.lifecycle == RoomLifecycle::Deleted {
                return Ok(false);
            }
            st.lifecycle = RoomLifecycle::Deleted;
        }
        self.finish_delete(&room).await;
        Ok(true)
    }

    /// Force-closes a room regardless of participants (worker death).
    /// Returns the evicted connections so the caller can notify them.
    pub async fn close_room(&self, stream_id: Uuid) -> AppResult<Vec<ConnectionId>> {
        let Some(room) = self.get(stream_id).await else {
            return Ok(Vec::new());
        };

        let (evicted, teardowns) = {
            let mut st = room.state.lock().await;
            if st.lifecycle == RoomLifecycle::Deleted {
                return Ok(Vec::new());
            }
            let evicted: Vec<ConnectionId> = st.participants.keys().copied().collect();
            let mut teardowns = Vec::new();
            for (_, mut session) in st.participants.drain() {
                metrics::participant_left(session.role.as_str());
                teardowns.push(session.drain_media());
            }
            st.producers.clear();
            st.consumers.clear();
            st.viewer_count = 0;
            st.performer_count = 0;
            st.lifecycle = RoomLifecycle::Deleted;
            (evicted, teardowns)
        };

        {
            let mut connections = self.connections.write().await;
            for conn_id in &evicted {
                connections.remove(conn_id);
            }
        }
        for teardown in teardowns {
            teardown.close_all().await;
        }
        self.finish_delete(&room).await;
        Ok(evicted)
    }

    /// Deletes draining rooms whose inactivity threshold has elapsed.
    /// Returns how many were deleted.
    pub async fn sweep_inactive(&self) -> usize {
        let threshold = self.cfg.inactivity_threshold;
        let candidates: Vec<Uuid> = {
            let rooms = self.rooms.read().await;
            let mut expired = Vec::new();
            for (stream_id, room) in rooms.iter() {
                let st = room.state.lock().await;
                if st.lifecycle == RoomLifecycle::Draining
                    && st.last_activity.elapsed() >= threshold
                {
                    expired.push(*stream_id);
                }
            }
            expired
        };

        let mut deleted = 0;
        for stream_id in candidates {
            if self.delete_if_still_expired(stream_id, threshold).await {
                deleted += 1;
            }
        }
        if deleted > 0 {
            tracing::info!(deleted, "swept inactive rooms");
        }
        deleted
    }

    /// Re-checks under the room lock: a join racing the sweep wins.
    async fn delete_if_still_expired(
        &self,
        stream_id: Uuid,
        threshold: std::time::Duration,
    ) -> bool {
        let Some(room) = self.get(stream_id).await else {
            return false;
        };
        {
            let mut st = room.state.lock().await;
            if st.lifecycle != RoomLifecycle::Draining
                || !st.participants.is_empty()
                || st.last_activity.elapsed() < threshold
            {
                return false;
            }
            st.lifecycle = RoomLifecycle::Deleted;
        }
        self.finish_delete(&room).await;
        true
    }

    async fn finish_delete(&self, room: &Arc<Room>) {
        {
            let mut rooms = self.rooms.write().await;
            if let Some(current) = rooms.get(&room.stream_id) {
                if Arc::ptr_eq(current, room) {
                    rooms.remove(&room.stream_id);
                }
            }
        }
        room.router.close().await;
        self.workers.release(room.slot, room.worker_id).await;
        metrics::room_closed();
        tracing::info!(room_id = %room.id, stream_id = %room.stream_id, "room deleted");
    }

    /// Engine told us a producer is gone: find and detach it.
    pub async fn detach_producer(
        &self,
        producer_id: ProducerId,
    ) -> Option<(Arc<Room>, ConnectionId, Arc<dyn SfuProducer>)> {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        for room in rooms {
            if let Some((owner, producer)) = room.detach_producer(producer_id).await {
                return Some((room, owner, producer));
            }
        }
        None
    }

    pub async fn detach_consumer(
        &self,
        consumer_id: ConsumerId,
    ) -> Option<(Arc<Room>, ConnectionId, Arc<dyn SfuConsumer>)> {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        for room in rooms {
            if let Some((owner, consumer)) = room.detach_consumer(consumer_id).await {
                return Some((room, owner, consumer));
            }
        }
        None
    }

    pub async fn detach_transport(
        &self,
        transport_id: TransportId,
    ) -> Option<(Arc<Room>, ConnectionId, MediaTeardown)> {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        for room in rooms {
            if let Some((owner, teardown)) = room.detach_transport(transport_id).await {
                return Some((room, owner, teardown));
            }
        }
        None
    }
}
