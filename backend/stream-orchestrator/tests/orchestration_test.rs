//! End-to-end orchestration scenarios against the mock engine: join/leave
//! lifecycle, media object bookkeeping, and engine-event handling.

mod common;

use common::*;
use serde_json::json;
use stream_orchestrator::engine::{EngineEvent, MediaKind, TransportDirection};
use stream_orchestrator::services::{Role, RoomLifecycle};
use stream_orchestrator::signaling::{ClientEvent, ServerEvent};
use uuid::Uuid;

#[tokio::test]
async fn test_join_then_leave_restores_room_state() {
    let h = harness().await;
    let host = Uuid::new_v4();
    let stream_id = h.directory.add_live_stream(host);

    let performer = join_performer(&h, stream_id, host).await;
    publish_audio(&h, &performer).await;

    let viewer = join_viewer(&h, stream_id).await;
    h.gateway
        .handle_event(
            &viewer,
            ClientEvent::CreateTransport {
                direction: TransportDirection::Recv,
            },
        )
        .await
        .unwrap();

    let room = h.rooms.get(stream_id).await.unwrap();
    assert_eq!(room.participant_count().await, 2);
    assert_eq!(room.counts().await, (1, 1));

    h.gateway
        .handle_event(&viewer, ClientEvent::LeaveStream)
        .await
        .unwrap();

    assert_eq!(room.participant_count().await, 1);
    assert_eq!(room.counts().await, (0, 1));
    // Only the performer's producer remains tracked.
    assert_eq!(room.media_counts().await, (1, 0));

    let left = h
        .broadcaster
        .events()
        .into_iter()
        .any(|e| matches!(e, ServerEvent::UserLeft { user_id, .. } if user_id == viewer.user_id));
    assert!(left, "user_left was not broadcast");
}

#[tokio::test]
async fn test_room_capacity_is_enforced() {
    let h = harness().await; // max_participants = 3
    let host = Uuid::new_v4();
    let stream_id = h.directory.add_live_stream(host);

    join_performer(&h, stream_id, host).await;
    join_viewer(&h, stream_id).await;
    join_viewer(&h, stream_id).await;

    let fourth = conn(Uuid::new_v4());
    let err = h
        .gateway
        .handle_event(
            &fourth,
            ClientEvent::JoinStream {
                stream_id,
                role: Role::Viewer,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "capacity");

    let room = h.rooms.get(stream_id).await.unwrap();
    assert_eq!(room.participant_count().await, 3);
}

#[tokio::test]
async fn test_performer_join_requires_host_identity() {
    let h = harness().await;
    let host = Uuid::new_v4();
    let stream_id = h.directory.add_live_stream(host);

    let impostor = conn(Uuid::new_v4());
    let err = h
        .gateway
        .handle_event(
            &impostor,
            ClientEvent::JoinStream {
                stream_id,
                role: Role::Performer,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "authorization");

    // Rejected before any room was created: state unchanged.
    assert!(h.rooms.get(stream_id).await.is_none());
    assert_eq!(h.rooms.room_count().await, 0);
}

#[tokio::test]
async fn test_viewer_join_requires_live_stream() {
    let h = harness().await;
    let host = Uuid::new_v4();
    let stream_id = h.directory.add_live_stream(host);
    h.directory.set_live(stream_id, false);

    let viewer = conn(Uuid::new_v4());
    let err = h
        .gateway
        .handle_event(
            &viewer,
            ClientEvent::JoinStream {
                stream_id,
                role: Role::Viewer,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "validation");
    assert!(h.rooms.get(stream_id).await.is_none());
}

#[tokio::test]
async fn test_join_unknown_stream_is_not_found() {
    let h = harness().await;
    let viewer = conn(Uuid::new_v4());
    let err = h
        .gateway
        .handle_event(
            &viewer,
            ClientEvent::JoinStream {
                stream_id: Uuid::new_v4(),
                role: Role::Viewer,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");
}

#[tokio::test]
async fn test_produce_and_consume_flow() {
    let h = harness().await;
    let host = Uuid::new_v4();
    let stream_id = h.directory.add_live_stream(host);

    let viewer = join_viewer(&h, stream_id).await;
    let performer = join_performer(&h, stream_id, host).await;

    let producer = publish_audio(&h, &performer).await;

    // The viewer (already in the room) was told about the new producer.
    let announced = h
        .broadcaster
        .events_for(viewer.conn_id)
        .into_iter()
        .any(|e| matches!(e, ServerEvent::NewProducer { producer_id, kind, .. }
            if producer_id == producer.producer_id && kind == MediaKind::Audio));
    assert!(announced, "new_producer was not announced to the room");

    h.gateway
        .handle_event(
            &viewer,
            ClientEvent::CreateTransport {
                direction: TransportDirection::Recv,
            },
        )
        .await
        .unwrap();
    let consumer = expect_consumer(
        h.gateway
            .handle_event(
                &viewer,
                ClientEvent::CreateConsumer {
                    producer_id: producer.producer_id,
                    rtp_capabilities: json!({}),
                },
            )
            .await
            .unwrap(),
    );
    assert_eq!(consumer.producer_id, producer.producer_id);

    let room = h.rooms.get(stream_id).await.unwrap();
    assert_eq!(room.media_counts().await, (1, 1));
}

#[tokio::test]
async fn test_producer_requires_performer_role() {
    let h = harness().await;
    let host = Uuid::new_v4();
    let stream_id = h.directory.add_live_stream(host);

    join_performer(&h, stream_id, host).await;
    let viewer = join_viewer(&h, stream_id).await;
    h.gateway
        .handle_event(
            &viewer,
            ClientEvent::CreateTransport {
                direction: TransportDirection::Send,
            },
        )
        .await
        .unwrap();

    let err = h
        .gateway
        .handle_event(
            &viewer,
            ClientEvent::CreateProducer {
                kind: MediaKind::Video,
                rtp_parameters: json!({}),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "authorization");
}

#[tokio::test]
async fn test_producer_requires_send_transport() {
    let h = harness().await;
    let host = Uuid::new_v4();
    let stream_id = h.directory.add_live_stream(host);
    let performer = join_performer(&h, stream_id, host).await;

    let err = h
        .gateway
        .handle_event(
            &performer,
            ClientEvent::CreateProducer {
                kind: MediaKind::Audio,
                rtp_parameters: json!({}),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");
}

#[tokio::test]
async fn test_consumer_requires_known_producer_and_capabilities() {
    let h = harness().await;
    let host = Uuid::new_v4();
    let stream_id = h.directory.add_live_stream(host);

    let performer = join_performer(&h, stream_id, host).await;
    let producer = publish_audio(&h, &performer).await;

    let viewer = join_viewer(&h, stream_id).await;
    h.gateway
        .handle_event(
            &viewer,
            ClientEvent::CreateTransport {
                direction: TransportDirection::Recv,
            },
        )
        .await
        .unwrap();

    // Unknown producer id.
    let err = h
        .gateway
        .handle_event(
            &viewer,
            ClientEvent::CreateConsumer {
                producer_id: stream_orchestrator::engine::ProducerId::new(),
                rtp_capabilities: json!({}),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");

    // Capabilities the router cannot satisfy.
    h.engine
        .can_consume
        .store(false, std::sync::atomic::Ordering::SeqCst);
    let err = h
        .gateway
        .handle_event(
            &viewer,
            ClientEvent::CreateConsumer {
                producer_id: producer.producer_id,
                rtp_capabilities: json!({}),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "incompatible_capabilities");
}

#[tokio::test]
async fn test_second_transport_replaces_and_closes_previous() {
    let h = harness().await;
    let host = Uuid::new_v4();
    let stream_id = h.directory.add_live_stream(host);
    let performer = join_performer(&h, stream_id, host).await;

    let first = expect_transport(
        h.gateway
            .handle_event(
                &performer,
                ClientEvent::CreateTransport {
                    direction: TransportDirection::Send,
                },
            )
            .await
            .unwrap(),
    );
    let producer = expect_producer(
        h.gateway
            .handle_event(
                &performer,
                ClientEvent::CreateProducer {
                    kind: MediaKind::Audio,
                    rtp_parameters: json!({}),
                },
            )
            .await
            .unwrap(),
    );

    let second = expect_transport(
        h.gateway
            .handle_event(
                &performer,
                ClientEvent::CreateTransport {
                    direction: TransportDirection::Send,
                },
            )
            .await
            .unwrap(),
    );
    assert_ne!(first.transport_id, second.transport_id);

    // The old transport and everything that rode it were closed.
    assert!(h
        .engine
        .closed
        .contains(&format!("transport:{}", first.transport_id)));
    assert!(h
        .engine
        .closed
        .contains(&format!("producer:{}", producer.producer_id)));

    let room = h.rooms.get(stream_id).await.unwrap();
    assert_eq!(room.media_counts().await, (0, 0));
}

#[tokio::test]
async fn test_connect_transport_delegates_to_engine() {
    let h = harness().await;
    let host = Uuid::new_v4();
    let stream_id = h.directory.add_live_stream(host);
    let performer = join_performer(&h, stream_id, host).await;

    let transport = expect_transport(
        h.gateway
            .handle_event(
                &performer,
                ClientEvent::CreateTransport {
                    direction: TransportDirection::Send,
                },
            )
            .await
            .unwrap(),
    );

    h.gateway
        .handle_event(
            &performer,
            ClientEvent::ConnectTransport {
                transport_id: transport.transport_id,
                dtls_parameters: json!({ "role": "client" }),
            },
        )
        .await
        .unwrap();

    // Connecting an unknown transport fails cleanly.
    let err = h
        .gateway
        .handle_event(
            &performer,
            ClientEvent::ConnectTransport {
                transport_id: stream_orchestrator::engine::TransportId::new(),
                dtls_parameters: json!({}),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");
}

#[tokio::test]
async fn test_disconnect_cleans_up_and_drains_room() {
    let h = harness().await;
    let host = Uuid::new_v4();
    let stream_id = h.directory.add_live_stream(host);
    let performer = join_performer(&h, stream_id, host).await;
    publish_audio(&h, &performer).await;

    let room = h.rooms.get(stream_id).await.unwrap();
    h.gateway.disconnect(performer.conn_id).await;

    assert_eq!(room.participant_count().await, 0);
    assert_eq!(room.media_counts().await, (0, 0));
    assert_eq!(room.lifecycle().await, RoomLifecycle::Draining);

    // Second disconnect for the same connection is a no-op.
    h.gateway.disconnect(performer.conn_id).await;
}

#[tokio::test]
async fn test_engine_producer_closed_event_detaches_and_broadcasts() {
    let h = harness().await;
    let host = Uuid::new_v4();
    let stream_id = h.directory.add_live_stream(host);

    let viewer = join_viewer(&h, stream_id).await;
    let performer = join_performer(&h, stream_id, host).await;
    let producer = publish_audio(&h, &performer).await;

    h.engine.emit(EngineEvent::ProducerClosed {
        producer_id: producer.producer_id,
    });
    settle().await;

    let room = h.rooms.get(stream_id).await.unwrap();
    assert_eq!(room.media_counts().await, (0, 0));

    let notified = h
        .broadcaster
        .events_for(viewer.conn_id)
        .into_iter()
        .any(|e| matches!(e, ServerEvent::ProducerClosed { producer_id }
            if producer_id == producer.producer_id));
    assert!(notified, "producer_closed was not broadcast");
}

#[tokio::test]
async fn test_engine_consumer_closed_event_notifies_owner() {
    let h = harness().await;
    let host = Uuid::new_v4();
    let stream_id = h.directory.add_live_stream(host);

    let performer = join_performer(&h, stream_id, host).await;
    let producer = publish_audio(&h, &performer).await;

    let viewer = join_viewer(&h, stream_id).await;
    h.gateway
        .handle_event(
            &viewer,
            ClientEvent::CreateTransport {
                direction: TransportDirection::Recv,
            },
        )
        .await
        .unwrap();
    let consumer = expect_consumer(
        h.gateway
            .handle_event(
                &viewer,
                ClientEvent::CreateConsumer {
                    producer_id: producer.producer_id,
                    rtp_capabilities: json!({}),
                },
            )
            .await
            .unwrap(),
    );

    h.engine.emit(EngineEvent::ConsumerClosed {
        consumer_id: consumer.consumer_id,
    });
    settle().await;

    let room = h.rooms.get(stream_id).await.unwrap();
    assert_eq!(room.media_counts().await, (1, 0));

    let notified = h
        .broadcaster
        .events_for(viewer.conn_id)
        .into_iter()
        .any(|e| matches!(e, ServerEvent::ConsumerClosed { consumer_id }
            if consumer_id == consumer.consumer_id));
    assert!(notified, "consumer_closed was not sent to the owner");
}

#[tokio::test]
async fn test_performer_join_and_leave_broadcast_stream_lifecycle() {
    let h = harness().await;
    let host = Uuid::new_v4();
    let stream_id = h.directory.add_live_stream(host);

    let viewer = join_viewer(&h, stream_id).await;
    let performer = join_performer(&h, stream_id, host).await;

    let started = h
        .broadcaster
        .events_for(viewer.conn_id)
        .into_iter()
        .any(|e| matches!(e, ServerEvent::StreamStarted { stream_id: s } if s == stream_id));
    assert!(started, "stream_started was not broadcast on performer join");

    h.gateway
        .handle_event(&performer, ClientEvent::LeaveStream)
        .await
        .unwrap();

    let ended = h
        .broadcaster
        .events_for(viewer.conn_id)
        .into_iter()
        .any(|e| matches!(e, ServerEvent::StreamEnded { stream_id: s, .. } if s == stream_id));
    assert!(ended, "stream_ended was not broadcast on performer leave");
}

#[tokio::test]
async fn test_viewer_deltas_flush_as_single_net_update() {
    let h = harness().await;
    let host = Uuid::new_v4();
    let stream_id = h.directory.add_live_stream(host);

    join_performer(&h, stream_id, host).await;
    let v1 = join_viewer(&h, stream_id).await;
    join_viewer(&h, stream_id).await;
    h.gateway
        .handle_event(&v1, ClientEvent::LeaveStream)
        .await
        .unwrap();

    h.viewers.flush_once().await;
    let applied = h.viewer_store.applied.lock().unwrap().clone();
    assert_eq!(applied, vec![(stream_id, 1)]);
}
