//! End-to-end orchestration flows over the in-process engine:
//! room creation and worker binding, stream discovery, consume cascades
//! and disconnect cleanup.

use std::sync::Arc;
use tokio::sync::mpsc;

use plaza_sfu::config::{MediaConfig, WorkerConfig};
use plaza_sfu::engine::{
    LocalEngine, MediaEngine, RtpCapabilities, RtpCodecCapability, RtpParameters,
};
use plaza_sfu::peer::Peer;
use plaza_sfu::registry::RoomRegistry;
use plaza_sfu::resources::TransportDirection;
use plaza_sfu::room::RoomEvent;
use plaza_sfu::types::{MediaKind, PeerId, RoomId};
use plaza_sfu::worker::WorkerPool;

struct Harness {
    engine: Arc<dyn MediaEngine>,
    registry: Arc<RoomRegistry>,
}

async fn harness(workers: usize) -> Harness {
    let engine: Arc<dyn MediaEngine> = Arc::new(LocalEngine::new());
    let pool = WorkerPool::start(
        &*engine,
        &WorkerConfig {
            num_workers: workers,
            ..WorkerConfig::default()
        },
    )
    .await
    .expect("worker pool");
    let registry = Arc::new(RoomRegistry::new(
        engine.clone(),
        Arc::new(pool),
        MediaConfig::default(),
    ));
    Harness { engine, registry }
}

fn caps(kinds: &[MediaKind]) -> RtpCapabilities {
    RtpCapabilities {
        codecs: kinds
            .iter()
            .map(|&kind| RtpCodecCapability {
                kind,
                mime_type: match kind {
                    MediaKind::Audio => "audio/opus".to_string(),
                    MediaKind::Video => "video/VP8".to_string(),
                },
                clock_rate: 90000,
                channels: None,
                parameters: serde_json::Value::Null,
            })
            .collect(),
    }
}

fn join(
    h: &Harness,
    room: &Arc<plaza_sfu::Room>,
    id: &str,
    name: &str,
) -> mpsc::UnboundedReceiver<RoomEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    room.add_peer(Arc::new(Peer::new(
        PeerId::new(id),
        name,
        h.engine.clone(),
        tx,
    )));
    rx
}

#[tokio::test]
async fn worker_binding_survives_recreate() {
    let h = harness(2).await;

    let (r1, created) = h.registry.get_or_create(&RoomId::new("R1")).await.expect("create");
    assert!(created);
    let bound_worker = r1.worker_id().clone();

    // a second createRoom for the same id observes the existing room
    let (again, created) = h.registry.get_or_create(&RoomId::new("R1")).await.expect("lookup");
    assert!(!created);
    assert!(Arc::ptr_eq(&r1, &again));
    assert_eq!(again.worker_id(), &bound_worker);

    // the next distinct room lands on the other worker
    let (r2, _) = h.registry.get_or_create(&RoomId::new("R2")).await.expect("create");
    assert_ne!(r2.worker_id(), &bound_worker);
}

#[tokio::test]
async fn full_call_lifecycle() {
    let h = harness(1).await;
    let (room, _) = h.registry.get_or_create(&RoomId::new("call")).await.expect("create");

    let _rx_a = join(&h, &room, "a", "alice");
    assert!(room.producer_list().is_empty());

    // alice sends audio plus simulcast video
    let transport_a = room
        .create_transport(&PeerId::new("a"), TransportDirection::Send)
        .await
        .expect("transport")
        .id;
    let audio = room
        .produce(
            &PeerId::new("a"),
            &transport_a,
            MediaKind::Audio,
            RtpParameters(serde_json::json!({})),
        )
        .await
        .expect("produce")
        .expect("audio producer");
    let video = room
        .produce(
            &PeerId::new("a"),
            &transport_a,
            MediaKind::Video,
            RtpParameters(serde_json::json!({
                "encodings": [{"rid": "r0"}, {"rid": "r1"}, {"rid": "r2"}],
            })),
        )
        .await
        .expect("produce")
        .expect("video producer");

    // bob joins later and discovers both streams
    let mut rx_b = join(&h, &room, "b", "bob");
    let discovered = room.producer_list();
    assert_eq!(discovered.len(), 2);
    assert!(discovered.contains(&audio));
    assert!(discovered.contains(&video));

    let transport_b = room
        .create_transport(&PeerId::new("b"), TransportDirection::Recv)
        .await
        .expect("transport")
        .id;
    let audio_consumer = room
        .consume(
            &PeerId::new("b"),
            &transport_b,
            &audio,
            &caps(&[MediaKind::Audio, MediaKind::Video]),
        )
        .await
        .expect("consume audio");
    let video_consumer = room
        .consume(
            &PeerId::new("b"),
            &transport_b,
            &video,
            &caps(&[MediaKind::Audio, MediaKind::Video]),
        )
        .await
        .expect("consume video");
    assert!(video_consumer.consumer_type.is_layered());

    // alice disconnects: bob is told about each dead consumer exactly once
    room.remove_peer(&PeerId::new("a")).await;
    assert!(room.producer_list().is_empty());

    let mut closed = Vec::new();
    while let Ok(event) = rx_b.try_recv() {
        if let RoomEvent::ConsumerClosed { consumer_id } = event {
            closed.push(consumer_id);
        }
    }
    assert_eq!(closed.len(), 2);
    assert!(closed.contains(&audio_consumer.id));
    assert!(closed.contains(&video_consumer.id));

    // bob leaving empties the room; the sweep then reaps it
    room.remove_peer(&PeerId::new("b")).await;
    assert!(room.is_empty());
    assert_eq!(h.registry.sweep_empty().await, 1);
    assert!(h.registry.get(&RoomId::new("call")).is_none());
}

#[tokio::test]
async fn audio_only_receiver_cannot_consume_video() {
    let h = harness(1).await;
    let (room, _) = h.registry.get_or_create(&RoomId::new("strict")).await.expect("create");

    let _rx_a = join(&h, &room, "a", "alice");
    let _rx_b = join(&h, &room, "b", "bob");

    let transport_a = room
        .create_transport(&PeerId::new("a"), TransportDirection::Send)
        .await
        .expect("transport")
        .id;
    let video = room
        .produce(
            &PeerId::new("a"),
            &transport_a,
            MediaKind::Video,
            RtpParameters(serde_json::json!({})),
        )
        .await
        .expect("produce")
        .expect("video producer");

    let transport_b = room
        .create_transport(&PeerId::new("b"), TransportDirection::Recv)
        .await
        .expect("transport")
        .id;
    let refused = room
        .consume(
            &PeerId::new("b"),
            &transport_b,
            &video,
            &caps(&[MediaKind::Audio]),
        )
        .await;
    assert!(refused.is_err());

    // nothing was registered anywhere
    room.remove_peer(&PeerId::new("b")).await;
    assert_eq!(room.producer_list(), vec![video]);
}

#[tokio::test]
async fn concurrent_room_creation_is_single_instance() {
    let h = harness(4).await;

    let mut handles = Vec::new();
    for _ in 0..32 {
        let registry = h.registry.clone();
        handles.push(tokio::spawn(async move {
            registry.get_or_create(&RoomId::new("popular")).await.expect("get_or_create")
        }));
    }

    let mut created = 0;
    let mut first: Option<Arc<plaza_sfu::Room>> = None;
    for handle in handles {
        let (room, was_created) = handle.await.expect("join");
        if was_created {
            created += 1;
        }
        if let Some(existing) = &first {
            assert!(Arc::ptr_eq(existing, &room));
            assert_eq!(existing.worker_id(), room.worker_id());
        } else {
            first = Some(room);
        }
    }
    assert_eq!(created, 1);
    assert_eq!(h.registry.room_count(), 1);
}
