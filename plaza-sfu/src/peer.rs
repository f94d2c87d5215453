//! Peer: one connected participant's media-plane state
//!
//! A peer owns the transport/producer/consumer maps for a single signaling
//! connection and forwards media-engine calls scoped to those maps. All map
//! mutation happens synchronously between engine awaits; no lock is held
//! across a suspension point. Cleanup paths are best-effort and never fail.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::{
    ConsumerInfo, ConsumerLayers, DtlsParameters, MediaEngine, ProducerInfo, RtpCapabilities,
    RtpParameters, TransportInfo,
};
use crate::error::Result;
use crate::resources::{
    ConsumerRecord, ProducerRecord, TransportDirection, TransportRecord, TransportState,
};
use crate::room::RoomEvent;
use crate::types::{ConsumerId, MediaKind, PeerId, ProducerId, TransportId};

#[derive(Default)]
struct PeerMedia {
    transports: HashMap<TransportId, TransportRecord>,
    producers: HashMap<ProducerId, ProducerRecord>,
    consumers: HashMap<ConsumerId, ConsumerRecord>,
}

/// Resources released by a transport close, reported back to the room so it
/// can cascade across peers.
#[derive(Debug, Default)]
pub struct ClosedResources {
    pub producers: Vec<ProducerRecord>,
    pub consumers: Vec<ConsumerRecord>,
}

impl ClosedResources {
    fn merge(&mut self, other: Self) {
        self.producers.extend(other.producers);
        self.consumers.extend(other.consumers);
    }
}

pub struct Peer {
    id: PeerId,
    display_name: String,
    joined_at: DateTime<Utc>,
    engine: Arc<dyn MediaEngine>,
    media: Mutex<PeerMedia>,
    // fire-and-forget outbound event channel to this peer's connection
    events: mpsc::UnboundedSender<RoomEvent>,
}

impl Peer {
    pub fn new(
        id: PeerId,
        display_name: impl Into<String>,
        engine: Arc<dyn MediaEngine>,
        events: mpsc::UnboundedSender<RoomEvent>,
    ) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            joined_at: Utc::now(),
            engine,
            media: Mutex::new(PeerMedia::default()),
            events,
        }
    }

    #[must_use]
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    #[must_use]
    pub fn joined_at(&self) -> DateTime<Utc> {
        self.joined_at
    }

    /// Deliver an event to this peer's connection. Fire-and-forget: a
    /// disconnected receiver is not an error here, disconnect cleanup runs
    /// through `Room::remove_peer`.
    pub fn send(&self, event: RoomEvent) {
        let _ = self.events.send(event);
    }

    /// Register a freshly created transport
    pub fn add_transport(&self, info: &TransportInfo, direction: TransportDirection) {
        self.media.lock().transports.insert(
            info.id.clone(),
            TransportRecord {
                id: info.id.clone(),
                direction,
                state: TransportState::New,
            },
        );
    }

    /// Forward DTLS parameters to the named transport. Unknown transports
    /// are a silent no-op: late signaling after cleanup is tolerated.
    pub async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        if !self.media.lock().transports.contains_key(transport_id) {
            return Ok(());
        }
        self.engine
            .connect_transport(transport_id, dtls_parameters)
            .await?;
        if let Some(transport) = self.media.lock().transports.get_mut(transport_id) {
            transport.state = TransportState::Connected;
        }
        Ok(())
    }

    /// Create a producer on the named transport. Returns `None` when the
    /// transport is not registered to this peer.
    pub async fn create_producer(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Option<ProducerInfo>> {
        if !self.media.lock().transports.contains_key(transport_id) {
            return Ok(None);
        }
        let info = self.engine.produce(transport_id, kind, rtp_parameters).await?;
        self.media.lock().producers.insert(
            info.id.clone(),
            ProducerRecord {
                id: info.id.clone(),
                transport_id: transport_id.clone(),
                kind: info.kind,
                paused: info.paused,
            },
        );
        Ok(Some(info))
    }

    /// Create a consumer on the named transport. Returns `None` when the
    /// transport is not registered to this peer. Layered consumers start
    /// with the two highest layers preferred.
    pub async fn create_consumer(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<Option<ConsumerInfo>> {
        if !self.media.lock().transports.contains_key(transport_id) {
            return Ok(None);
        }
        let info = self
            .engine
            .consume(transport_id, producer_id, rtp_capabilities)
            .await?;

        let mut preferred_layers = None;
        if info.consumer_type.is_layered() {
            let layers = ConsumerLayers::highest();
            if let Err(e) = self.engine.set_preferred_layers(&info.id, layers).await {
                self.engine.close_consumer(&info.id).await;
                return Err(e);
            }
            preferred_layers = Some(layers);
        }

        self.media.lock().consumers.insert(
            info.id.clone(),
            ConsumerRecord {
                id: info.id.clone(),
                transport_id: transport_id.clone(),
                producer_id: producer_id.clone(),
                kind: info.kind,
                consumer_type: info.consumer_type,
                paused: false,
                preferred_layers,
            },
        );
        Ok(Some(info))
    }

    /// Close the named producer. Best-effort: unknown ids are ignored.
    pub async fn close_producer(&self, producer_id: &ProducerId) {
        let removed = self.media.lock().producers.remove(producer_id).is_some();
        if removed {
            self.engine.close_producer(producer_id).await;
            debug!(peer_id = %self.id, producer_id = %producer_id, "producer closed");
        }
    }

    /// Close the named consumer, returning its record if it was registered.
    pub async fn close_consumer(&self, consumer_id: &ConsumerId) -> Option<ConsumerRecord> {
        let record = self.media.lock().consumers.remove(consumer_id);
        if record.is_some() {
            self.engine.close_consumer(consumer_id).await;
        }
        record
    }

    /// Drop a consumer from the map without touching the engine.
    /// House-keeping for cascades where the engine side is already gone.
    pub fn remove_consumer(&self, consumer_id: &ConsumerId) -> Option<ConsumerRecord> {
        self.media.lock().consumers.remove(consumer_id)
    }

    /// Close a transport and everything depending on it. The dependency
    /// walk is explicit over this peer's records, so the cascade is
    /// deterministic regardless of engine event ordering.
    pub async fn close_transport(&self, transport_id: &TransportId) -> ClosedResources {
        let mut closed = ClosedResources::default();
        {
            let mut media = self.media.lock();
            if media.transports.remove(transport_id).is_none() {
                return closed;
            }
            media.producers.retain(|_, p| {
                if p.transport_id == *transport_id {
                    closed.producers.push(p.clone());
                    false
                } else {
                    true
                }
            });
            media.consumers.retain(|_, c| {
                if c.transport_id == *transport_id {
                    closed.consumers.push(c.clone());
                    false
                } else {
                    true
                }
            });
        }

        for producer in &closed.producers {
            self.engine.close_producer(&producer.id).await;
        }
        for consumer in &closed.consumers {
            self.engine.close_consumer(&consumer.id).await;
        }
        self.engine.close_transport(transport_id).await;

        debug!(
            peer_id = %self.id,
            transport_id = %transport_id,
            producers = closed.producers.len(),
            consumers = closed.consumers.len(),
            "transport closed"
        );
        closed
    }

    /// Release every transport this peer owns, cascading per transport.
    pub async fn close_all(&self) -> ClosedResources {
        let transport_ids: Vec<TransportId> =
            self.media.lock().transports.keys().cloned().collect();
        let mut closed = ClosedResources::default();
        for transport_id in transport_ids {
            closed.merge(self.close_transport(&transport_id).await);
        }
        closed
    }

    #[must_use]
    pub fn producer_ids(&self) -> Vec<ProducerId> {
        self.media.lock().producers.keys().cloned().collect()
    }

    #[must_use]
    pub fn has_producer(&self, producer_id: &ProducerId) -> bool {
        self.media.lock().producers.contains_key(producer_id)
    }

    #[must_use]
    pub fn has_consumer(&self, consumer_id: &ConsumerId) -> bool {
        self.media.lock().consumers.contains_key(consumer_id)
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.media.lock().transports.len()
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.media.lock().producers.len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.media.lock().consumers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::engine::{LocalEngine, RtpCodecCapability};

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

    async fn peer_with_transport(
        engine: &Arc<LocalEngine>,
    ) -> (Peer, TransportId, mpsc::UnboundedReceiver<RoomEvent>) {
        let shared: Arc<dyn MediaEngine> = engine.clone();
        let worker = engine
            .create_worker(&crate::engine::WorkerSettings {
                rtc_min_port: 9000,
                rtc_max_port: 9501,
                log_level: "warn".to_string(),
                log_tags: vec![],
            })
            .await
            .unwrap();
        let router = engine.create_router(&worker, &[]).await.unwrap();
        let info = engine
            .create_transport(&router, &TransportConfig::default().to_options())
            .await
            .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Peer::new(PeerId::new("p1"), "alice", shared, tx);
        peer.add_transport(&info, TransportDirection::Send);
        (peer, info.id, rx)
    }

    #[tokio::test]
    async fn test_connect_unknown_transport_is_noop() {
        let engine = Arc::new(LocalEngine::new());
        let (peer, _, _rx) = peer_with_transport(&engine).await;

        let result = peer
            .connect_transport(
                &TransportId::new("missing"),
                DtlsParameters(serde_json::json!({})),
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_create_producer_missing_transport() {
        let engine = Arc::new(LocalEngine::new());
        let (peer, _, _rx) = peer_with_transport(&engine).await;

        let produced = peer
            .create_producer(
                &TransportId::new("missing"),
                MediaKind::Audio,
                RtpParameters(serde_json::json!({})),
            )
            .await
            .unwrap();
        assert!(produced.is_none());
        assert_eq!(peer.producer_count(), 0);
    }

    #[tokio::test]
    async fn test_close_transport_cascades_all_dependents() {
        let engine = Arc::new(LocalEngine::new());
        let (peer, transport_id, _rx) = peer_with_transport(&engine).await;

        let p1 = peer
            .create_producer(
                &transport_id,
                MediaKind::Audio,
                RtpParameters(serde_json::json!({})),
            )
            .await
            .unwrap()
            .unwrap();
        let p2 = peer
            .create_producer(
                &transport_id,
                MediaKind::Video,
                RtpParameters(serde_json::json!({})),
            )
            .await
            .unwrap()
            .unwrap();
        let c1 = peer
            .create_consumer(&transport_id, &p1.id, &caps(&[MediaKind::Audio]))
            .await
            .unwrap()
            .unwrap();

        let closed = peer.close_transport(&transport_id).await;
        // exactly N producers + M consumers closed
        assert_eq!(closed.producers.len(), 2);
        assert_eq!(closed.consumers.len(), 1);
        assert_eq!(peer.transport_count(), 0);
        assert_eq!(peer.producer_count(), 0);
        assert_eq!(peer.consumer_count(), 0);
        assert!(!engine.has_producer(&p1.id));
        assert!(!engine.has_producer(&p2.id));
        assert!(!engine.has_consumer(&c1.id));
    }

    #[tokio::test]
    async fn test_layered_consumer_prefers_highest_layers() {
        let engine = Arc::new(LocalEngine::new());
        let (peer, transport_id, _rx) = peer_with_transport(&engine).await;

        let producer = peer
            .create_producer(
                &transport_id,
                MediaKind::Video,
                RtpParameters(serde_json::json!({
                    "encodings": [{"rid": "r0"}, {"rid": "r1"}, {"rid": "r2"}],
                })),
            )
            .await
            .unwrap()
            .unwrap();
        let consumer = peer
            .create_consumer(&transport_id, &producer.id, &caps(&[MediaKind::Video]))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            engine.consumer_preferred_layers(&consumer.id),
            Some(ConsumerLayers::highest())
        );
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let engine = Arc::new(LocalEngine::new());
        let (peer, transport_id, _rx) = peer_with_transport(&engine).await;

        peer.close_producer(&ProducerId::new("never-existed")).await;
        assert!(peer.close_consumer(&ConsumerId::new("never-existed")).await.is_none());
        assert!(peer.remove_consumer(&ConsumerId::new("never-existed")).is_none());

        let producer = peer
            .create_producer(
                &transport_id,
                MediaKind::Audio,
                RtpParameters(serde_json::json!({})),
            )
            .await
            .unwrap()
            .unwrap();
        let consumer = peer
            .create_consumer(&transport_id, &producer.id, &caps(&[MediaKind::Audio]))
            .await
            .unwrap()
            .unwrap();
        // map-only removal leaves the engine-side consumer alone
        assert!(peer.remove_consumer(&consumer.id).is_some());
        assert_eq!(peer.consumer_count(), 0);
        assert!(engine.has_consumer(&consumer.id));

        let first = peer.close_transport(&transport_id).await;
        assert_eq!(first.producers.len(), 1);
        assert!(first.consumers.is_empty());
        let second = peer.close_transport(&transport_id).await;
        assert!(second.producers.is_empty() && second.consumers.is_empty());
    }
}
