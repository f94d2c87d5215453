//! In-process media engine
//!
//! `LocalEngine` models the complete worker/router/transport/producer/
//! consumer lifecycle without moving any media: creations validate their
//! parent resources, closes cascade through dependents at the handle level,
//! and worker death can be injected to exercise the fail-fast path. It backs
//! the default server mode and every test; a production RTP engine plugs in
//! behind the same [`MediaEngine`] trait.

use async_trait::async_trait;
use nanoid::nanoid;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::debug;

use super::{
    ConsumerInfo, ConsumerLayers, ConsumerType, DtlsParameters, EngineEvent, MediaEngine,
    ProducerInfo, RtpCapabilities, RtpCodecCapability, RtpParameters, TransportInfo,
    TransportOptions, WorkerSettings,
};
use crate::error::{Error, Result};
use crate::types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportId, WorkerId};

const EVENT_CHANNEL_CAPACITY: usize = 16;

struct RouterEntry {
    worker_id: WorkerId,
    media_codecs: Vec<RtpCodecCapability>,
}

impl RouterEntry {
    /// Whether this routing context was created with a codec for the kind
    fn supports_kind(&self, kind: MediaKind) -> bool {
        self.media_codecs.iter().any(|c| c.kind == kind)
    }
}

struct TransportEntry {
    router_id: RouterId,
    connected: bool,
    max_incoming_bitrate: Option<u32>,
}

struct ProducerEntry {
    transport_id: TransportId,
    router_id: RouterId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

struct ConsumerEntry {
    transport_id: TransportId,
    producer_id: ProducerId,
    preferred_layers: Option<ConsumerLayers>,
}

#[derive(Default)]
struct EngineState {
    workers: HashMap<WorkerId, bool>, // id -> alive
    routers: HashMap<RouterId, RouterEntry>,
    transports: HashMap<TransportId, TransportEntry>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
}

pub struct LocalEngine {
    state: Mutex<EngineState>,
    events: broadcast::Sender<EngineEvent>,
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalEngine {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(EngineState::default()),
            events,
        }
    }

    /// Mark a worker dead and notify subscribers. Test/ops hook for the
    /// fail-fast path; a real engine reports death from its worker process.
    pub fn kill_worker(&self, worker_id: &WorkerId) {
        let mut state = self.state.lock();
        if let Some(alive) = state.workers.get_mut(worker_id) {
            *alive = false;
            let _ = self.events.send(EngineEvent::WorkerDied {
                worker_id: worker_id.clone(),
            });
        }
    }

    pub fn has_transport(&self, id: &TransportId) -> bool {
        self.state.lock().transports.contains_key(id)
    }

    pub fn has_producer(&self, id: &ProducerId) -> bool {
        self.state.lock().producers.contains_key(id)
    }

    pub fn has_consumer(&self, id: &ConsumerId) -> bool {
        self.state.lock().consumers.contains_key(id)
    }

    pub fn transport_max_incoming_bitrate(&self, id: &TransportId) -> Option<u32> {
        self.state.lock().transports.get(id).and_then(|t| t.max_incoming_bitrate)
    }

    pub fn consumer_preferred_layers(&self, id: &ConsumerId) -> Option<ConsumerLayers> {
        self.state.lock().consumers.get(id).and_then(|c| c.preferred_layers)
    }

    pub fn transport_connected(&self, id: &TransportId) -> bool {
        self.state.lock().transports.get(id).is_some_and(|t| t.connected)
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    async fn create_worker(&self, _settings: &WorkerSettings) -> Result<WorkerId> {
        let id = WorkerId::new(nanoid!());
        self.state.lock().workers.insert(id.clone(), true);
        debug!(worker_id = %id, "worker created");
        Ok(id)
    }

    async fn create_router(
        &self,
        worker_id: &WorkerId,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<RouterId> {
        let mut state = self.state.lock();
        match state.workers.get(worker_id) {
            Some(true) => {}
            Some(false) => {
                return Err(Error::Engine(format!("worker {worker_id} is dead")));
            }
            None => {
                return Err(Error::Engine(format!("unknown worker {worker_id}")));
            }
        }
        let id = RouterId::new(nanoid!());
        state.routers.insert(
            id.clone(),
            RouterEntry {
                worker_id: worker_id.clone(),
                media_codecs: media_codecs.to_vec(),
            },
        );
        Ok(id)
    }

    async fn close_router(&self, router_id: &RouterId) {
        let mut state = self.state.lock();
        if state.routers.remove(router_id).is_none() {
            return;
        }
        state.transports.retain(|_, t| t.router_id != *router_id);
        state.producers.retain(|_, p| p.router_id != *router_id);
        let live_transports: Vec<TransportId> = state.transports.keys().cloned().collect();
        state
            .consumers
            .retain(|_, c| live_transports.contains(&c.transport_id));
    }

    fn can_consume(
        &self,
        router_id: &RouterId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> bool {
        let state = self.state.lock();
        let Some(router) = state.routers.get(router_id) else {
            return false;
        };
        state.producers.get(producer_id).is_some_and(|p| {
            p.router_id == *router_id
                && router.supports_kind(p.kind)
                && rtp_capabilities.supports_kind(p.kind)
        })
    }

    async fn create_transport(
        &self,
        router_id: &RouterId,
        options: &TransportOptions,
    ) -> Result<TransportInfo> {
        let mut state = self.state.lock();
        if !state.routers.contains_key(router_id) {
            return Err(Error::Engine(format!("unknown router {router_id}")));
        }
        let id = TransportId::new(nanoid!());
        state.transports.insert(
            id.clone(),
            TransportEntry {
                router_id: router_id.clone(),
                connected: false,
                max_incoming_bitrate: None,
            },
        );
        Ok(TransportInfo {
            id: id.clone(),
            ice_parameters: serde_json::json!({
                "usernameFragment": nanoid!(8),
                "password": nanoid!(22),
                "iceLite": true,
            }),
            ice_candidates: serde_json::json!([{
                "foundation": "udpcandidate",
                "ip": options.listen_ip,
                "address": options.announced_ip,
                "port": 0,
                "protocol": if options.prefer_udp { "udp" } else { "tcp" },
                "type": "host",
            }]),
            dtls_parameters: serde_json::json!({
                "role": "auto",
                "fingerprints": [{
                    "algorithm": "sha-256",
                    "value": nanoid!(32),
                }],
            }),
        })
    }

    async fn set_max_incoming_bitrate(
        &self,
        transport_id: &TransportId,
        bitrate: u32,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| Error::Engine(format!("unknown transport {transport_id}")))?;
        transport.max_incoming_bitrate = Some(bitrate);
        Ok(())
    }

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        if !dtls_parameters.0.is_object() {
            return Err(Error::Engine("malformed DTLS parameters".to_string()));
        }
        let mut state = self.state.lock();
        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| Error::Engine(format!("unknown transport {transport_id}")))?;
        transport.connected = true;
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerInfo> {
        let mut state = self.state.lock();
        let router_id = state
            .transports
            .get(transport_id)
            .map(|t| t.router_id.clone())
            .ok_or_else(|| Error::Engine(format!("unknown transport {transport_id}")))?;
        let id = ProducerId::new(nanoid!());
        state.producers.insert(
            id.clone(),
            ProducerEntry {
                transport_id: transport_id.clone(),
                router_id,
                kind,
                rtp_parameters,
            },
        );
        Ok(ProducerInfo {
            id,
            kind,
            paused: false,
        })
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerInfo> {
        let mut state = self.state.lock();
        if !state.transports.contains_key(transport_id) {
            return Err(Error::Engine(format!("unknown transport {transport_id}")));
        }
        let (kind, rtp_parameters, layered) = {
            let producer = state
                .producers
                .get(producer_id)
                .ok_or_else(|| Error::Engine(format!("unknown producer {producer_id}")))?;
            if !rtp_capabilities.supports_kind(producer.kind) {
                return Err(Error::Engine(format!(
                    "capabilities do not cover {} producer {producer_id}",
                    producer.kind
                )));
            }
            (
                producer.kind,
                producer.rtp_parameters.clone(),
                producer.kind == MediaKind::Video && producer.rtp_parameters.encoding_count() > 1,
            )
        };
        let id = ConsumerId::new(nanoid!());
        state.consumers.insert(
            id.clone(),
            ConsumerEntry {
                transport_id: transport_id.clone(),
                producer_id: producer_id.clone(),
                preferred_layers: None,
            },
        );
        Ok(ConsumerInfo {
            id,
            producer_id: producer_id.clone(),
            kind,
            rtp_parameters,
            consumer_type: if layered {
                ConsumerType::Simulcast
            } else {
                ConsumerType::Simple
            },
            producer_paused: false,
        })
    }

    async fn set_preferred_layers(
        &self,
        consumer_id: &ConsumerId,
        layers: ConsumerLayers,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let consumer = state
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| Error::Engine(format!("unknown consumer {consumer_id}")))?;
        consumer.preferred_layers = Some(layers);
        Ok(())
    }

    async fn close_transport(&self, transport_id: &TransportId) {
        let mut state = self.state.lock();
        if state.transports.remove(transport_id).is_none() {
            return;
        }
        state.producers.retain(|_, p| p.transport_id != *transport_id);
        state.consumers.retain(|_, c| c.transport_id != *transport_id);
    }

    async fn close_producer(&self, producer_id: &ProducerId) {
        let mut state = self.state.lock();
        if state.producers.remove(producer_id).is_none() {
            return;
        }
        state.consumers.retain(|_, c| c.producer_id != *producer_id);
    }

    async fn close_consumer(&self, consumer_id: &ConsumerId) {
        self.state.lock().consumers.remove(consumer_id);
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_caps() -> RtpCapabilities {
        RtpCapabilities {
            codecs: vec![RtpCodecCapability {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: Some(2),
                parameters: serde_json::Value::Null,
            }],
        }
    }

    fn all_caps() -> RtpCapabilities {
        let mut caps = audio_caps();
        caps.codecs.push(RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: None,
            parameters: serde_json::Value::Null,
        });
        caps
    }

    fn worker_settings() -> WorkerSettings {
        WorkerSettings {
            rtc_min_port: 9000,
            rtc_max_port: 9501,
            log_level: "warn".to_string(),
            log_tags: vec![],
        }
    }

    async fn setup(engine: &LocalEngine) -> (WorkerId, RouterId, TransportId) {
        let worker = engine.create_worker(&worker_settings()).await.unwrap();
        let codecs = crate::config::RouterConfig::default().media_codecs;
        let router = engine.create_router(&worker, &codecs).await.unwrap();
        let options = crate::config::TransportConfig::default().to_options();
        let transport = engine.create_transport(&router, &options).await.unwrap();
        (worker, router, transport.id)
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let engine = LocalEngine::new();
        let (_, router, transport) = setup(&engine).await;

        engine
            .connect_transport(&transport, DtlsParameters(serde_json::json!({"role": "client"})))
            .await
            .unwrap();
        assert!(engine.transport_connected(&transport));

        let producer = engine
            .produce(&transport, MediaKind::Audio, RtpParameters(serde_json::json!({})))
            .await
            .unwrap();
        assert!(engine.can_consume(&router, &producer.id, &audio_caps()));

        let consumer = engine
            .consume(&transport, &producer.id, &audio_caps())
            .await
            .unwrap();
        assert_eq!(consumer.producer_id, producer.id);
        assert_eq!(consumer.consumer_type, ConsumerType::Simple);
    }

    #[tokio::test]
    async fn test_can_consume_rejects_kind_mismatch() {
        let engine = LocalEngine::new();
        let (_, router, transport) = setup(&engine).await;

        let producer = engine
            .produce(&transport, MediaKind::Video, RtpParameters(serde_json::json!({})))
            .await
            .unwrap();

        assert!(!engine.can_consume(&router, &producer.id, &audio_caps()));
        assert!(engine.can_consume(&router, &producer.id, &all_caps()));
    }

    #[tokio::test]
    async fn test_simulcast_type_from_encodings() {
        let engine = LocalEngine::new();
        let (_, _, transport) = setup(&engine).await;

        let params = RtpParameters(serde_json::json!({
            "encodings": [{"rid": "r0"}, {"rid": "r1"}, {"rid": "r2"}],
        }));
        let producer = engine
            .produce(&transport, MediaKind::Video, params)
            .await
            .unwrap();
        let consumer = engine
            .consume(&transport, &producer.id, &all_caps())
            .await
            .unwrap();
        assert_eq!(consumer.consumer_type, ConsumerType::Simulcast);
    }

    #[tokio::test]
    async fn test_close_transport_cascades() {
        let engine = LocalEngine::new();
        let (_, _, transport) = setup(&engine).await;

        let producer = engine
            .produce(&transport, MediaKind::Audio, RtpParameters(serde_json::json!({})))
            .await
            .unwrap();
        let consumer = engine
            .consume(&transport, &producer.id, &audio_caps())
            .await
            .unwrap();

        engine.close_transport(&transport).await;
        assert!(!engine.has_transport(&transport));
        assert!(!engine.has_producer(&producer.id));
        assert!(!engine.has_consumer(&consumer.id));
    }

    #[tokio::test]
    async fn test_malformed_dtls_rejected() {
        let engine = LocalEngine::new();
        let (_, _, transport) = setup(&engine).await;

        let result = engine
            .connect_transport(&transport, DtlsParameters(serde_json::json!("bogus")))
            .await;
        assert!(result.is_err());
        assert!(!engine.transport_connected(&transport));
    }

    #[tokio::test]
    async fn test_kill_worker_emits_event() {
        let engine = LocalEngine::new();
        let worker = engine.create_worker(&worker_settings()).await.unwrap();
        let mut events = engine.subscribe();

        engine.kill_worker(&worker);

        match events.try_recv() {
            Ok(EngineEvent::WorkerDied { worker_id }) => assert_eq!(worker_id, worker),
            other => panic!("expected WorkerDied, got {other:?}"),
        }

        let result = engine.create_router(&worker, &[]).await;
        assert!(result.is_err());
    }
}
