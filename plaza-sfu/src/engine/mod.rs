//! Media-engine boundary
//!
//! The media engine (RTP/SRTP, DTLS/ICE negotiation, bandwidth estimation)
//! is an external capability-providing dependency. This module defines the
//! seam the orchestration layer is built on: asynchronous create/connect
//! operations plus an event channel for out-of-band notifications such as
//! worker death.
//!
//! Negotiation payloads (RTP parameters, DTLS parameters, ICE material)
//! are opaque JSON passed between clients and the engine. The orchestration
//! layer interprets only what it needs for bookkeeping: media kinds,
//! capability codec declarations, encoding counts and consumer types.

mod local;

pub use local::LocalEngine;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportId, WorkerId};

/// Settings a worker is launched with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub log_level: String,
    pub log_tags: Vec<String>,
}

/// One codec a routing context or a receiving peer declares support for
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub parameters: serde_json::Value,
}

/// Receive capabilities a peer advertises when consuming
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
}

impl RtpCapabilities {
    /// Whether any declared codec covers the given media kind
    #[must_use]
    pub fn supports_kind(&self, kind: MediaKind) -> bool {
        self.codecs.iter().any(|c| c.kind == kind)
    }
}

/// Opaque RTP send/receive parameters negotiated by the client and engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpParameters(pub serde_json::Value);

impl RtpParameters {
    /// Number of encodings carried; more than one indicates simulcast
    #[must_use]
    pub fn encoding_count(&self) -> usize {
        self.0
            .get("encodings")
            .and_then(serde_json::Value::as_array)
            .map_or(1, Vec::len)
    }
}

/// Opaque DTLS handshake parameters forwarded from the client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DtlsParameters(pub serde_json::Value);

/// Options a transport is created with, derived from configuration
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub listen_ip: String,
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub initial_available_outgoing_bitrate: u32,
}

/// Connection parameters of a freshly created transport, relayed to the client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: TransportId,
    pub ice_parameters: serde_json::Value,
    pub ice_candidates: serde_json::Value,
    pub dtls_parameters: serde_json::Value,
}

/// Result of a producer creation
#[derive(Debug, Clone)]
pub struct ProducerInfo {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub paused: bool,
}

/// Encoding structure of a created consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerType {
    Simple,
    Simulcast,
    Svc,
    Pipe,
}

impl ConsumerType {
    /// Layered encodings accept preferred-layer selection
    #[must_use]
    pub const fn is_layered(self) -> bool {
        matches!(self, Self::Simulcast | Self::Svc)
    }
}

/// Spatial/temporal layer preference for a layered consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerLayers {
    pub spatial_layer: u8,
    pub temporal_layer: u8,
}

impl ConsumerLayers {
    /// The two highest layers, requested as the initial preference
    #[must_use]
    pub const fn highest() -> Self {
        Self {
            spatial_layer: 2,
            temporal_layer: 2,
        }
    }
}

/// Result of a consumer creation
#[derive(Debug, Clone)]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub consumer_type: ConsumerType,
    pub producer_paused: bool,
}

/// Out-of-band notification from the engine
#[derive(Debug, Clone)]
pub enum EngineEvent {
    WorkerDied { worker_id: WorkerId },
}

/// The capability surface the orchestration layer requires from a media
/// engine. Creation operations complete asynchronously; close operations
/// are best-effort and never fail.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_worker(&self, settings: &WorkerSettings) -> Result<WorkerId>;

    async fn create_router(
        &self,
        worker_id: &WorkerId,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<RouterId>;

    async fn close_router(&self, router_id: &RouterId);

    /// Whether a consumer for the producer could be created against the
    /// given receive capabilities. Checked before any consumer creation.
    fn can_consume(
        &self,
        router_id: &RouterId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> bool;

    async fn create_transport(
        &self,
        router_id: &RouterId,
        options: &TransportOptions,
    ) -> Result<TransportInfo>;

    async fn set_max_incoming_bitrate(&self, transport_id: &TransportId, bitrate: u32)
        -> Result<()>;

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()>;

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerInfo>;

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerInfo>;

    async fn set_preferred_layers(
        &self,
        consumer_id: &ConsumerId,
        layers: ConsumerLayers,
    ) -> Result<()>;

    async fn close_transport(&self, transport_id: &TransportId);

    async fn close_producer(&self, producer_id: &ProducerId);

    async fn close_consumer(&self, consumer_id: &ConsumerId);

    /// Subscribe to out-of-band engine events (worker death)
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}
