//! Per-connection media-plane resource records
//!
//! Thin state holders owned by a [`Peer`](crate::peer::Peer). Cascade-close
//! rules (transport → producers/consumers, producer → consumers) are walked
//! explicitly by the peer and room over these records.

use serde::{Deserialize, Serialize};

use crate::engine::{ConsumerLayers, ConsumerType};
use crate::types::{ConsumerId, MediaKind, ProducerId, TransportId};

/// Which way media flows over a transport, as declared by the client.
/// The engine-side transport is direction-agnostic; this is bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    #[default]
    Send,
    Recv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connected,
    Closed,
}

/// One network path (ICE/DTLS) between a participant and a worker
#[derive(Debug, Clone)]
pub struct TransportRecord {
    pub id: TransportId,
    pub direction: TransportDirection,
    pub state: TransportState,
}

/// One outbound media stream on a transport
#[derive(Debug, Clone)]
pub struct ProducerRecord {
    pub id: ProducerId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub paused: bool,
}

/// One inbound media stream sourced from another peer's producer
#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub id: ConsumerId,
    pub transport_id: TransportId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub consumer_type: ConsumerType,
    pub paused: bool,
    pub preferred_layers: Option<ConsumerLayers>,
}
