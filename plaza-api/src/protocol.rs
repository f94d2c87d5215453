//! Signaling wire protocol
//!
//! JSON text frames over a persistent WebSocket, request/acknowledgment
//! style: the client sends `{"id": n, "action": ..., "data": ...}` and
//! receives either `{"id": n, "data": ...}` or `{"id": n, "error": ...}`.
//! Server-initiated events arrive as `{"event": ..., "data": ...}`.
//!
//! Negotiation payloads keep the casing media clients expect
//! (`dtlsParameters`, `rtpParameters`, `rtpCapabilities`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use plaza_sfu::engine::{
    ConsumerInfo, ConsumerType, DtlsParameters, RtpCapabilities, RtpParameters, TransportInfo,
};
use plaza_sfu::resources::TransportDirection;
use plaza_sfu::room::PeerSummary;
use plaza_sfu::types::{ConsumerId, MediaKind, ProducerId, RoomId};

/// Inbound request frame
#[derive(Debug, Deserialize)]
pub struct RequestEnvelope {
    /// Correlation id echoed back in the acknowledgment
    pub id: u64,
    #[serde(flatten)]
    pub request: ClientRequest,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "camelCase")]
pub enum ClientRequest {
    CreateRoom {
        room_id: String,
    },
    Join {
        room_id: String,
        name: String,
    },
    GetProducers,
    CreateTransport {
        #[serde(default)]
        direction: TransportDirection,
    },
    ConnectTransport {
        transport_id: String,
        #[serde(rename = "dtlsParameters")]
        dtls_parameters: DtlsParameters,
    },
    Produce {
        transport_id: String,
        kind: MediaKind,
        #[serde(rename = "rtpParameters")]
        rtp_parameters: RtpParameters,
    },
    Consume {
        transport_id: String,
        producer_id: String,
        #[serde(rename = "rtpCapabilities")]
        rtp_capabilities: RtpCapabilities,
    },
    CloseProducer {
        producer_id: String,
    },
}

/// Outbound acknowledgment frame
#[derive(Debug, Serialize)]
pub struct ResponseFrame {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseFrame {
    pub fn ok(id: u64, data: impl Serialize) -> Self {
        Self {
            id,
            data: Some(serde_json::to_value(data).unwrap_or(Value::Null)),
            error: None,
        }
    }

    pub fn err(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            data: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JoinResponse {
    pub room_id: RoomId,
    pub peers: Vec<PeerSummary>,
}

#[derive(Debug, Serialize)]
pub struct ProducerEntry {
    pub producer_id: ProducerId,
}

#[derive(Debug, Serialize)]
pub struct ProducersResponse {
    pub producers: Vec<ProducerEntry>,
}

#[derive(Debug, Serialize)]
pub struct TransportResponse {
    pub transport: TransportInfo,
}

#[derive(Debug, Serialize)]
pub struct ProduceResponse {
    pub producer_id: ProducerId,
}

/// Parameters a media client needs to attach a consumer
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResponse {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(rename = "type")]
    pub consumer_type: ConsumerType,
    pub producer_paused: bool,
}

impl From<ConsumerInfo> for ConsumeResponse {
    fn from(info: ConsumerInfo) -> Self {
        Self {
            id: info.id,
            producer_id: info.producer_id,
            kind: info.kind,
            rtp_parameters: info.rtp_parameters,
            consumer_type: info.consumer_type,
            producer_paused: info.producer_paused,
        }
    }
}
