//! WebSocket signaling gateway
//!
//! Binds one WebSocket connection to at most one room/peer pair and relays
//! requests to the orchestration layer. Connections move one way through
//! Unjoined → Joined → Closed: re-joining requires a new connection, and a
//! `join` for an unknown room is refused, never created implicitly.
//!
//! Failures are answered with refusal frames; a connection is only torn
//! down by the transport layer, and teardown always runs
//! `Room::remove_peer`.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use nanoid::nanoid;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use plaza_sfu::peer::Peer;
use plaza_sfu::room::{Room, RoomEvent};
use plaza_sfu::types::{PeerId, ProducerId, RoomId, TransportId};

use crate::protocol::{
    ClientRequest, ConsumeResponse, JoinResponse, ProduceResponse, ProducerEntry,
    ProducersResponse, RequestEnvelope, ResponseFrame, TransportResponse,
};
use crate::AppState;

/// Signaling frames are small; anything larger is a misbehaving client.
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Outbound frames buffered per connection before backpressure kicks in
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Per-connection signaling state. Transitions are one-way; Closed is the
/// end of the socket task itself.
pub(crate) enum ConnState {
    Unjoined,
    Joined { room: Arc<Room> },
}

pub async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    // the connection identifier doubles as the peer identifier
    let peer_id = PeerId::new(nanoid!());
    info!(peer_id = %peer_id, "signaling connection established");

    let (mut ws_sink, mut ws_stream) = socket.split();

    // Outbound pump: everything written to the connection goes through here
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Room events reach this connection through the peer's unbounded
    // channel; fan-out in the room never blocks on a slow client.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<RoomEvent>();
    let event_out = out_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(text) => {
                    if event_out.send(text).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!(error = %e, "failed to serialize room event"),
            }
        }
    });

    let mut conn = ConnState::Unjoined;
    while let Some(message) = ws_stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let frame = match serde_json::from_str::<RequestEnvelope>(text.as_str()) {
                    Ok(envelope) => {
                        dispatch(&state, &peer_id, &event_tx, &mut conn, envelope).await
                    }
                    Err(e) => {
                        debug!(peer_id = %peer_id, error = %e, "malformed request frame");
                        ResponseFrame::err(0, "malformed request")
                    }
                };
                match serde_json::to_string(&frame) {
                    Ok(text) => {
                        if out_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => error!(error = %e, "failed to serialize response frame"),
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // binary, ping and pong are ignored
            Err(e) => {
                debug!(peer_id = %peer_id, error = %e, "websocket receive error");
                break;
            }
        }
    }

    // Closed: the only cancellation signal there is. Always clean up.
    teardown(conn, &peer_id).await;
    info!(peer_id = %peer_id, "signaling connection closed");
}

/// Release the room/peer association of a closed connection
pub(crate) async fn teardown(conn: ConnState, peer_id: &PeerId) {
    if let ConnState::Joined { room } = conn {
        room.remove_peer(peer_id).await;
    }
}

/// Route one request to the orchestration layer and build its
/// acknowledgment. Errors become refusal frames, never terminations.
pub(crate) async fn dispatch(
    state: &AppState,
    peer_id: &PeerId,
    events: &mpsc::UnboundedSender<RoomEvent>,
    conn: &mut ConnState,
    envelope: RequestEnvelope,
) -> ResponseFrame {
    let id = envelope.id;
    match envelope.request {
        ClientRequest::CreateRoom { room_id } => {
            if matches!(conn, ConnState::Joined { .. }) {
                return ResponseFrame::err(id, "already joined a room");
            }
            match state.registry.get_or_create(&RoomId::new(room_id)).await {
                Ok((_, true)) => ResponseFrame::ok(id, serde_json::json!({})),
                Ok((_, false)) => ResponseFrame::err(id, "already exists"),
                Err(e) => ResponseFrame::err(id, e.to_string()),
            }
        }
        ClientRequest::Join { room_id, name } => {
            if matches!(conn, ConnState::Joined { .. }) {
                return ResponseFrame::err(id, "already joined a room");
            }
            let Some(room) = state.registry.get(&RoomId::new(room_id)) else {
                return ResponseFrame::err(id, "Room does not exist");
            };
            let peer = Arc::new(Peer::new(
                peer_id.clone(),
                name,
                state.engine.clone(),
                events.clone(),
            ));
            room.add_peer(peer);
            let response = JoinResponse {
                room_id: room.id().clone(),
                peers: room.peer_summaries(),
            };
            *conn = ConnState::Joined { room };
            ResponseFrame::ok(id, response)
        }
        ClientRequest::GetProducers => match conn {
            ConnState::Unjoined => ResponseFrame::err(id, "Room does not exist"),
            ConnState::Joined { room } => ResponseFrame::ok(
                id,
                ProducersResponse {
                    producers: room
                        .producer_list()
                        .into_iter()
                        .map(|producer_id| ProducerEntry { producer_id })
                        .collect(),
                },
            ),
        },
        ClientRequest::CreateTransport { direction } => match conn {
            ConnState::Unjoined => ResponseFrame::err(id, "not joined"),
            ConnState::Joined { room } => match room.create_transport(peer_id, direction).await {
                Ok(transport) => ResponseFrame::ok(id, TransportResponse { transport }),
                Err(e) => ResponseFrame::err(id, e.to_string()),
            },
        },
        ClientRequest::ConnectTransport {
            transport_id,
            dtls_parameters,
        } => match conn {
            ConnState::Unjoined => ResponseFrame::err(id, "not joined"),
            ConnState::Joined { room } => {
                match room
                    .connect_transport(peer_id, &TransportId::new(transport_id), dtls_parameters)
                    .await
                {
                    Ok(()) => ResponseFrame::ok(id, serde_json::json!({})),
                    Err(e) => ResponseFrame::err(id, e.to_string()),
                }
            }
        },
        ClientRequest::Produce {
            transport_id,
            kind,
            rtp_parameters,
        } => match conn {
            ConnState::Unjoined => ResponseFrame::err(id, "not joined"),
            ConnState::Joined { room } => {
                match room
                    .produce(
                        peer_id,
                        &TransportId::new(transport_id),
                        kind,
                        rtp_parameters,
                    )
                    .await
                {
                    Ok(Some(producer_id)) => {
                        ResponseFrame::ok(id, ProduceResponse { producer_id })
                    }
                    Ok(None) => ResponseFrame::err(id, "transport not found"),
                    Err(e) => ResponseFrame::err(id, e.to_string()),
                }
            }
        },
        ClientRequest::Consume {
            transport_id,
            producer_id,
            rtp_capabilities,
        } => match conn {
            ConnState::Unjoined => ResponseFrame::err(id, "not joined"),
            ConnState::Joined { room } => {
                match room
                    .consume(
                        peer_id,
                        &TransportId::new(transport_id),
                        &ProducerId::new(producer_id),
                        &rtp_capabilities,
                    )
                    .await
                {
                    Ok(info) => ResponseFrame::ok(id, ConsumeResponse::from(info)),
                    Err(e) => ResponseFrame::err(id, e.to_string()),
                }
            }
        },
        ClientRequest::CloseProducer { producer_id } => match conn {
            ConnState::Unjoined => ResponseFrame::err(id, "not joined"),
            ConnState::Joined { room } => {
                room.close_producer(peer_id, &ProducerId::new(producer_id))
                    .await;
                ResponseFrame::ok(id, serde_json::json!({}))
            }
        },
    }
}
