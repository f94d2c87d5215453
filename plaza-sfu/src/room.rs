//! Room: one media session bound to a single worker
//!
//! A room owns the routing context (created on exactly one worker and never
//! migrated) and the insertion-ordered set of peers attached to it. It
//! mediates consumability checks, cross-peer cascades and event fan-out.
//!
//! The producer → consumer dependency index is the linearization point for
//! the consume-vs-close race: registration and teardown both pass through
//! it, so a consume can never leave behind a consumer whose source producer
//! already cascaded away.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::MediaConfig;
use crate::engine::{
    ConsumerInfo, DtlsParameters, MediaEngine, RtpCapabilities, RtpParameters, TransportInfo,
};
use crate::error::{Error, Result};
use crate::peer::Peer;
use crate::resources::TransportDirection;
use crate::types::{
    ConsumerId, MediaKind, PeerId, ProducerId, RoomId, RouterId, TransportId, WorkerId,
};

/// Event fanned out to peers over their outbound channels. Serializes to
/// the wire shape `{"event": ..., "data": ...}` directly.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum RoomEvent {
    /// A new producer is available to consume
    NewProducers {
        producer_id: ProducerId,
        producer_socket_id: PeerId,
    },
    /// A consumer this peer held was closed because its source went away
    ConsumerClosed { consumer_id: ConsumerId },
}

/// Roster entry returned to a joining peer
#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    pub peer_id: PeerId,
    pub display_name: String,
}

pub struct Room {
    id: RoomId,
    router_id: RouterId,
    worker_id: WorkerId,
    engine: Arc<dyn MediaEngine>,
    media: MediaConfig,
    created_at: DateTime<Utc>,
    peers: RwLock<IndexMap<PeerId, Arc<Peer>>>,
    // producer -> consumers sourced from it, possibly on other peers
    consumers_by_producer: Mutex<HashMap<ProducerId, Vec<(PeerId, ConsumerId)>>>,
}

impl Room {
    /// Create the room's routing context on the given worker and wrap it.
    /// The worker binding holds for the room's whole lifetime.
    pub async fn open(
        id: RoomId,
        worker_id: WorkerId,
        engine: Arc<dyn MediaEngine>,
        media: MediaConfig,
    ) -> Result<Arc<Self>> {
        let router_id = engine
            .create_router(&worker_id, &media.router.media_codecs)
            .await?;
        info!(room_id = %id, worker_id = %worker_id, "room opened");
        Ok(Arc::new(Self {
            id,
            router_id,
            worker_id,
            engine,
            media,
            created_at: Utc::now(),
            peers: RwLock::new(IndexMap::new()),
            consumers_by_producer: Mutex::new(HashMap::new()),
        }))
    }

    #[must_use]
    pub fn id(&self) -> &RoomId {
        &self.id
    }

    #[must_use]
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn add_peer(&self, peer: Arc<Peer>) {
        debug!(room_id = %self.id, peer_id = %peer.id(), "peer joined");
        self.peers.write().insert(peer.id().clone(), peer);
    }

    #[must_use]
    pub fn contains_peer(&self, peer_id: &PeerId) -> bool {
        self.peers.read().contains_key(peer_id)
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Roster in join order
    #[must_use]
    pub fn peer_summaries(&self) -> Vec<PeerSummary> {
        self.peers
            .read()
            .values()
            .map(|p| PeerSummary {
                peer_id: p.id().clone(),
                display_name: p.display_name().to_string(),
            })
            .collect()
    }

    fn peer(&self, peer_id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.read().get(peer_id).cloned()
    }

    fn find_producer_owner(&self, producer_id: &ProducerId) -> Option<Arc<Peer>> {
        self.peers
            .read()
            .values()
            .find(|p| p.has_producer(producer_id))
            .cloned()
    }

    /// Request a transport from this room's routing context and register it
    /// on the named peer. Fails when the peer is not in this room.
    pub async fn create_transport(
        &self,
        peer_id: &PeerId,
        direction: TransportDirection,
    ) -> Result<TransportInfo> {
        let peer = self.peer(peer_id).ok_or_else(|| {
            Error::NotFound(format!("peer {peer_id} is not in room {}", self.id))
        })?;

        let options = self.media.transport.to_options();
        let info = self.engine.create_transport(&self.router_id, &options).await?;

        let cap = self.media.transport.max_incoming_bitrate;
        if cap > 0 {
            // best-effort, as with the bitrate hint: a transport without the
            // cap is still usable
            if let Err(e) = self.engine.set_max_incoming_bitrate(&info.id, cap).await {
                warn!(
                    room_id = %self.id,
                    transport_id = %info.id,
                    error = %e,
                    "failed to apply incoming bitrate cap"
                );
            }
        }

        peer.add_transport(&info, direction);
        Ok(info)
    }

    /// Forward DTLS parameters to a peer's transport. Unknown peer or
    /// transport is a silent no-op: this tolerates late or duplicate
    /// signaling after a peer has already left.
    pub async fn connect_transport(
        &self,
        peer_id: &PeerId,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let Some(peer) = self.peer(peer_id) else {
            return Ok(());
        };
        peer.connect_transport(transport_id, dtls_parameters).await
    }

    /// Create a producer on the named peer's transport and announce it to
    /// every other peer. Returns `None` silently when the peer or transport
    /// is missing.
    pub async fn produce(
        &self,
        peer_id: &PeerId,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Option<ProducerId>> {
        let Some(peer) = self.peer(peer_id) else {
            return Ok(None);
        };
        let Some(info) = peer.create_producer(transport_id, kind, rtp_parameters).await? else {
            return Ok(None);
        };

        self.broadcast(
            RoomEvent::NewProducers {
                producer_id: info.id.clone(),
                producer_socket_id: peer_id.clone(),
            },
            Some(peer_id),
        );
        Ok(Some(info.id))
    }

    /// Create a consumer for the named producer on the requesting peer's
    /// transport. Refuses when the producer's kind is outside the declared
    /// receive capabilities. The compatibility check and the registration
    /// are evaluated against current state: if the source producer closes
    /// while the engine call is in flight, the fresh consumer is closed
    /// again and the request refused.
    pub async fn consume(
        &self,
        peer_id: &PeerId,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerInfo> {
        let peer = self.peer(peer_id).ok_or_else(|| {
            Error::NotFound(format!("peer {peer_id} is not in room {}", self.id))
        })?;

        if !self
            .engine
            .can_consume(&self.router_id, producer_id, rtp_capabilities)
        {
            return Err(Error::Incompatible(format!(
                "cannot consume producer {producer_id} with the declared capabilities"
            )));
        }
        if self.find_producer_owner(producer_id).is_none() {
            return Err(Error::NotFound(format!(
                "producer {producer_id} is not in room {}",
                self.id
            )));
        }

        let Some(info) = peer
            .create_consumer(transport_id, producer_id, rtp_capabilities)
            .await?
        else {
            return Err(Error::NotFound(format!(
                "transport {transport_id} is not registered to peer {peer_id}"
            )));
        };

        // Registration doubles as the race check: the producer cascade takes
        // this lock when tearing down, so either we register before it walks
        // the index (and the cascade closes us), or we observe the producer
        // gone and roll back.
        let registered = {
            let mut index = self.consumers_by_producer.lock();
            if self.find_producer_owner(producer_id).is_some() {
                index
                    .entry(producer_id.clone())
                    .or_default()
                    .push((peer_id.clone(), info.id.clone()));
                true
            } else {
                false
            }
        };
        if !registered {
            peer.close_consumer(&info.id).await;
            return Err(Error::NotFound(format!(
                "producer {producer_id} closed during consume"
            )));
        }

        Ok(info)
    }

    /// Close a producer on the named peer and cascade to every consumer
    /// sourced from it. Best-effort cleanup path: unknown ids are ignored.
    pub async fn close_producer(&self, peer_id: &PeerId, producer_id: &ProducerId) {
        let Some(peer) = self.peer(peer_id) else {
            debug!(room_id = %self.id, peer_id = %peer_id, "close_producer for absent peer");
            return;
        };
        self.cascade_close_producer(&peer, producer_id).await;
    }

    /// Close the producer on its owner, then walk the dependency index and
    /// close every consumer sourced from it, notifying each consumer's
    /// owning peer alone.
    async fn cascade_close_producer(&self, owner: &Arc<Peer>, producer_id: &ProducerId) {
        owner.close_producer(producer_id).await;

        let dependents = self
            .consumers_by_producer
            .lock()
            .remove(producer_id)
            .unwrap_or_default();
        for (peer_id, consumer_id) in dependents {
            let Some(peer) = self.peer(&peer_id) else {
                continue;
            };
            if peer.close_consumer(&consumer_id).await.is_some() {
                peer.send(RoomEvent::ConsumerClosed { consumer_id });
            }
        }
    }

    /// Every producer currently registered in this room, used by newly
    /// joined peers to discover existing streams.
    #[must_use]
    pub fn producer_list(&self) -> Vec<ProducerId> {
        self.peers
            .read()
            .values()
            .flat_map(|p| p.producer_ids())
            .collect()
    }

    /// Deliver an event to every peer except `exclude`, in join order.
    /// Delivery is fire-and-forget over each peer's outbound channel.
    pub fn broadcast(&self, event: RoomEvent, exclude: Option<&PeerId>) {
        for (peer_id, peer) in self.peers.read().iter() {
            if Some(peer_id) != exclude {
                peer.send(event.clone());
            }
        }
    }

    /// Release everything a departing peer owns, then drop it from the
    /// room. The peer's producers cascade to consumers held by other peers
    /// first, so no consumer sourced from it survives anywhere.
    pub async fn remove_peer(&self, peer_id: &PeerId) {
        let Some(peer) = self.peer(peer_id) else {
            return;
        };

        for producer_id in peer.producer_ids() {
            self.cascade_close_producer(&peer, &producer_id).await;
        }

        let closed = peer.close_all().await;
        // Unregister the consumers this peer held on other peers' producers
        {
            let mut index = self.consumers_by_producer.lock();
            for consumer in &closed.consumers {
                if let Some(entries) = index.get_mut(&consumer.producer_id) {
                    entries.retain(|(_, cid)| cid != &consumer.id);
                    if entries.is_empty() {
                        index.remove(&consumer.producer_id);
                    }
                }
            }
        }

        self.peers.write().shift_remove(peer_id);
        info!(room_id = %self.id, peer_id = %peer_id, "peer removed");
    }

    /// Release the routing context. Called by the registry when the room is
    /// torn down.
    pub async fn close(&self) {
        self.engine.close_router(&self.router_id).await;
        info!(room_id = %self.id, "room closed");
    }
}
