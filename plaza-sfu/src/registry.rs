//! Process-wide room registry
//!
//! Maps room ids to live rooms. Lookup is the hot path and lock-free via
//! DashMap; creation goes through an async lock so two concurrent requests
//! for the same id always observe a single Room instance. Emptied rooms are
//! reaped by a periodic background sweep.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, info};

use crate::config::MediaConfig;
use crate::engine::MediaEngine;
use crate::error::Result;
use crate::room::Room;
use crate::types::RoomId;
use crate::worker::WorkerPool;

pub struct RoomRegistry {
    engine: Arc<dyn MediaEngine>,
    workers: Arc<WorkerPool>,
    media: MediaConfig,
    rooms: DashMap<RoomId, Arc<Room>>,
    // serializes the slow path so one id never yields two rooms
    create_lock: Mutex<()>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new(engine: Arc<dyn MediaEngine>, workers: Arc<WorkerPool>, media: MediaConfig) -> Self {
        Self {
            engine,
            workers,
            media,
            rooms: DashMap::new(),
            create_lock: Mutex::new(()),
        }
    }

    /// Look up a room, creating it on the next round-robin worker if it
    /// does not exist. Returns the room and whether this call created it;
    /// concurrent callers for one id all see the same instance.
    pub async fn get_or_create(&self, room_id: &RoomId) -> Result<(Arc<Room>, bool)> {
        if let Some(room) = self.rooms.get(room_id) {
            return Ok((Arc::clone(room.value()), false));
        }

        let _guard = self.create_lock.lock().await;
        if let Some(room) = self.rooms.get(room_id) {
            return Ok((Arc::clone(room.value()), false));
        }

        let worker_id = self.workers.acquire()?;
        let room = Room::open(
            room_id.clone(),
            worker_id,
            self.engine.clone(),
            self.media.clone(),
        )
        .await?;
        self.rooms.insert(room_id.clone(), room.clone());
        info!(room_id = %room_id, total_rooms = self.rooms.len(), "room created");
        Ok((room, true))
    }

    #[must_use]
    pub fn get(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|r| Arc::clone(r.value()))
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Remove rooms that currently have no peers, releasing their routing
    /// contexts. Returns how many were removed.
    pub async fn sweep_empty(&self) -> usize {
        let empty_ids: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|entry| entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for room_id in empty_ids {
            // re-checked under the map entry: a peer may have joined since
            if let Some((_, room)) = self.rooms.remove_if(&room_id, |_, room| room.is_empty()) {
                room.close().await;
                removed += 1;
                debug!(room_id = %room_id, "removed empty room");
            }
        }

        if removed > 0 {
            info!(removed, remaining_rooms = self.rooms.len(), "swept empty rooms");
        }
        removed
    }

    /// Background task reaping empty rooms on a fixed interval
    pub fn spawn_sweeper(self: &Arc<Self>, interval_secs: u64) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
            info!(interval_secs, "starting empty-room sweep task");
            loop {
                ticker.tick().await;
                registry.sweep_empty().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::engine::LocalEngine;
    use crate::peer::Peer;
    use crate::types::PeerId;
    use tokio::sync::mpsc;

    async fn test_registry(workers: usize) -> (Arc<dyn MediaEngine>, Arc<RoomRegistry>) {
        let engine: Arc<dyn MediaEngine> = Arc::new(LocalEngine::new());
        let pool = WorkerPool::start(
            &*engine,
            &WorkerConfig {
                num_workers: workers,
                ..WorkerConfig::default()
            },
        )
        .await
        .unwrap();
        let registry = Arc::new(RoomRegistry::new(
            engine.clone(),
            Arc::new(pool),
            MediaConfig::default(),
        ));
        (engine, registry)
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let (_, registry) = test_registry(2).await;
        let room_id = RoomId::new("r1");

        let (room, created) = registry.get_or_create(&room_id).await.unwrap();
        assert!(created);

        let (room2, created2) = registry.get_or_create(&room_id).await.unwrap();
        assert!(!created2);
        assert!(Arc::ptr_eq(&room, &room2));
        // the worker binding is stable across the repeated request
        assert_eq!(room.worker_id(), room2.worker_id());
        assert_eq!(registry.room_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_creation_yields_one_room() {
        let (_, registry) = test_registry(2).await;
        let room_id = RoomId::new("contended");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let room_id = room_id.clone();
            handles.push(tokio::spawn(async move {
                registry.get_or_create(&room_id).await.unwrap()
            }));
        }

        let mut created_count = 0;
        let mut rooms = Vec::new();
        for handle in handles {
            let (room, created) = handle.await.unwrap();
            if created {
                created_count += 1;
            }
            rooms.push(room);
        }

        assert_eq!(created_count, 1);
        assert!(rooms.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.room_count(), 1);
    }

    #[tokio::test]
    async fn test_rooms_spread_round_robin() {
        let (_, registry) = test_registry(2).await;

        let (r1, _) = registry.get_or_create(&RoomId::new("a")).await.unwrap();
        let (r2, _) = registry.get_or_create(&RoomId::new("b")).await.unwrap();
        let (r3, _) = registry.get_or_create(&RoomId::new("c")).await.unwrap();

        assert_ne!(r1.worker_id(), r2.worker_id());
        assert_eq!(r1.worker_id(), r3.worker_id());
    }

    #[tokio::test]
    async fn test_sweep_removes_only_empty_rooms() {
        let (engine, registry) = test_registry(1).await;

        let (occupied, _) = registry.get_or_create(&RoomId::new("busy")).await.unwrap();
        registry.get_or_create(&RoomId::new("idle")).await.unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        occupied.add_peer(Arc::new(Peer::new(PeerId::new("p1"), "alice", engine, tx)));

        let removed = registry.sweep_empty().await;
        assert_eq!(removed, 1);
        assert_eq!(registry.room_count(), 1);
        assert!(registry.get(&RoomId::new("busy")).is_some());
        assert!(registry.get(&RoomId::new("idle")).is_none());
    }
}
