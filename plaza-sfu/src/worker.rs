//! Media worker pool
//!
//! A fixed set of media-engine workers is created at startup and each new
//! room is pinned to one of them round-robin. A room's routing context never
//! migrates, so a dead worker cannot be replaced in place: death is fatal
//! for the whole process and the binary shuts down on the engine's
//! `WorkerDied` event.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::engine::{MediaEngine, WorkerSettings};
use crate::error::{Error, Result};
use crate::types::WorkerId;

struct PoolWorker {
    id: WorkerId,
    alive: AtomicBool,
}

pub struct WorkerPool {
    workers: Vec<PoolWorker>,
    // round-robin cursor, owned by the pool
    next: AtomicUsize,
}

impl WorkerPool {
    /// Create the startup-sized worker set on the given engine
    pub async fn start(engine: &dyn MediaEngine, config: &WorkerConfig) -> Result<Self> {
        let count = config.effective_num_workers();
        let settings = WorkerSettings {
            rtc_min_port: config.rtc_min_port,
            rtc_max_port: config.rtc_max_port,
            log_level: config.log_level.clone(),
            log_tags: config.log_tags.clone(),
        };

        let mut workers = Vec::with_capacity(count);
        for _ in 0..count {
            let id = engine.create_worker(&settings).await?;
            info!(worker_id = %id, "media worker started");
            workers.push(PoolWorker {
                id,
                alive: AtomicBool::new(true),
            });
        }

        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
        })
    }

    /// Pick the next worker round-robin. Used once per room creation.
    ///
    /// Liveness is not consulted here: a dead worker already makes the
    /// process shut down, so skipping it would only mask the failure.
    pub fn acquire(&self) -> Result<WorkerId> {
        if self.workers.is_empty() {
            return Err(Error::Engine("worker pool is empty".to_string()));
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        Ok(self.workers[idx].id.clone())
    }

    /// Record a worker's death. Returns false for workers this pool does
    /// not own.
    pub fn mark_dead(&self, worker_id: &WorkerId) -> bool {
        match self.workers.iter().find(|w| w.id == *worker_id) {
            Some(worker) => {
                worker.alive.store(false, Ordering::Relaxed);
                warn!(worker_id = %worker_id, "media worker marked dead");
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn alive_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.alive.load(Ordering::Relaxed))
            .count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|w| w.id.clone()).collect()
    }
}
