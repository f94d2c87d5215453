//! Server lifecycle management
//!
//! Wires the engine, worker pool, room registry and signaling gateway
//! together, then serves until ctrl-c or a fatal engine event. Worker death
//! ends the process with a non-zero exit: rooms are pinned to their worker,
//! so there is no safe in-place recovery.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use plaza_api::AppState;
use plaza_sfu::engine::{EngineEvent, LocalEngine, MediaEngine};
use plaza_sfu::{Config, RoomRegistry, WorkerPool};

pub async fn run(config: Config) -> Result<()> {
    let engine: Arc<dyn MediaEngine> = Arc::new(LocalEngine::new());

    let pool = Arc::new(WorkerPool::start(&*engine, &config.media.worker).await?);
    info!(workers = pool.len(), "media worker pool ready");

    let registry = Arc::new(RoomRegistry::new(
        engine.clone(),
        pool.clone(),
        config.media.clone(),
    ));
    let _sweeper = registry.spawn_sweeper(config.registry.sweep_interval_secs);

    // Fatal-event watcher: a dead worker cannot safely keep serving the
    // rooms bound to it, so the whole process goes down.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    {
        let mut events = engine.subscribe();
        let pool = pool.clone();
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(EngineEvent::WorkerDied { worker_id }) => {
                        pool.mark_dead(&worker_id);
                        error!(worker_id = %worker_id, "media worker died, shutting down");
                        let _ = shutdown_tx.send(true);
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "engine event listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    let app = plaza_api::create_router(AppState {
        registry: registry.clone(),
        engine: engine.clone(),
    });

    let addr = config.http_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("signaling gateway listening on {addr}");

    let mut shutdown = shutdown_rx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                }
                _ = shutdown.changed() => {}
            }
        })
        .await?;

    if *shutdown_rx.borrow() {
        anyhow::bail!("terminated after media worker death");
    }
    info!("plaza server stopped");
    Ok(())
}
