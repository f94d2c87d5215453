//! `plaza-sfu`: SFU session orchestration
//!
//! This crate is the orchestration and bookkeeping layer of the plaza media
//! server: it distributes rooms across a pool of media-engine workers and
//! manages the nested lifecycle of rooms, peers, transports, producers and
//! consumers that make up a live call. The media engine itself (RTP/SRTP,
//! DTLS/ICE, bandwidth estimation) sits behind the [`engine::MediaEngine`]
//! trait.
//!
//! ## Architecture
//!
//! - **`WorkerPool`**: fixed worker set, round-robin room assignment,
//!   fail-fast on worker death
//! - **`RoomRegistry`**: process-wide id → room map, idempotent creation
//! - **`Room`**: one routing context pinned to one worker plus the peers
//!   attached to it; consumability checks and event fan-out
//! - **`Peer`**: one connection's transport/producer/consumer maps
//!
//! All of this is explicit process-scoped state constructed at startup and
//! passed by handle, not ambient globals, so multiple independent
//! instances can coexist in one process (and in tests).

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod peer;
pub mod registry;
pub mod resources;
pub mod room;
pub mod types;
pub mod worker;

pub use config::Config;
pub use engine::{LocalEngine, MediaEngine};
pub use error::{Error, Result};
pub use peer::Peer;
pub use registry::RoomRegistry;
pub use room::{Room, RoomEvent};
pub use types::{ConsumerId, MediaKind, PeerId, ProducerId, RoomId, TransportId, WorkerId};
pub use worker::WorkerPool;
