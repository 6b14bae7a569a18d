//! `sync_server`
//!
//! Development world server for the sync client:
//! - Authenticates players and assigns stable ids per credential
//! - Serves deterministic chunk contents
//! - Relays joins, moves and leaves to players in the same chunk
//! - Answers heartbeats
//!
//! Served over TCP (`SyncServer`) or in-process (`LocalTransport`).

pub mod local;
pub mod server;
pub mod world;

pub use local::LocalTransport;
pub use server::{bind_ephemeral, SyncServer, WorldHandle};
pub use world::{WorldConfig, WorldServer};
