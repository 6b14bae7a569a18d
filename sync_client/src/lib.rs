//! `sync_client`
//!
//! Client-side systems:
//! - Connection management (session lifecycle, backoff, heartbeat, snapshot)
//! - Chunk streaming and remote player interpolation
//! - The `GameClient` task that owns both
//! - Connection testing (fault injection) and performance monitoring

pub mod chunks;
pub mod client;
pub mod connection;
pub mod interp;
pub mod monitor;
pub mod tester;

pub use client::GameClient;
