//! `sync_shared`
//!
//! Shared libraries used by the sync client, the dev server and the load
//! harness.
//!
//! Design goals:
//! - State machines stay free of IO; transports and timers live at the edges.
//! - One envelope protocol (`net`) for every transport.
//! - Traits for the external collaborators (`Transport`, `SceneSink`).
//! - No `unsafe`.

pub mod chunk;
pub mod config;
pub mod event;
pub mod math;
pub mod net;
pub mod render;
pub mod transport;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::chunk::*;
    pub use crate::config::*;
    pub use crate::event::*;
    pub use crate::math::*;
    pub use crate::net::*;
    pub use crate::render::*;
    pub use crate::transport::*;
}
