//! quux: an edge-triggered, callback-driven transport that multiplexes
//! reliable byte streams over UDP.
//!
//! ```no_run
//! use quux::prelude::*;
//!
//! # fn main() -> quux::Result<()> {
//! let mut engine = Engine::new(EngineConfig::default())?;
//! engine.init_loop()?;
//! engine.listen("127.0.0.1:9999".parse().unwrap(), |engine, peer| {
//!     while let Ok(stream) = engine.accept(peer, |_, _| {}, |engine, stream| {
//!         let mut buf = [0u8; 4096];
//!         while engine.read(stream, &mut buf) > 0 {}
//!     }) {
//!         tracing::info!("accepted {}", stream);
//!     }
//! })?;
//! engine.run()
//! # }
//! ```

// Transport core
pub mod quic;

// Packet protection
pub mod crypto;

pub mod config;

// Event loop integration
pub mod reactor;

pub mod observability;

// C ABI
#[cfg(feature = "ffi")]
pub mod ffi;

pub use config::{ConfigBuilder, EngineConfig};
pub use quic::{
    ConnectionStats, Engine, ListenerHandle, PeerHandle, QuicError, Result, StreamError, StreamHandle, StreamId,
};
pub use reactor::{IoSource, Reactor};

/// Crate version, as reported by `quux_version`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod prelude {
    pub use crate::config::{ConfigBuilder, EngineConfig};
    pub use crate::quic::{
        ConnectionState, ConnectionStats, Engine, ListenerHandle, PeerHandle, QuicError, StreamError, StreamHandle,
        StreamId,
    };
    pub use crate::reactor::{IoSource, Reactor};
}
