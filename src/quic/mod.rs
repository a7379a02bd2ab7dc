//! Transport core
//!
//! Wire codecs, per-connection state machines and the [`Engine`] that ties
//! them to sockets, handles and callbacks.

pub mod ack_manager;
pub mod congestion;
pub mod connection;
pub mod engine;
pub mod error;
pub mod events;
pub mod frame;
pub mod handle;
mod listener;
pub mod loss_recovery;
pub mod packet;
pub mod range_set;
pub mod stream;
pub mod time_cache;
pub mod udp_mux;

// Re-export commonly used items
pub use connection::{Connection, ConnectionId, ConnectionState, ConnectionStats, Side};
pub use engine::{AcceptableCallback, Engine, StreamCallback};
pub use error::{ConnectionError, LoopError, ProtocolError, QuicError, Result, StreamError};
pub use events::ConnectionEvent;
pub use frame::Frame;
pub use handle::{ListenerHandle, PeerHandle, StreamHandle};
pub use packet::{Packet, PacketHeader, PacketNumber, PacketType};
pub use stream::{Readiness, StreamId};
pub use time_cache::TimeCache;
