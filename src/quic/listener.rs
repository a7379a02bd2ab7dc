use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use crate::quic::engine::AcceptableCallback;
use crate::quic::handle::{Key, PeerHandle};

/// A bound address accepting inbound peers.
///
/// Shutting a listener down only stops new peers; the record lives on until
/// the last peer it created is reclaimed.
pub(crate) struct Listener {
    pub local_addr: SocketAddr,
    pub socket: Key,
    pub on_acceptable: AcceptableCallback,
    pub peers: HashSet<PeerHandle>,
    pub shutdown: bool,
}

impl Listener {
    pub fn new(local_addr: SocketAddr, socket: Key, on_acceptable: AcceptableCallback) -> Self {
        Self {
            local_addr,
            socket,
            on_acceptable,
            peers: HashSet::new(),
            shutdown: false,
        }
    }

    /// Shut down and without peers: nothing refers to this record any more
    pub fn is_defunct(&self) -> bool {
        self.shutdown && self.peers.is_empty()
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("peers", &self.peers.len())
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}
