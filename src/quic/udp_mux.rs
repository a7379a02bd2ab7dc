//! UDP socket table and connection-id demultiplexing.
//!
//! Every bound socket may carry one active listener and any number of peers,
//! keyed by connection id. Sockets are plain non-blocking std sockets; the
//! reactor only needs their file descriptors.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use tracing::{debug, info};

use super::connection::ConnectionId;
use super::error::{QuicError, Result};
use super::handle::{Arena, Key, ListenerHandle, PeerHandle};
use crate::reactor::IoSource;

#[derive(Debug)]
struct SocketEntry {
    socket: UdpSocket,
    local_addr: SocketAddr,
    listener: Option<ListenerHandle>,
    peers: HashMap<ConnectionId, PeerHandle>,
}

/// All sockets owned by one engine
#[derive(Debug, Default)]
pub struct UdpMultiplexer {
    sockets: Arena<SocketEntry>,
}

impl UdpMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a new non-blocking socket
    pub fn bind(&mut self, addr: SocketAddr) -> Result<Key> {
        let socket = UdpSocket::bind(addr).map_err(|e| match e.kind() {
            io::ErrorKind::AddrInUse => QuicError::AddressInUse(addr),
            _ => QuicError::from(e),
        })?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        info!("UDP socket bound to {}", local_addr);
        Ok(self.sockets.insert(SocketEntry {
            socket,
            local_addr,
            listener: None,
            peers: HashMap::new(),
        }))
    }

    pub fn find_by_local_addr(&self, addr: SocketAddr) -> Option<Key> {
        self.sockets
            .iter()
            .find(|(_, entry)| entry.local_addr == addr)
            .map(|(key, _)| key)
    }

    pub fn local_addr(&self, key: Key) -> Option<SocketAddr> {
        self.sockets.get(key).map(|entry| entry.local_addr)
    }

    pub fn io_source(&self, key: Key) -> Option<IoSource> {
        self.sockets.get(key).map(|entry| IoSource {
            fd: entry.socket.as_raw_fd(),
            local_addr: entry.local_addr,
        })
    }

    pub fn raw_fd(&self, key: Key) -> Option<RawFd> {
        self.sockets.get(key).map(|entry| entry.socket.as_raw_fd())
    }

    pub fn keys(&self) -> Vec<Key> {
        self.sockets.keys()
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Receive one datagram; `Ok(None)` once the socket is drained
    pub fn recv_from(&self, key: Key, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        let Some(entry) = self.sockets.get(key) else {
            return Ok(None);
        };
        match entry.socket.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn send_to(&self, key: Key, data: &[u8], destination: SocketAddr) -> io::Result<usize> {
        let entry = self
            .sockets
            .get(key)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "socket closed"))?;
        entry.socket.send_to(data, destination)
    }

    pub fn route(&self, key: Key, connection_id: &ConnectionId) -> Option<PeerHandle> {
        self.sockets
            .get(key)
            .and_then(|entry| entry.peers.get(connection_id).copied())
    }

    pub fn attach_peer(&mut self, key: Key, connection_id: ConnectionId, peer: PeerHandle) {
        if let Some(entry) = self.sockets.get_mut(key) {
            entry.peers.insert(connection_id, peer);
            debug!("Routing connection {} on {}", connection_id, entry.local_addr);
        }
    }

    pub fn detach_peer(&mut self, key: Key, connection_id: &ConnectionId) {
        if let Some(entry) = self.sockets.get_mut(key) {
            entry.peers.remove(connection_id);
        }
    }

    pub fn listener(&self, key: Key) -> Option<ListenerHandle> {
        self.sockets.get(key).and_then(|entry| entry.listener)
    }

    pub fn set_listener(&mut self, key: Key, listener: Option<ListenerHandle>) {
        if let Some(entry) = self.sockets.get_mut(key) {
            entry.listener = listener;
        }
    }

    /// Neither listening nor carrying peers
    pub fn is_idle(&self, key: Key) -> bool {
        self.sockets
            .get(key)
            .is_some_and(|entry| entry.listener.is_none() && entry.peers.is_empty())
    }

    /// Drop the socket, closing it
    pub fn close(&mut self, key: Key) -> bool {
        match self.sockets.remove(key) {
            Some(entry) => {
                info!("UDP socket on {} closed", entry.local_addr);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_bind_conflict_is_address_in_use() {
        let mut mux = UdpMultiplexer::new();
        let key = mux.bind(loopback()).unwrap();
        let addr = mux.local_addr(key).unwrap();

        let err = mux.bind(addr).unwrap_err();
        assert!(matches!(err, QuicError::AddressInUse(a) if a == addr));
        assert_eq!(mux.find_by_local_addr(addr), Some(key));
    }

    #[test]
    fn test_send_and_receive() {
        let mut mux = UdpMultiplexer::new();
        let a = mux.bind(loopback()).unwrap();
        let b = mux.bind(loopback()).unwrap();
        let b_addr = mux.local_addr(b).unwrap();

        let mut buf = [0u8; 64];
        assert!(mux.recv_from(b, &mut buf).unwrap().is_none());

        mux.send_to(a, b"datagram", b_addr).unwrap();
        let mut received = None;
        for _ in 0..100 {
            received = mux.recv_from(b, &mut buf).unwrap();
            if received.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let (len, from) = received.unwrap();
        assert_eq!(&buf[..len], b"datagram");
        assert_eq!(from.port(), mux.local_addr(a).unwrap().port());
    }

    #[test]
    fn test_routing_table_and_idle_state() {
        let mut mux = UdpMultiplexer::new();
        let key = mux.bind(loopback()).unwrap();
        assert!(mux.is_idle(key));

        let mut peers = Arena::new();
        let peer = PeerHandle(peers.insert(()));
        let cid = ConnectionId::from_bytes([5; 8]);
        mux.attach_peer(key, cid, peer);
        assert_eq!(mux.route(key, &cid), Some(peer));
        assert!(!mux.is_idle(key));

        mux.detach_peer(key, &cid);
        assert_eq!(mux.route(key, &cid), None);
        assert!(mux.is_idle(key));

        assert!(mux.close(key));
        assert!(!mux.close(key));
        assert!(mux.is_empty());
    }
}
