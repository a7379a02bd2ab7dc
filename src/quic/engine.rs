//! The engine: listeners, peers and streams behind generational handles,
//! driven by an event loop and reporting readiness through callbacks.
//!
//! One loop iteration is `before()` (read the clock, drain sockets, fire
//! timers, dispatch callbacks) followed by `after()` (reap finished state,
//! flush outgoing datagrams, arm the loop timer). The built-in loop runs both
//! for you; an external loop calls them itself.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use super::connection::{Connection, ConnectionId, ConnectionState, ConnectionStats, Side};
use super::error::{LoopError, QuicError, Result};
use super::events::ConnectionEvent;
use super::handle::{Arena, Key, ListenerHandle, PeerHandle, StreamHandle};
use super::listener::Listener;
use super::packet::{PacketHeader, PacketType};
use super::stream::{Stream, StreamId};
use super::time_cache::TimeCache;
use super::udp_mux::UdpMultiplexer;
use crate::config::EngineConfig;
use crate::crypto::{CryptoProvider, provider_from_config};
use crate::reactor::{BuiltinReactor, LoopDriver, Reactor};

/// Invoked when a peer has streams waiting to be accepted
pub type AcceptableCallback = Rc<dyn Fn(&mut Engine, PeerHandle)>;

/// Invoked when a stream becomes readable or writable
pub type StreamCallback = Rc<dyn Fn(&mut Engine, StreamHandle)>;

const NO_ERROR: u64 = 0;

const RECV_BUFFER_SIZE: usize = 65536;

enum Notification {
    Acceptable { callback: AcceptableCallback, peer: PeerHandle },
    Readable(StreamHandle),
    Writable(StreamHandle),
}

struct StreamEntry {
    on_writable: StreamCallback,
    on_readable: StreamCallback,
    context: Option<Box<dyn Any>>,
}

struct PeerEntry {
    connection: Connection,
    socket: Key,
    listener: Option<ListenerHandle>,
    /// Announces streams that arrive after the peer itself was announced
    on_acceptable: Option<AcceptableCallback>,
    context: Option<Box<dyn Any>>,
    streams: HashMap<StreamId, StreamEntry>,
    /// Closed because it finished; dropped once the close is on the wire
    reclaim_after_flush: bool,
}

impl PeerEntry {
    fn new(
        connection: Connection,
        socket: Key,
        listener: Option<ListenerHandle>,
        on_acceptable: Option<AcceptableCallback>,
    ) -> Self {
        Self {
            connection,
            socket,
            listener,
            on_acceptable,
            context: None,
            streams: HashMap::new(),
            reclaim_after_flush: false,
        }
    }
}

pub struct Engine {
    config: EngineConfig,
    time: TimeCache,
    crypto: Box<dyn CryptoProvider>,
    listeners: Arena<Listener>,
    peers: Arena<PeerEntry>,
    /// Declared ahead of `mux` so the loop lets go of the sockets first
    driver: LoopDriver,
    mux: UdpMultiplexer,
    notifications: VecDeque<Notification>,
    dispatching: bool,
    /// Between the start of `before` and the end of `after`
    in_iteration: bool,
    in_loop: bool,
    break_requested: bool,
    read_backlog: bool,
    recv_buffer: Vec<u8>,
}

impl Engine {
    /// Create an engine with packet protection chosen by `config.crypto`
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let crypto = provider_from_config(&config.crypto)?;
        Self::with_crypto(config, crypto)
    }

    pub fn with_crypto(config: EngineConfig, crypto: Box<dyn CryptoProvider>) -> Result<Self> {
        config.validate()?;
        info!("Engine created with {} packet protection", crypto.name());
        Ok(Self {
            config,
            time: TimeCache::new(),
            crypto,
            listeners: Arena::new(),
            peers: Arena::new(),
            mux: UdpMultiplexer::new(),
            driver: LoopDriver::Unset,
            notifications: VecDeque::new(),
            dispatching: false,
            in_iteration: false,
            in_loop: false,
            break_requested: false,
            read_backlog: false,
            recv_buffer: vec![0u8; RECV_BUFFER_SIZE],
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The time observed at the start of the current loop iteration
    pub fn now(&self) -> Instant {
        self.time.now()
    }

    pub fn time_cache(&self) -> &TimeCache {
        &self.time
    }

    // ---- event loop ----

    /// Use the built-in loop. May be called once per engine.
    pub fn init_loop(&mut self) -> Result<()> {
        if self.driver.is_set() {
            return Err(LoopError::AlreadyInitialized.into());
        }
        let reactor = BuiltinReactor::new()?;
        self.install_driver(LoopDriver::Builtin(reactor))
    }

    /// Hand the engine to a caller-owned loop, which must call `before` when
    /// a socket is readable or the timer fires, and `after` once it returns.
    pub fn event_base_loop_init(&mut self, reactor: Box<dyn Reactor>) -> Result<()> {
        if self.driver.is_set() {
            return Err(LoopError::AlreadyInitialized.into());
        }
        self.install_driver(LoopDriver::External(reactor))
    }

    fn install_driver(&mut self, driver: LoopDriver) -> Result<()> {
        self.driver = driver;
        debug!("Engine driven by the {} loop", self.driver.name());
        let sources: Vec<_> = self.mux.keys().into_iter().filter_map(|key| self.mux.io_source(key)).collect();
        if let Some(reactor) = self.driver.reactor_mut() {
            for source in sources {
                reactor.register(source)?;
            }
        }
        Ok(())
    }

    pub fn loop_kind(&self) -> &'static str {
        self.driver.name()
    }

    /// First half of a loop iteration
    pub fn before(&mut self) -> Result<()> {
        if self.dispatching {
            return Err(LoopError::Reentrant.into());
        }
        self.in_iteration = true;
        let now = self.time.refresh();
        self.receive_all();
        self.run_timers(now);
        self.dispatch();
        Ok(())
    }

    /// Second half of a loop iteration
    pub fn after(&mut self) -> Result<()> {
        if self.dispatching {
            return Err(LoopError::Reentrant.into());
        }
        self.reap();
        self.flush();
        self.reclaim_peers();

        let deadline = self.next_deadline();
        if let Some(reactor) = self.driver.reactor_mut() {
            reactor.schedule_timeout(deadline);
        }
        self.in_iteration = false;
        Ok(())
    }

    /// Run the built-in loop until `break_loop` is called
    pub fn run(&mut self) -> Result<()> {
        self.loop_with_timeout(None)
    }

    /// Run the built-in loop until `break_loop` is called or `timeout` elapses
    pub fn loop_with_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.dispatching || self.in_loop {
            return Err(LoopError::Reentrant.into());
        }
        if !matches!(self.driver, LoopDriver::Builtin(_)) {
            return Err(LoopError::NotBuiltin.into());
        }

        let end = timeout.map(|timeout| Instant::now() + timeout);
        self.in_loop = true;
        self.break_requested = false;

        let result = loop {
            if let Err(e) = self.before().and_then(|_| self.after()) {
                break Err(e);
            }
            if self.break_requested {
                break Ok(());
            }
            if end.is_some_and(|end| Instant::now() >= end) {
                break Ok(());
            }
            if let LoopDriver::Builtin(reactor) = &mut self.driver {
                reactor.wait(end);
            }
        };

        self.in_loop = false;
        self.break_requested = false;
        result
    }

    /// Stop the built-in loop after the current iteration
    pub fn break_loop(&mut self) {
        self.break_requested = true;
    }

    /// When the engine next needs `before` to run, absent socket activity
    pub fn next_deadline(&self) -> Option<Instant> {
        let now = self.time.now();
        let busy = self.read_backlog
            || !self.notifications.is_empty()
            || self
                .peers
                .iter()
                .any(|(_, peer)| peer.connection.has_pending_events() || peer.connection.wants_transmit());
        if busy {
            return Some(now);
        }

        self.peers.iter().filter_map(|(_, peer)| peer.connection.next_timeout()).min()
    }

    fn receive_all(&mut self) {
        let mut buf = std::mem::take(&mut self.recv_buffer);
        let limit = self.config.connection.max_datagrams_per_poll;
        self.read_backlog = false;

        for socket in self.mux.keys() {
            let mut received = 0;
            loop {
                if received == limit {
                    // leave the rest for the next iteration
                    self.read_backlog = true;
                    break;
                }
                match self.mux.recv_from(socket, &mut buf) {
                    Ok(Some((len, from))) => {
                        received += 1;
                        self.handle_datagram(socket, &buf[..len], from);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Receive failed on socket {}: {}", socket.index(), e);
                        break;
                    }
                }
            }
        }

        self.recv_buffer = buf;
    }

    fn handle_datagram(&mut self, socket: Key, datagram: &[u8], from: SocketAddr) {
        let now = self.time.now();
        let (header, header_len) = match PacketHeader::decode(datagram) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("Dropping datagram from {}: {}", from, e);
                return;
            }
        };
        let (header_bytes, body) = datagram.split_at(header_len);

        if let Some(peer) = self.mux.route(socket, &header.connection_id) {
            if let Some(entry) = self.peers.get_mut(peer.0) {
                if let Err(e) = entry.connection.handle_packet(now, &header, header_bytes, body) {
                    debug!("Dropping packet for {} from {}: {}", peer, from, e);
                }
            }
            return;
        }

        self.accept_peer(socket, &header, header_bytes, body, from);
    }

    /// Create a server-side peer for a first packet from an unknown connection
    fn accept_peer(&mut self, socket: Key, header: &PacketHeader, header_bytes: &[u8], body: &[u8], from: SocketAddr) {
        let connection_id = header.connection_id;
        let Some(listener_handle) = self.mux.listener(socket) else {
            trace!("No listener for connection {} from {}", connection_id, from);
            return;
        };
        if header.packet_type != PacketType::Initial {
            debug!("Dropping {:?} packet for unknown connection {} from {}", header.packet_type, connection_id, from);
            return;
        }
        let Some(on_acceptable) = self.listeners.get(listener_handle.0).map(|l| l.on_acceptable.clone()) else {
            return;
        };

        let protection = match self.crypto.packet_protection(&connection_id) {
            Ok(protection) => protection,
            Err(e) => {
                warn!("Cannot protect connection {}: {}", connection_id, e);
                return;
            }
        };
        let now = self.time.now();
        let mut connection = Connection::new(Side::Server, connection_id, from, protection, &self.config, now);
        if let Err(e) = connection.handle_packet(now, header, header_bytes, body) {
            debug!("Rejecting connection attempt from {}: {}", from, e);
            return;
        }

        let peer = PeerHandle(self.peers.insert(PeerEntry::new(
            connection,
            socket,
            Some(listener_handle),
            None,
        )));
        self.mux.attach_peer(socket, connection_id, peer);
        if let Some(listener) = self.listeners.get_mut(listener_handle.0) {
            listener.peers.insert(peer);
        }

        info!("Accepted peer {} from {} (connection {})", peer, from, connection_id);
        // the only time the listener hears about this peer
        self.notifications.push_back(Notification::Acceptable {
            callback: on_acceptable,
            peer,
        });
    }

    fn run_timers(&mut self, now: Instant) {
        for (_, entry) in self.peers.iter_mut() {
            if entry.connection.next_timeout().is_some_and(|deadline| deadline <= now) {
                entry.connection.on_timeout(now);
            }
        }
    }

    fn collect_events(&mut self) {
        for (key, entry) in self.peers.iter_mut() {
            let peer = PeerHandle(key);
            while let Some(event) = entry.connection.poll_event() {
                let notification = match event {
                    ConnectionEvent::IncomingStream => match &entry.on_acceptable {
                        Some(callback) => Notification::Acceptable {
                            callback: callback.clone(),
                            peer,
                        },
                        None => {
                            trace!("Peer {} has streams waiting and no acceptable callback", peer);
                            continue;
                        }
                    },
                    ConnectionEvent::StreamReadable(id) => Notification::Readable(StreamHandle { peer, id }),
                    ConnectionEvent::StreamWritable(id) => Notification::Writable(StreamHandle { peer, id }),
                    ConnectionEvent::Closed => {
                        debug!("Peer {} closed", peer);
                        continue;
                    }
                };
                self.notifications.push_back(notification);
            }
        }
    }

    fn dispatch(&mut self) {
        self.dispatching = true;
        loop {
            self.collect_events();
            let Some(notification) = self.notifications.pop_front() else {
                break;
            };
            match notification {
                Notification::Acceptable { callback, peer } => {
                    if self.peers.contains(peer.0) {
                        callback(self, peer);
                    }
                }
                Notification::Readable(stream) => {
                    if let Some(callback) = self.stream_entry(stream).map(|entry| entry.on_readable.clone()) {
                        callback(self, stream);
                    }
                }
                Notification::Writable(stream) => {
                    if let Some(callback) = self.stream_entry(stream).map(|entry| entry.on_writable.clone()) {
                        callback(self, stream);
                    }
                }
            }
        }
        self.dispatching = false;
    }

    fn reap(&mut self) {
        for (key, entry) in self.peers.iter_mut() {
            for id in entry.connection.reap_streams() {
                entry.streams.remove(&id);
            }
            if entry.connection.is_finished() {
                debug!("Peer {} has no streams left, closing", PeerHandle(key));
                entry.connection.close(NO_ERROR, "finished");
                entry.reclaim_after_flush = true;
            }
        }
    }

    fn flush(&mut self) {
        let now = self.time.now();
        let limit = self.config.connection.max_packets_per_flush;
        for (key, entry) in self.peers.iter_mut() {
            let remote = entry.connection.remote_addr();
            for _ in 0..limit {
                let datagram = match entry.connection.poll_transmit(now) {
                    Ok(Some(datagram)) => datagram,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to build packet for {}: {}", PeerHandle(key), e);
                        break;
                    }
                };
                // an unsent datagram is recovered like any lost one
                if let Err(e) = self.mux.send_to(entry.socket, &datagram, remote) {
                    debug!("Send to {} failed: {}", remote, e);
                    if e.kind() == io::ErrorKind::WouldBlock {
                        break;
                    }
                }
            }
        }
    }

    fn reclaim_peers(&mut self) {
        let now = self.time.now();
        let done: Vec<PeerHandle> = self
            .peers
            .iter()
            .filter(|(_, entry)| {
                (entry.reclaim_after_flush && entry.connection.state() == ConnectionState::Closed)
                    || entry.connection.is_drained(now)
            })
            .map(|(key, _)| PeerHandle(key))
            .collect();
        for peer in done {
            self.remove_peer(peer);
        }
    }

    fn remove_peer(&mut self, peer: PeerHandle) {
        let Some(entry) = self.peers.remove(peer.0) else {
            return;
        };
        self.mux.detach_peer(entry.socket, &entry.connection.connection_id());

        if let Some(handle) = entry.listener {
            let defunct = match self.listeners.get_mut(handle.0) {
                Some(listener) => {
                    listener.peers.remove(&peer);
                    listener.is_defunct()
                }
                None => false,
            };
            if defunct {
                self.listeners.remove(handle.0);
            }
        }

        let stats = entry.connection.stats();
        info!(
            "Reclaimed peer {} ({} packets sent, {} received, {} lost)",
            peer, stats.packets_sent, stats.packets_received, stats.packets_lost
        );
        self.close_socket_if_idle(entry.socket);
    }

    fn bind_socket(&mut self, addr: SocketAddr) -> Result<Key> {
        let socket = self.mux.bind(addr)?;
        if let (Some(source), Some(reactor)) = (self.mux.io_source(socket), self.driver.reactor_mut()) {
            if let Err(e) = reactor.register(source) {
                self.mux.close(socket);
                return Err(e.into());
            }
        }
        Ok(socket)
    }

    fn close_socket_if_idle(&mut self, socket: Key) {
        if self.mux.is_idle(socket) {
            self.close_socket(socket);
        }
    }

    fn close_socket(&mut self, socket: Key) {
        if let (Some(source), Some(reactor)) = (self.mux.io_source(socket), self.driver.reactor_mut()) {
            reactor.deregister(source);
        }
        self.mux.close(socket);
    }

    // ---- listeners ----

    /// Accept peers on `addr`. `acceptable` fires exactly once for every new
    /// peer. Streams the peer opens later are announced through the callback
    /// installed with [`Engine::set_peer_acceptable`].
    pub fn listen<F>(&mut self, addr: SocketAddr, acceptable: F) -> Result<ListenerHandle>
    where
        F: Fn(&mut Engine, PeerHandle) + 'static,
    {
        let socket = match self.mux.find_by_local_addr(addr) {
            Some(socket) if self.mux.listener(socket).is_some() => {
                return Err(QuicError::AddressInUse(addr));
            }
            Some(socket) => {
                debug!("Reusing socket on {} for a new listener", addr);
                socket
            }
            None => self.bind_socket(addr)?,
        };
        let local_addr = self.mux.local_addr(socket).unwrap_or(addr);

        let handle = ListenerHandle(self.listeners.insert(Listener::new(local_addr, socket, Rc::new(acceptable))));
        self.mux.set_listener(socket, Some(handle));
        info!("Listening on {}", local_addr);
        Ok(handle)
    }

    pub fn listener_local_addr(&self, listener: ListenerHandle) -> Option<SocketAddr> {
        self.listeners
            .get(listener.0)
            .filter(|listener| !listener.shutdown)
            .map(|listener| listener.local_addr)
    }

    /// Stop accepting new peers. Existing peers keep running.
    pub fn shutdown(&mut self, listener: ListenerHandle) {
        let Some(record) = self.listeners.get_mut(listener.0) else {
            return;
        };
        if record.shutdown {
            return;
        }
        record.shutdown = true;
        let socket = record.socket;
        let local_addr = record.local_addr;
        let defunct = record.is_defunct();

        if self.mux.listener(socket) == Some(listener) {
            self.mux.set_listener(socket, None);
        }
        if defunct {
            self.listeners.remove(listener.0);
        }
        info!("Listener on {} shut down", local_addr);
        self.close_socket_if_idle(socket);
    }

    // ---- peers ----

    /// Start an outbound peer. Nothing is sent until a stream carries data.
    pub fn open<F>(&mut self, addr: SocketAddr, acceptable: F) -> Result<PeerHandle>
    where
        F: Fn(&mut Engine, PeerHandle) + 'static,
    {
        let bind_addr = match addr {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = self.bind_socket(bind_addr)?;

        let connection_id = ConnectionId::new();
        let protection = match self.crypto.packet_protection(&connection_id) {
            Ok(protection) => protection,
            Err(e) => {
                self.close_socket(socket);
                return Err(e);
            }
        };
        // the cache may be stale if no iteration has run for a while
        let now = if self.in_iteration { self.time.now() } else { self.time.catch_up() };
        let connection = Connection::new(Side::Client, connection_id, addr, protection, &self.config, now);
        let on_acceptable: AcceptableCallback = Rc::new(acceptable);
        let peer = PeerHandle(self.peers.insert(PeerEntry::new(connection, socket, None, Some(on_acceptable))));
        self.mux.attach_peer(socket, connection_id, peer);

        info!("Opened peer {} to {} (connection {})", peer, addr, connection_id);
        Ok(peer)
    }

    /// Open a locally initiated stream on `peer`
    pub fn connect<W, R>(&mut self, peer: PeerHandle, writable: W, readable: R) -> Result<StreamHandle>
    where
        W: Fn(&mut Engine, StreamHandle) + 'static,
        R: Fn(&mut Engine, StreamHandle) + 'static,
    {
        let entry = self.peers.get_mut(peer.0).ok_or_else(|| stale(peer))?;
        let id = entry.connection.open_stream()?;
        entry.streams.insert(id, StreamEntry::new(Rc::new(writable), Rc::new(readable)));
        debug!("Peer {} opened stream {}", peer, id);
        Ok(StreamHandle { peer, id })
    }

    /// Take the oldest stream the remote opened. Fails with
    /// `StreamError::NoPendingStream` when none is waiting, after which the
    /// peer's acceptable callback fires again for the next one.
    pub fn accept<W, R>(&mut self, peer: PeerHandle, writable: W, readable: R) -> Result<StreamHandle>
    where
        W: Fn(&mut Engine, StreamHandle) + 'static,
        R: Fn(&mut Engine, StreamHandle) + 'static,
    {
        let entry = self.peers.get_mut(peer.0).ok_or_else(|| stale(peer))?;
        let id = entry.connection.accept_stream()?;
        entry.streams.insert(id, StreamEntry::new(Rc::new(writable), Rc::new(readable)));
        debug!("Peer {} accepted stream {}", peer, id);
        Ok(StreamHandle { peer, id })
    }

    /// Install the callback that fires when `peer` has new streams waiting,
    /// once `accept` has come back with `StreamError::NoPendingStream`.
    /// Replaces the callback given to `open`. If streams are already waiting
    /// the callback is scheduled right away.
    pub fn set_peer_acceptable<F>(&mut self, peer: PeerHandle, acceptable: F) -> Result<()>
    where
        F: Fn(&mut Engine, PeerHandle) + 'static,
    {
        let entry = self.peers.get_mut(peer.0).ok_or_else(|| stale(peer))?;
        let callback: AcceptableCallback = Rc::new(acceptable);
        entry.on_acceptable = Some(callback.clone());
        if entry.connection.pending_accept_count() > 0 {
            self.notifications.push_back(Notification::Acceptable { callback, peer });
        }
        Ok(())
    }

    /// Close the peer's connection. Its streams are abandoned.
    pub fn close_peer(&mut self, peer: PeerHandle) {
        if let Some(entry) = self.peers.get_mut(peer.0) {
            entry.connection.close(NO_ERROR, "closed by application");
        }
    }

    pub fn is_peer_alive(&self, peer: PeerHandle) -> bool {
        self.peers.get(peer.0).is_some_and(|entry| !entry.connection.is_closed())
    }

    pub fn peer_state(&self, peer: PeerHandle) -> Option<ConnectionState> {
        self.peers.get(peer.0).map(|entry| entry.connection.state())
    }

    pub fn peer_stats(&self, peer: PeerHandle) -> Option<ConnectionStats> {
        self.peers.get(peer.0).map(|entry| entry.connection.stats())
    }

    pub fn peer_remote_addr(&self, peer: PeerHandle) -> Option<SocketAddr> {
        self.peers.get(peer.0).map(|entry| entry.connection.remote_addr())
    }

    pub fn peers(&self) -> Vec<PeerHandle> {
        self.peers.keys().into_iter().map(PeerHandle).collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.iter().filter(|(_, listener)| !listener.shutdown).count()
    }

    pub fn socket_count(&self) -> usize {
        self.mux.len()
    }

    // ---- streams ----

    fn stream_entry(&self, stream: StreamHandle) -> Option<&StreamEntry> {
        self.peers.get(stream.peer.0)?.streams.get(&stream.id)
    }

    fn stream_mut(&mut self, stream: StreamHandle) -> Option<&mut Stream> {
        self.peers.get_mut(stream.peer.0)?.connection.stream_mut(stream.id)
    }

    /// Queue bytes for sending. Returns how many were taken; 0 means the
    /// buffer is full and the writable callback will fire once there is room.
    pub fn write(&mut self, stream: StreamHandle, data: &[u8]) -> Result<usize> {
        match self.stream_mut(stream) {
            Some(s) => s.write(data),
            None => Ok(0),
        }
    }

    pub fn write_close(&mut self, stream: StreamHandle) {
        if let Some(s) = self.stream_mut(stream) {
            s.write_close();
        }
    }

    pub fn write_is_closed(&self, stream: StreamHandle) -> bool {
        self.peers
            .get(stream.peer.0)
            .and_then(|entry| entry.connection.stream(stream.id))
            .is_none_or(|s| s.write_is_closed())
    }

    /// Copy received bytes into `buf`. 0 means nothing is buffered; the
    /// readable callback fires when more arrives.
    pub fn read(&mut self, stream: StreamHandle, buf: &mut [u8]) -> usize {
        match self.stream_mut(stream) {
            Some(s) => s.read(buf),
            None => 0,
        }
    }

    pub fn read_close(&mut self, stream: StreamHandle) {
        if let Some(s) = self.stream_mut(stream) {
            s.read_close();
        }
    }

    pub fn read_is_closed(&self, stream: StreamHandle) -> bool {
        self.peers
            .get(stream.peer.0)
            .and_then(|entry| entry.connection.stream(stream.id))
            .is_none_or(|s| s.read_is_closed())
    }

    pub fn is_stream_alive(&self, stream: StreamHandle) -> bool {
        self.stream_entry(stream).is_some()
    }

    // ---- user context ----

    pub fn set_peer_context<T: Any>(&mut self, peer: PeerHandle, context: T) -> Result<()> {
        let entry = self.peers.get_mut(peer.0).ok_or_else(|| stale(peer))?;
        entry.context = Some(Box::new(context));
        Ok(())
    }

    pub fn peer_context<T: Any>(&self, peer: PeerHandle) -> Option<&T> {
        self.peers.get(peer.0)?.context.as_deref()?.downcast_ref()
    }

    pub fn peer_context_mut<T: Any>(&mut self, peer: PeerHandle) -> Option<&mut T> {
        self.peers.get_mut(peer.0)?.context.as_deref_mut()?.downcast_mut()
    }

    pub fn set_stream_context<T: Any>(&mut self, stream: StreamHandle, context: T) -> Result<()> {
        let entry = self
            .peers
            .get_mut(stream.peer.0)
            .and_then(|peer| peer.streams.get_mut(&stream.id))
            .ok_or_else(|| QuicError::StaleHandle(stream.to_string()))?;
        entry.context = Some(Box::new(context));
        Ok(())
    }

    pub fn stream_context<T: Any>(&self, stream: StreamHandle) -> Option<&T> {
        self.stream_entry(stream)?.context.as_deref()?.downcast_ref()
    }

    pub fn stream_context_mut<T: Any>(&mut self, stream: StreamHandle) -> Option<&mut T> {
        self.peers
            .get_mut(stream.peer.0)?
            .streams
            .get_mut(&stream.id)?
            .context
            .as_deref_mut()?
            .downcast_mut()
    }

    // ---- teardown ----

    /// Shut every listener, close every peer, send what can be sent and
    /// release all sockets. The engine stays usable afterwards.
    pub fn close(&mut self) {
        for key in self.listeners.keys() {
            self.shutdown(ListenerHandle(key));
        }
        for (_, entry) in self.peers.iter_mut() {
            entry.connection.close(NO_ERROR, "engine closed");
        }
        self.flush();
        for key in self.peers.keys() {
            self.remove_peer(PeerHandle(key));
        }
        for socket in self.mux.keys() {
            self.close_socket(socket);
        }
        self.notifications.clear();
        info!("Engine closed");
    }
}

impl StreamEntry {
    fn new(on_writable: StreamCallback, on_readable: StreamCallback) -> Self {
        Self {
            on_writable,
            on_readable,
            context: None,
        }
    }
}

fn stale(peer: PeerHandle) -> QuicError {
    QuicError::StaleHandle(peer.to_string())
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("crypto", &self.crypto.name())
            .field("loop", &self.driver.name())
            .field("listeners", &self.listeners.len())
            .field("peers", &self.peers.len())
            .field("sockets", &self.mux.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::quic::error::StreamError;
    use std::cell::RefCell;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn engine() -> Engine {
        Engine::new(EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_init_loop_once() {
        let mut engine = engine();
        assert_eq!(engine.loop_kind(), "unset");
        engine.init_loop().unwrap();
        assert_eq!(engine.loop_kind(), "builtin");

        let err = engine.init_loop().unwrap_err();
        assert!(matches!(err, QuicError::Loop(LoopError::AlreadyInitialized)));
    }

    #[test]
    fn test_loop_requires_builtin() {
        let mut engine = engine();
        let err = engine.loop_with_timeout(Some(Duration::from_millis(1))).unwrap_err();
        assert!(matches!(err, QuicError::Loop(LoopError::NotBuiltin)));
    }

    #[test]
    fn test_listen_twice_on_same_address() {
        let mut engine = engine();
        let listener = engine.listen(loopback(), |_, _| {}).unwrap();
        let addr = engine.listener_local_addr(listener).unwrap();

        let err = engine.listen(addr, |_, _| {}).unwrap_err();
        assert!(matches!(err, QuicError::AddressInUse(a) if a == addr));

        engine.shutdown(listener);
        engine.shutdown(listener);
        assert_eq!(engine.listener_count(), 0);
        assert_eq!(engine.socket_count(), 0);

        // the address is free again
        let again = engine.listen(addr, |_, _| {}).unwrap();
        assert_eq!(engine.listener_local_addr(again), Some(addr));
        assert_eq!(engine.listener_local_addr(listener), None);
    }

    #[test]
    fn test_stale_handles_are_harmless() {
        let mut engine = engine();
        let peer = engine.open("127.0.0.1:9".parse().unwrap(), |_, _| {}).unwrap();
        let stream = engine.connect(peer, |_, _| {}, |_, _| {}).unwrap();
        assert!(engine.is_stream_alive(stream));

        engine.close();
        assert_eq!(engine.peer_count(), 0);
        assert_eq!(engine.socket_count(), 0);

        assert_eq!(engine.write(stream, b"late").unwrap(), 0);
        assert!(engine.write_is_closed(stream));
        assert!(engine.read_is_closed(stream));
        let mut buf = [0u8; 8];
        assert_eq!(engine.read(stream, &mut buf), 0);
        engine.write_close(stream);
        engine.read_close(stream);
        engine.close_peer(peer);

        let err = engine.connect(peer, |_, _| {}, |_, _| {}).unwrap_err();
        assert!(matches!(err, QuicError::StaleHandle(_)));
        assert!(engine.set_peer_acceptable(peer, |_, _| {}).is_err());
        assert!(!engine.is_peer_alive(peer));
    }

    #[test]
    fn test_open_catches_up_a_stale_clock() {
        let mut engine = engine();
        let created = engine.now();
        std::thread::sleep(Duration::from_millis(5));
        engine.open("127.0.0.1:9".parse().unwrap(), |_, _| {}).unwrap();
        assert!(engine.now() > created);
        assert_eq!(engine.time_cache().refreshes(), 0);
    }

    #[test]
    fn test_accept_with_nothing_pending() {
        let mut engine = engine();
        let peer = engine.open("127.0.0.1:9".parse().unwrap(), |_, _| {}).unwrap();
        let err = engine.accept(peer, |_, _| {}, |_, _| {}).unwrap_err();
        assert!(matches!(err, QuicError::Stream(StreamError::NoPendingStream)));
    }

    #[test]
    fn test_contexts() {
        let mut engine = engine();
        let peer = engine.open("127.0.0.1:9".parse().unwrap(), |_, _| {}).unwrap();
        let stream = engine.connect(peer, |_, _| {}, |_, _| {}).unwrap();

        engine.set_peer_context(peer, String::from("peer")).unwrap();
        engine.set_stream_context(stream, 7u32).unwrap();
        assert_eq!(engine.peer_context::<String>(peer).map(String::as_str), Some("peer"));
        assert_eq!(engine.peer_context::<u32>(peer), None);

        *engine.stream_context_mut::<u32>(stream).unwrap() += 1;
        assert_eq!(engine.stream_context::<u32>(stream), Some(&8));
    }

    #[test]
    fn test_before_inside_callback_is_rejected() {
        let mut config = ConfigBuilder::new().build().unwrap();
        config.connection.auto_reclaim = false;
        let mut server = Engine::new(config.clone()).unwrap();
        let mut client = Engine::new(config).unwrap();

        let outcome: Rc<RefCell<Option<Result<()>>>> = Rc::new(RefCell::new(None));
        let seen = outcome.clone();
        let listener = server
            .listen(loopback(), move |engine, _| {
                *seen.borrow_mut() = Some(engine.before());
            })
            .unwrap();
        let addr = engine_addr(&server, listener);

        let peer = client.open(addr, |_, _| {}).unwrap();
        let stream = client.connect(peer, |_, _| {}, |_, _| {}).unwrap();
        client.write(stream, b"hello").unwrap();
        client.after().unwrap();

        for _ in 0..200 {
            server.before().unwrap();
            server.after().unwrap();
            if outcome.borrow().is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let result = outcome.borrow_mut().take().unwrap();
        assert!(matches!(result, Err(QuicError::Loop(LoopError::Reentrant))));
    }

    fn engine_addr(engine: &Engine, listener: ListenerHandle) -> SocketAddr {
        engine.listener_local_addr(listener).unwrap()
    }
}
