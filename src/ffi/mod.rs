//! C ABI
//!
//! Mirrors the `quux_*` C interface. Handles cross the boundary as opaque
//! tokens that are never dereferenced: listeners and peers carry their
//! generational key, streams an index into a per-thread token table. The
//! engine itself is per-thread.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::c_char;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::time::{Duration, Instant};
use tracing::{error, warn};

use crate::config::EngineConfig;
use crate::observability::{init_tracing, level_from_index};
use crate::quic::engine::Engine;
use crate::quic::handle::{Key, ListenerHandle, PeerHandle, StreamHandle};
use crate::reactor::{IoSource, Reactor};

// Status codes
pub const QUUX_OK: c_int = 0;
pub const QUUX_ERROR: c_int = -1;

const AF_INET: u16 = 2;
const AF_INET6: u16 = 10;

/// Called with a peer token when the peer has streams to accept
pub type QuuxAcceptable = extern "C" fn(*mut c_void);

/// Called with a stream token when the stream becomes readable or writable
pub type QuuxCallback = extern "C" fn(*mut c_void);

/// Hooks into a caller-owned event loop.
///
/// `register_fd` returns 0 on success. `schedule_timeout` receives the
/// number of milliseconds until `quux_event_base_loop_before` must run, or
/// -1 to cancel the timer.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct QuuxReactorOps {
    pub ctx: *mut c_void,
    pub register_fd: Option<extern "C" fn(*mut c_void, c_int) -> c_int>,
    pub deregister_fd: Option<extern "C" fn(*mut c_void, c_int)>,
    pub schedule_timeout: Option<extern "C" fn(*mut c_void, i64)>,
}

struct ExternalReactor {
    ops: QuuxReactorOps,
}

impl Reactor for ExternalReactor {
    fn register(&mut self, source: IoSource) -> io::Result<()> {
        match self.ops.register_fd {
            Some(register) if register(self.ops.ctx, source.fd) != 0 => Err(io::Error::other(format!(
                "event loop refused socket {}",
                source.local_addr
            ))),
            _ => Ok(()),
        }
    }

    fn deregister(&mut self, source: IoSource) {
        if let Some(deregister) = self.ops.deregister_fd {
            deregister(self.ops.ctx, source.fd);
        }
    }

    fn schedule_timeout(&mut self, deadline: Option<Instant>) {
        let Some(schedule) = self.ops.schedule_timeout else {
            return;
        };
        let millis = match deadline {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                // round up so the loop never wakes before the deadline
                wait.as_micros().div_ceil(1000).min(i64::MAX as u128) as i64
            }
            None => -1,
        };
        schedule(self.ops.ctx, millis);
    }
}

#[derive(Clone, Copy)]
struct ContextPtr(*mut c_void);

#[derive(Default)]
struct StreamTokens {
    next: u64,
    streams: HashMap<u64, StreamHandle>,
    prune_at: usize,
}

impl StreamTokens {
    fn reserve(&mut self) -> u64 {
        self.next += 1;
        self.next
    }

    fn bind(&mut self, token: u64, stream: StreamHandle, engine: &Engine) {
        if self.streams.len() >= self.prune_at {
            self.streams.retain(|_, stream| engine.is_stream_alive(*stream));
            self.prune_at = (self.streams.len() * 2).max(64);
        }
        self.streams.insert(token, stream);
    }

    fn get(&self, token: u64) -> Option<StreamHandle> {
        self.streams.get(&token).copied()
    }
}

thread_local! {
    static ENGINE: RefCell<Option<Engine>> = const { RefCell::new(None) };
    /// The engine currently running a callback, if any
    static ACTIVE: Cell<*mut Engine> = const { Cell::new(ptr::null_mut()) };
    static STREAM_TOKENS: RefCell<StreamTokens> = RefCell::new(StreamTokens::default());
}

fn new_engine() -> Option<Engine> {
    let config = EngineConfig::load_from_env().unwrap_or_else(|e| {
        warn!("Ignoring environment configuration: {}", e);
        EngineConfig::default()
    });
    match Engine::new(config) {
        Ok(engine) => Some(engine),
        Err(e) => {
            error!("Failed to create engine: {}", e);
            None
        }
    }
}

/// Run `f` against this thread's engine, creating it on first use
fn with_engine<R>(f: impl FnOnce(&mut Engine) -> R) -> Option<R> {
    let active = ACTIVE.with(Cell::get);
    if !active.is_null() {
        // SAFETY: ACTIVE is only set by `invoke` for the duration of a
        // callback, while the engine's own borrow is not used.
        return Some(f(unsafe { &mut *active }));
    }
    ENGINE.with(|slot| {
        let Ok(mut slot) = slot.try_borrow_mut() else {
            error!("quux called re-entrantly outside a callback");
            return None;
        };
        if slot.is_none() {
            *slot = new_engine();
        }
        slot.as_mut().map(f)
    })
}

/// Call into C with `engine` reachable from nested `quux_*` calls
fn invoke(engine: &mut Engine, f: impl FnOnce()) {
    let previous = ACTIVE.with(|active| active.replace(engine as *mut Engine));
    f();
    ACTIVE.with(|active| active.set(previous));
}

fn key_token(key: Key) -> *mut c_void {
    key.to_bits() as usize as *mut c_void
}

fn token_key(token: *mut c_void) -> Option<Key> {
    Key::from_bits(token as usize as u64)
}

fn peer_from(token: *mut c_void) -> Option<PeerHandle> {
    token_key(token).map(PeerHandle)
}

fn stream_from(token: *mut c_void) -> Option<StreamHandle> {
    STREAM_TOKENS.with(|tokens| tokens.borrow().get(token as usize as u64))
}

/// Read a `struct sockaddr_in` or `struct sockaddr_in6`
fn parse_sockaddr(addr: *const c_void) -> Option<SocketAddr> {
    if addr.is_null() {
        return None;
    }
    let bytes = addr as *const u8;
    // SAFETY: the caller passes a valid sockaddr; the family decides how much
    // of it we read.
    unsafe {
        let family = ptr::read_unaligned(bytes as *const u16);
        let port = u16::from_be(ptr::read_unaligned(bytes.add(2) as *const u16));
        match family {
            AF_INET => {
                let ip = ptr::read_unaligned(bytes.add(4) as *const [u8; 4]);
                Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port)))
            }
            AF_INET6 => {
                let flowinfo = u32::from_be(ptr::read_unaligned(bytes.add(4) as *const u32));
                let ip = ptr::read_unaligned(bytes.add(8) as *const [u8; 16]);
                let scope_id = ptr::read_unaligned(bytes.add(24) as *const u32);
                Some(SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(ip), port, flowinfo, scope_id)))
            }
            _ => None,
        }
    }
}

fn stream_callbacks(
    writable: QuuxCallback,
    readable: QuuxCallback,
    token: u64,
) -> (impl Fn(&mut Engine, StreamHandle) + 'static, impl Fn(&mut Engine, StreamHandle) + 'static) {
    let ptr = token as usize as *mut c_void;
    (
        move |engine: &mut Engine, _: StreamHandle| invoke(engine, || writable(ptr)),
        move |engine: &mut Engine, _: StreamHandle| invoke(engine, || readable(ptr)),
    )
}

fn acceptable_callback(cb: QuuxAcceptable) -> impl Fn(&mut Engine, PeerHandle) + 'static {
    move |engine: &mut Engine, peer: PeerHandle| invoke(engine, || cb(key_token(peer.key())))
}

// Loop setup

/// Use the built-in loop
#[unsafe(no_mangle)]
pub extern "C" fn quux_init_loop() -> c_int {
    match with_engine(|engine| engine.init_loop()) {
        Some(Ok(())) => QUUX_OK,
        Some(Err(e)) => {
            error!("quux_init_loop: {}", e);
            QUUX_ERROR
        }
        None => QUUX_ERROR,
    }
}

/// Use a caller-owned loop described by `ops`
#[unsafe(no_mangle)]
pub extern "C" fn quux_event_base_loop_init(ops: *const QuuxReactorOps) -> c_int {
    if ops.is_null() {
        return QUUX_ERROR;
    }
    let ops = unsafe { *ops };
    match with_engine(|engine| engine.event_base_loop_init(Box::new(ExternalReactor { ops }))) {
        Some(Ok(())) => QUUX_OK,
        Some(Err(e)) => {
            error!("quux_event_base_loop_init: {}", e);
            QUUX_ERROR
        }
        None => QUUX_ERROR,
    }
}

// Context

#[unsafe(no_mangle)]
pub extern "C" fn quux_set_peer_context(peer: *mut c_void, ctx: *mut c_void) {
    let Some(peer) = peer_from(peer) else { return };
    with_engine(|engine| engine.set_peer_context(peer, ContextPtr(ctx)));
}

#[unsafe(no_mangle)]
pub extern "C" fn quux_get_peer_context(peer: *mut c_void) -> *mut c_void {
    let Some(peer) = peer_from(peer) else {
        return ptr::null_mut();
    };
    with_engine(|engine| engine.peer_context::<ContextPtr>(peer).map(|ctx| ctx.0))
        .flatten()
        .unwrap_or(ptr::null_mut())
}

#[unsafe(no_mangle)]
pub extern "C" fn quux_set_stream_context(stream: *mut c_void, ctx: *mut c_void) {
    let Some(stream) = stream_from(stream) else { return };
    with_engine(|engine| engine.set_stream_context(stream, ContextPtr(ctx)));
}

#[unsafe(no_mangle)]
pub extern "C" fn quux_get_stream_context(stream: *mut c_void) -> *mut c_void {
    let Some(stream) = stream_from(stream) else {
        return ptr::null_mut();
    };
    with_engine(|engine| engine.stream_context::<ContextPtr>(stream).map(|ctx| ctx.0))
        .flatten()
        .unwrap_or(ptr::null_mut())
}

// Listeners and peers

/// Listen on `addr` (a `sockaddr_in` or `sockaddr_in6`). NULL on failure,
/// including when another listener holds the address.
#[unsafe(no_mangle)]
pub extern "C" fn quux_listen(addr: *const c_void, cb: Option<QuuxAcceptable>) -> *mut c_void {
    let (Some(addr), Some(cb)) = (parse_sockaddr(addr), cb) else {
        return ptr::null_mut();
    };
    match with_engine(|engine| engine.listen(addr, acceptable_callback(cb))) {
        Some(Ok(listener)) => key_token(listener.key()),
        Some(Err(e)) => {
            warn!("quux_listen on {}: {}", addr, e);
            ptr::null_mut()
        }
        None => ptr::null_mut(),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn quux_shutdown(listener: *mut c_void) {
    if let Some(key) = token_key(listener) {
        with_engine(|engine| engine.shutdown(ListenerHandle(key)));
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn quux_open(addr: *const c_void, cb: Option<QuuxAcceptable>) -> *mut c_void {
    let (Some(addr), Some(cb)) = (parse_sockaddr(addr), cb) else {
        return ptr::null_mut();
    };
    match with_engine(|engine| engine.open(addr, acceptable_callback(cb))) {
        Some(Ok(peer)) => key_token(peer.key()),
        Some(Err(e)) => {
            warn!("quux_open to {}: {}", addr, e);
            ptr::null_mut()
        }
        None => ptr::null_mut(),
    }
}

/// Callback for streams `peer` opens after its first announcement. It fires
/// once `quux_accept` has returned NULL and another stream arrives.
#[unsafe(no_mangle)]
pub extern "C" fn quux_set_peer_acceptable(peer: *mut c_void, cb: Option<QuuxAcceptable>) -> c_int {
    let (Some(peer), Some(cb)) = (peer_from(peer), cb) else {
        return QUUX_ERROR;
    };
    match with_engine(|engine| engine.set_peer_acceptable(peer, acceptable_callback(cb))) {
        Some(Ok(())) => QUUX_OK,
        _ => QUUX_ERROR,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn quux_close_peer(peer: *mut c_void) {
    if let Some(peer) = peer_from(peer) {
        with_engine(|engine| engine.close_peer(peer));
    }
}

// Streams

fn new_stream(
    peer: *mut c_void,
    writable: Option<QuuxCallback>,
    readable: Option<QuuxCallback>,
    accept: bool,
) -> *mut c_void {
    let (Some(peer), Some(writable), Some(readable)) = (peer_from(peer), writable, readable) else {
        return ptr::null_mut();
    };
    let token = STREAM_TOKENS.with(|tokens| tokens.borrow_mut().reserve());
    let (on_writable, on_readable) = stream_callbacks(writable, readable, token);

    let created = with_engine(|engine| {
        let stream = if accept {
            engine.accept(peer, on_writable, on_readable)
        } else {
            engine.connect(peer, on_writable, on_readable)
        };
        stream.map(|stream| STREAM_TOKENS.with(|tokens| tokens.borrow_mut().bind(token, stream, engine)))
    });
    match created {
        Some(Ok(())) => token as usize as *mut c_void,
        _ => ptr::null_mut(),
    }
}

/// The oldest stream waiting on `peer`, or NULL (which re-arms the peer's
/// acceptable callback)
#[unsafe(no_mangle)]
pub extern "C" fn quux_accept(
    peer: *mut c_void,
    writable: Option<QuuxCallback>,
    readable: Option<QuuxCallback>,
) -> *mut c_void {
    new_stream(peer, writable, readable, true)
}

#[unsafe(no_mangle)]
pub extern "C" fn quux_connect(
    peer: *mut c_void,
    writable: Option<QuuxCallback>,
    readable: Option<QuuxCallback>,
) -> *mut c_void {
    new_stream(peer, writable, readable, false)
}

#[unsafe(no_mangle)]
pub extern "C" fn quux_write(stream: *mut c_void, buf: *const u8, count: usize) -> usize {
    let Some(stream) = stream_from(stream) else { return 0 };
    if buf.is_null() || count == 0 {
        return 0;
    }
    let data = unsafe { std::slice::from_raw_parts(buf, count) };
    match with_engine(|engine| engine.write(stream, data)) {
        Some(Ok(written)) => written,
        Some(Err(e)) => {
            warn!("quux_write on {}: {}", stream, e);
            0
        }
        None => 0,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn quux_write_close(stream: *mut c_void) {
    if let Some(stream) = stream_from(stream) {
        with_engine(|engine| engine.write_close(stream));
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn quux_write_is_closed(stream: *mut c_void) -> c_int {
    let closed = match stream_from(stream) {
        Some(stream) => with_engine(|engine| engine.write_is_closed(stream)).unwrap_or(true),
        None => true,
    };
    closed as c_int
}

#[unsafe(no_mangle)]
pub extern "C" fn quux_read(stream: *mut c_void, buf: *mut u8, count: usize) -> usize {
    let Some(stream) = stream_from(stream) else { return 0 };
    if buf.is_null() || count == 0 {
        return 0;
    }
    let buf = unsafe { std::slice::from_raw_parts_mut(buf, count) };
    with_engine(|engine| engine.read(stream, buf)).unwrap_or(0)
}

#[unsafe(no_mangle)]
pub extern "C" fn quux_read_close(stream: *mut c_void) {
    if let Some(stream) = stream_from(stream) {
        with_engine(|engine| engine.read_close(stream));
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn quux_read_is_closed(stream: *mut c_void) -> c_int {
    let closed = match stream_from(stream) {
        Some(stream) => with_engine(|engine| engine.read_is_closed(stream)).unwrap_or(true),
        None => true,
    };
    closed as c_int
}

// Loop driving

/// Run the built-in loop forever
#[unsafe(no_mangle)]
pub extern "C" fn quux_loop() {
    if let Some(Err(e)) = with_engine(|engine| engine.run()) {
        error!("quux_loop: {}", e);
    }
}

/// Run the built-in loop for `timeout_ms`, or forever when negative
#[unsafe(no_mangle)]
pub extern "C" fn quux_loop_with_timeout(timeout_ms: c_int) {
    let timeout = u64::try_from(timeout_ms).ok().map(Duration::from_millis);
    if let Some(Err(e)) = with_engine(|engine| engine.loop_with_timeout(timeout)) {
        error!("quux_loop_with_timeout: {}", e);
    }
}

/// Call when the external loop wakes up
#[unsafe(no_mangle)]
pub extern "C" fn quux_event_base_loop_before() {
    if let Some(Err(e)) = with_engine(|engine| engine.before()) {
        error!("quux_event_base_loop_before: {}", e);
    }
}

/// Call before the external loop goes back to sleep
#[unsafe(no_mangle)]
pub extern "C" fn quux_event_base_loop_after() {
    if let Some(Err(e)) = with_engine(|engine| engine.after()) {
        error!("quux_event_base_loop_after: {}", e);
    }
}

// Utility functions

#[unsafe(no_mangle)]
pub extern "C" fn quux_version() -> *const c_char {
    static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");
    VERSION.as_ptr() as *const c_char
}

/// 0 (error) through 4 (trace). Fails if logging is already set up.
#[unsafe(no_mangle)]
pub extern "C" fn quux_init_logging(level: c_int) -> c_int {
    if init_tracing(level_from_index(level)) { QUUX_OK } else { QUUX_ERROR }
}
