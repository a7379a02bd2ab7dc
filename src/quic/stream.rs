//! Stream implementation
//!
//! A stream is a pair of independent byte pipes sharing one identifier: the
//! send half buffers application writes until the peer acknowledges them, the
//! receive half reassembles possibly reordered segments into an in-order byte
//! sequence. Each half carries its own edge-triggered [`Readiness`].

use std::collections::BTreeMap;

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::quic::connection::Side;
use crate::quic::error::{ProtocolError, Result, StreamError};
use crate::quic::range_set::RangeSet;

/// Flow control limit both ends assume for a fresh stream, before any
/// MAX_STREAM_DATA has been seen.
pub const INITIAL_MAX_STREAM_DATA: u64 = 64 * 1024;

/// Stream identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct StreamId(u64);

impl StreamId {
    /// Create a new stream ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw value
    pub fn value(&self) -> u64 {
        self.0
    }

    /// First identifier available to streams opened by `initiator`
    pub fn first(initiator: Side) -> Self {
        match initiator {
            Side::Client => Self(0),
            Side::Server => Self(1),
        }
    }

    /// Next identifier in the same initiator's space
    pub fn next(self) -> Self {
        Self(self.0 + 4)
    }

    pub fn initiator(&self) -> Side {
        if self.is_client_initiated() {
            Side::Client
        } else {
            Side::Server
        }
    }

    /// Check if this is a client-initiated stream
    pub fn is_client_initiated(&self) -> bool {
        (self.0 & 0x1) == 0
    }

    /// Check if this is a server-initiated stream
    pub fn is_server_initiated(&self) -> bool {
        (self.0 & 0x1) == 1
    }

    /// Only bidirectional streams exist; the 0x2 bit must be clear
    pub fn is_valid(&self) -> bool {
        (self.0 & 0x2) == 0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Edge-triggered notification state for one direction of a stream.
///
/// A stream direction starts out triggered and armed: the application may
/// attempt I/O at once, and the first transition into actionable is reported
/// even if no attempt has come back empty yet. After that a callback fires
/// again only once a 0-result call has re-armed it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    armed: bool,
}

impl Readiness {
    /// Streams start here: the first transition into actionable is reported.
    pub fn armed() -> Self {
        Self { armed: true }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub(crate) fn arm(&mut self) {
        self.armed = true;
    }

    /// Consume the armed state. True at most once per arming.
    pub(crate) fn fire(&mut self) -> bool {
        std::mem::take(&mut self.armed)
    }
}

/// A contiguous range of the send buffer put on the wire in one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub len: usize,
    pub fin: bool,
}

impl Chunk {
    pub fn end(&self) -> u64 {
        self.offset + self.len as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinState {
    Open,
    Pending,
    Sent,
    Acked,
}

/// Send half: bytes stay buffered until acknowledged so lost ranges can be
/// replayed from here.
#[derive(Debug)]
struct SendBuffer {
    /// Unacknowledged bytes, starting at `base`
    data: BytesMut,
    base: u64,
    capacity: usize,
    /// Lowest offset never transmitted
    next_send: u64,
    retransmit: RangeSet,
    /// Acknowledged ranges above `base`
    acked: RangeSet,
    /// Limit advertised by the peer
    max_data: u64,
    fin: FinState,
    stopped: bool,
}

impl SendBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity.min(16 * 1024)),
            base: 0,
            capacity,
            next_send: 0,
            retransmit: RangeSet::new(),
            acked: RangeSet::new(),
            max_data: INITIAL_MAX_STREAM_DATA,
            fin: FinState::Open,
            stopped: false,
        }
    }

    fn write_offset(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    fn free(&self) -> usize {
        self.capacity.saturating_sub(self.data.len())
    }

    fn push(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.free());
        self.data.extend_from_slice(&bytes[..n]);
        n
    }

    fn close(&mut self) {
        if self.fin == FinState::Open {
            self.fin = FinState::Pending;
        }
    }

    fn sendable_end(&self) -> u64 {
        self.write_offset().min(self.max_data)
    }

    fn has_pending(&self) -> bool {
        !self.stopped
            && (!self.retransmit.is_empty()
                || self.sendable_end() > self.next_send
                || (self.fin == FinState::Pending && self.next_send == self.write_offset()))
    }

    fn take_fin(&mut self, end: u64) -> bool {
        if self.fin == FinState::Pending && end == self.write_offset() {
            self.fin = FinState::Sent;
            true
        } else {
            false
        }
    }

    fn next_chunk(&mut self, max_len: usize) -> Option<Chunk> {
        if self.stopped || max_len == 0 {
            return None;
        }

        while let Some(range) = self.retransmit.first() {
            let start = range.start.max(self.base);
            if start >= range.end {
                self.retransmit.remove(range);
                continue;
            }
            let end = range.end.min(start + max_len as u64);
            self.retransmit.remove(range.start..end);
            let fin = self.take_fin(end);
            return Some(Chunk {
                offset: start,
                len: (end - start) as usize,
                fin,
            });
        }

        let end = self.sendable_end().min(self.next_send + max_len as u64);
        if end > self.next_send {
            let start = self.next_send;
            self.next_send = end;
            let fin = self.take_fin(end);
            return Some(Chunk {
                offset: start,
                len: (end - start) as usize,
                fin,
            });
        }

        if self.next_send == self.write_offset() && self.take_fin(self.next_send) {
            return Some(Chunk {
                offset: self.next_send,
                len: 0,
                fin: true,
            });
        }
        None
    }

    fn bytes(&self, chunk: &Chunk) -> &[u8] {
        let start = (chunk.offset - self.base) as usize;
        &self.data[start..start + chunk.len]
    }

    /// Returns the number of buffered bytes released.
    fn on_ack(&mut self, chunk: &Chunk) -> usize {
        if self.stopped {
            return 0;
        }
        if chunk.fin && self.fin != FinState::Open {
            self.fin = FinState::Acked;
        }
        if chunk.end() > self.base {
            self.acked.insert(chunk.offset.max(self.base)..chunk.end());
            self.retransmit.remove(chunk.offset..chunk.end());
        }

        let mut released = 0;
        while let Some(first) = self.acked.first() {
            if first.start > self.base {
                break;
            }
            self.acked.pop_first();
            let n = (first.end - self.base) as usize;
            self.data.advance(n);
            self.base = first.end;
            released += n;
        }
        released
    }

    fn on_loss(&mut self, chunk: &Chunk) {
        if self.stopped {
            return;
        }
        for gap in self.acked.gaps_in(chunk.offset.max(self.base)..chunk.end()) {
            self.retransmit.insert(gap);
        }
        if chunk.fin && self.fin == FinState::Sent {
            self.fin = FinState::Pending;
        }
    }

    fn stop(&mut self) {
        self.stopped = true;
        self.base += self.data.len() as u64;
        self.data = BytesMut::new();
        self.next_send = self.base;
        self.retransmit = RangeSet::new();
        self.acked = RangeSet::new();
    }

    fn is_complete(&self) -> bool {
        self.stopped || (self.fin == FinState::Acked && self.data.is_empty())
    }
}

/// Receive half: in-order bytes ready for the application plus out-of-order
/// segments waiting for the gap before them to fill.
#[derive(Debug)]
struct RecvBuffer {
    ready: BytesMut,
    read_offset: u64,
    pending: BTreeMap<u64, Bytes>,
    final_size: Option<u64>,
    max_data: u64,
    window: u64,
    max_data_dirty: bool,
    stopped: bool,
}

impl RecvBuffer {
    fn new(window: u64) -> Self {
        let window = window.max(INITIAL_MAX_STREAM_DATA);
        Self {
            ready: BytesMut::new(),
            read_offset: 0,
            pending: BTreeMap::new(),
            final_size: None,
            max_data: window,
            window,
            // advertise anything beyond the protocol default straight away
            max_data_dirty: window > INITIAL_MAX_STREAM_DATA,
            stopped: false,
        }
    }

    fn contiguous_end(&self) -> u64 {
        self.read_offset + self.ready.len() as u64
    }

    fn eof_visible(&self) -> bool {
        self.final_size == Some(self.contiguous_end())
    }

    fn is_finished(&self) -> bool {
        self.final_size == Some(self.read_offset)
    }

    /// Returns true when new in-order bytes or the end of the stream became
    /// visible to the reader.
    fn insert(&mut self, offset: u64, data: Bytes, fin: bool) -> Result<bool> {
        let end = offset + data.len() as u64;

        if let Some(final_size) = self.final_size {
            if end > final_size || (fin && end != final_size) {
                return Err(ProtocolError::FinalSize(format!(
                    "data up to {} conflicts with final size {}",
                    end, final_size
                ))
                .into());
            }
        }
        if self.stopped {
            if fin {
                self.final_size = Some(end);
            }
            return Ok(false);
        }
        if end > self.max_data {
            return Err(ProtocolError::FlowControlViolation(format!(
                "data up to {} exceeds limit {}",
                end, self.max_data
            ))
            .into());
        }

        let mut became_final = false;
        if fin && self.final_size.is_none() {
            let highest = self
                .pending
                .iter()
                .map(|(o, d)| o + d.len() as u64)
                .max()
                .unwrap_or(0)
                .max(self.contiguous_end());
            if end < highest {
                return Err(ProtocolError::FinalSize(format!(
                    "final size {} below received data {}",
                    end, highest
                ))
                .into());
            }
            self.final_size = Some(end);
            became_final = true;
        }

        let before = self.contiguous_end();
        self.store(offset, data);
        let advanced = self.contiguous_end() > before;
        Ok(advanced || (became_final && self.eof_visible()))
    }

    fn store(&mut self, offset: u64, data: Bytes) {
        let end = offset + data.len() as u64;
        let contiguous = self.contiguous_end();
        if end <= contiguous {
            return;
        }
        if offset <= contiguous {
            let skip = (contiguous - offset) as usize;
            self.ready.extend_from_slice(&data[skip..]);
            self.drain_pending();
        } else {
            match self.pending.get(&offset) {
                Some(existing) if existing.len() >= data.len() => {}
                _ => {
                    self.pending.insert(offset, data);
                }
            }
        }
    }

    fn drain_pending(&mut self) {
        loop {
            let contiguous = self.contiguous_end();
            let Some(entry) = self.pending.first_entry() else {
                break;
            };
            let offset = *entry.key();
            if offset > contiguous {
                break;
            }
            let segment = entry.remove();
            let end = offset + segment.len() as u64;
            if end > contiguous {
                let skip = (contiguous - offset) as usize;
                self.ready.extend_from_slice(&segment[skip..]);
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.ready.len());
        buf[..n].copy_from_slice(&self.ready[..n]);
        self.ready.advance(n);
        self.read_offset += n as u64;

        if n > 0 && self.final_size.is_none() && self.max_data - self.read_offset < self.window / 2 {
            self.max_data = self.read_offset + self.window;
            self.max_data_dirty = true;
        }
        n
    }

    fn stop(&mut self) {
        self.stopped = true;
        self.read_offset += self.ready.len() as u64;
        self.ready = BytesMut::new();
        self.pending.clear();
        self.max_data_dirty = false;
    }

    /// No more data will arrive: whatever is contiguous is all there is.
    fn abandon(&mut self) {
        self.pending.clear();
        self.final_size = Some(self.contiguous_end());
        self.max_data_dirty = false;
    }
}

/// Per-stream limits taken from the engine configuration
#[derive(Debug, Clone, Copy)]
pub struct StreamLimits {
    /// Bytes a stream buffers before `write` starts returning 0
    pub send_buffer_size: usize,
    /// Receive window advertised to the peer
    pub receive_window: u64,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            send_buffer_size: 256 * 1024,
            receive_window: 256 * 1024,
        }
    }
}

/// One bidirectional stream
#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    send: SendBuffer,
    recv: RecvBuffer,
    write_closed: bool,
    read_closed: bool,
    readable: Readiness,
    writable: Readiness,
    stop_sending_pending: bool,
    /// Peer-initiated streams stay silent until the application accepts them
    pub(crate) accepted: bool,
}

impl Stream {
    pub fn new(id: StreamId, limits: StreamLimits) -> Self {
        Self {
            id,
            send: SendBuffer::new(limits.send_buffer_size),
            recv: RecvBuffer::new(limits.receive_window),
            write_closed: false,
            read_closed: false,
            readable: Readiness::armed(),
            writable: Readiness::armed(),
            stop_sending_pending: false,
            accepted: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Buffer up to `data.len()` bytes for sending.
    ///
    /// `Ok(0)` means no capacity right now and arms the write callback.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.write_closed {
            return Err(StreamError::WriteAfterClose(self.id.value()).into());
        }
        let n = if self.send.stopped { 0 } else { self.send.push(data) };
        if n == 0 {
            self.writable.arm();
        }
        trace!("Stream {} accepted {} of {} bytes", self.id, n, data.len());
        Ok(n)
    }

    /// Stop accepting writes. Buffered bytes are still delivered.
    pub fn write_close(&mut self) {
        if !self.write_closed {
            self.write_closed = true;
            self.send.close();
            debug!("Stream {} write side closed", self.id);
        }
    }

    pub fn write_is_closed(&self) -> bool {
        self.write_closed || self.send.stopped
    }

    /// Copy in-order bytes into `buf`. 0 means nothing is ready and arms the
    /// read callback.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = if self.read_closed { 0 } else { self.recv.read(buf) };
        if n == 0 {
            self.readable.arm();
        }
        n
    }

    /// Declare disinterest in further data. Anything still arriving is
    /// dropped and the peer is asked to stop sending.
    pub fn read_close(&mut self) {
        if self.read_closed {
            return;
        }
        self.read_closed = true;
        if self.recv.final_size.is_none() {
            self.stop_sending_pending = true;
        }
        self.recv.stop();
        debug!("Stream {} read side closed", self.id);
    }

    pub fn read_is_closed(&self) -> bool {
        self.read_closed || self.recv.is_finished()
    }

    /// Bytes readable right now
    pub fn readable_len(&self) -> usize {
        self.recv.ready.len()
    }

    /// Bytes written but not yet acknowledged
    pub fn unacked_len(&self) -> usize {
        self.send.data.len()
    }

    /// Remaining write capacity
    pub fn write_capacity(&self) -> usize {
        if self.write_is_closed() { 0 } else { self.send.free() }
    }

    pub fn readable_readiness(&self) -> Readiness {
        self.readable
    }

    pub fn writable_readiness(&self) -> Readiness {
        self.writable
    }

    /// Both halves are finished and nothing remains to be settled with the peer.
    pub fn is_retired(&self) -> bool {
        let write_done = self.send.stopped || (self.write_closed && self.send.is_complete());
        let read_done = (self.read_closed && !self.stop_sending_pending) || self.recv.is_finished();
        write_done && read_done
    }

    pub(crate) fn has_readable(&self) -> bool {
        !self.read_closed && (!self.recv.ready.is_empty() || self.recv.eof_visible())
    }

    /// Deliver a STREAM frame. Returns true when the read callback should fire.
    pub(crate) fn on_stream_frame(&mut self, offset: u64, data: Bytes, fin: bool) -> Result<bool> {
        let visible = self.recv.insert(offset, data, fin)?;
        Ok(visible && !self.read_closed && self.readable.fire())
    }

    /// Returns true when the write callback should fire.
    pub(crate) fn on_chunk_acked(&mut self, chunk: &Chunk) -> bool {
        let released = self.send.on_ack(chunk);
        released > 0 && !self.write_closed && self.writable.fire()
    }

    pub(crate) fn on_chunk_lost(&mut self, chunk: &Chunk) {
        self.send.on_loss(chunk);
    }

    /// The peer no longer wants our data. Returns true when the write
    /// callback should fire.
    pub(crate) fn on_stop_sending(&mut self) -> bool {
        if self.send.stopped {
            return false;
        }
        debug!("Stream {} stopped by peer", self.id);
        self.send.stop();
        !self.write_closed && self.writable.fire()
    }

    pub(crate) fn on_max_stream_data(&mut self, max: u64) {
        if max > self.send.max_data {
            trace!("Stream {} send limit raised to {}", self.id, max);
            self.send.max_data = max;
        }
    }

    /// The connection is gone. Returns which callbacks should fire as
    /// `(readable, writable)`.
    pub(crate) fn on_connection_closed(&mut self) -> (bool, bool) {
        self.send.stop();
        if self.recv.final_size.is_none() || !self.recv.eof_visible() {
            self.recv.abandon();
        }
        self.stop_sending_pending = false;
        let readable = !self.read_closed && self.readable.fire();
        let writable = !self.write_closed && self.writable.fire();
        (readable, writable)
    }

    pub(crate) fn has_pending_data(&self) -> bool {
        self.send.has_pending()
    }

    pub(crate) fn is_flow_blocked(&self) -> bool {
        !self.send.stopped
            && self.send.retransmit.is_empty()
            && self.send.next_send >= self.send.max_data
            && self.send.write_offset() > self.send.max_data
    }

    pub(crate) fn next_chunk(&mut self, max_len: usize) -> Option<Chunk> {
        self.send.next_chunk(max_len)
    }

    pub(crate) fn chunk_bytes(&self, chunk: &Chunk) -> Bytes {
        Bytes::copy_from_slice(self.send.bytes(chunk))
    }

    pub(crate) fn take_max_stream_data(&mut self) -> Option<u64> {
        if self.recv.max_data_dirty && !self.read_closed && self.recv.final_size.is_none() {
            self.recv.max_data_dirty = false;
            Some(self.recv.max_data)
        } else {
            None
        }
    }

    pub(crate) fn requeue_max_stream_data(&mut self) {
        if !self.read_closed && self.recv.final_size.is_none() {
            self.recv.max_data_dirty = true;
        }
    }

    pub(crate) fn take_stop_sending(&mut self) -> bool {
        std::mem::take(&mut self.stop_sending_pending)
    }

    pub(crate) fn requeue_stop_sending(&mut self) {
        if self.read_closed && self.recv.final_size.is_none() {
            self.stop_sending_pending = true;
        }
    }

    pub(crate) fn wants_control_frames(&self) -> bool {
        self.stop_sending_pending
            || (self.recv.max_data_dirty && !self.read_closed && self.recv.final_size.is_none())
    }
}
