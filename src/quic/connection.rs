//! Connection state machine
//!
//! A [`Connection`] is the protocol half of a peer: it owns the streams,
//! numbers and seals outbound packets, tracks what the remote end has
//! acknowledged, and turns inbound frames into stream deliveries. It never
//! touches a socket or a clock; the engine passes datagrams and the cached
//! time in and pulls datagrams and [`ConnectionEvent`]s out.

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::ack_manager::AckManager;
use super::congestion::CongestionController;
use super::error::{ConnectionError, ProtocolError, Result, StreamError};
use super::events::ConnectionEvent;
use super::frame::{Frame, MAX_VARINT, stream_header_len};
use super::loss_recovery::{LossRecovery, SentFrame, SentPacket};
use super::packet::{Packet, PacketHeader, PacketNumber, PacketType};
use super::stream::{Readiness, Stream, StreamId, StreamLimits};
use crate::config::EngineConfig;
use crate::crypto::PacketProtection;

/// Length of every connection id on the wire
pub const CONNECTION_ID_LEN: usize = 8;

/// Connection identifier, chosen by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId([u8; CONNECTION_ID_LEN]);

impl ConnectionId {
    /// Generate a random connection id
    pub fn new() -> Self {
        let uuid = Uuid::new_v4();
        let mut bytes = [0u8; CONNECTION_ID_LEN];
        bytes.copy_from_slice(&uuid.as_bytes()[..CONNECTION_ID_LEN]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; CONNECTION_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; CONNECTION_ID_LEN]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; CONNECTION_ID_LEN] {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Which end of the connection this is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    /// The other end
    pub fn peer(self) -> Self {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }

    pub fn is_client(self) -> bool {
        self == Side::Client
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Client that has not heard from the server yet
    Handshaking,
    Connected,
    /// Closed locally, CONNECTION_CLOSE not sent yet
    Closing,
    /// Terminal; the connection only lingers to drain
    Closed,
}

/// Connection statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub duplicate_packets: u64,
    pub streams_opened: u64,
    pub streams_closed: u64,
    pub smoothed_rtt_us: u64,
    pub congestion_window: u64,
}

/// One end of a connection
#[derive(Debug)]
pub struct Connection {
    side: Side,
    connection_id: ConnectionId,
    remote_addr: SocketAddr,
    state: ConnectionState,
    protection: Box<dyn PacketProtection>,
    next_packet_number: PacketNumber,
    next_local_stream: StreamId,
    next_remote_stream: StreamId,
    streams: BTreeMap<StreamId, Stream>,
    /// Peer-initiated streams waiting for `accept`, oldest first
    pending_accept: VecDeque<StreamId>,
    accept_readiness: Readiness,
    /// Round-robin cursor over streams with data to send
    last_served: Option<StreamId>,
    ack_manager: AckManager,
    loss: LossRecovery,
    congestion: CongestionController,
    events: VecDeque<ConnectionEvent>,
    stats: ConnectionStats,
    limits: StreamLimits,
    max_streams: u64,
    max_payload: usize,
    idle_timeout: Duration,
    keep_alive: Option<Duration>,
    auto_reclaim: bool,
    last_activity: Instant,
    last_ack_eliciting_sent: Instant,
    close_frame: Option<Frame>,
    close_reason: Option<ConnectionError>,
    drain_deadline: Option<Instant>,
    had_streams: bool,
    ping_pending: bool,
}

impl Connection {
    pub fn new(
        side: Side,
        connection_id: ConnectionId,
        remote_addr: SocketAddr,
        protection: Box<dyn PacketProtection>,
        config: &EngineConfig,
        now: Instant,
    ) -> Self {
        let max_payload = config.connection.max_udp_payload_size as usize;
        let mut accept_readiness = Readiness::default();
        // a server learns about its first streams through the listener callback
        if side.is_client() {
            accept_readiness.arm();
        }

        Self {
            side,
            connection_id,
            remote_addr,
            state: match side {
                Side::Client => ConnectionState::Handshaking,
                Side::Server => ConnectionState::Connected,
            },
            protection,
            next_packet_number: PacketNumber::new(0),
            next_local_stream: StreamId::first(side),
            next_remote_stream: StreamId::first(side.peer()),
            streams: BTreeMap::new(),
            pending_accept: VecDeque::new(),
            accept_readiness,
            last_served: None,
            ack_manager: AckManager::new(config.connection.max_ack_ranges),
            loss: LossRecovery::new(&config.recovery),
            congestion: CongestionController::new(max_payload as u64, config.recovery.initial_congestion_window),
            events: VecDeque::new(),
            stats: ConnectionStats::default(),
            limits: config.stream_limits(),
            max_streams: config.connection.max_streams,
            max_payload,
            idle_timeout: config.idle_timeout(),
            keep_alive: config.keep_alive_interval(),
            auto_reclaim: config.connection.auto_reclaim,
            last_activity: now,
            last_ack_eliciting_sent: now,
            close_frame: None,
            close_reason: None,
            drain_deadline: None,
            had_streams: false,
            ping_pending: false,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ConnectionState::Closing | ConnectionState::Closed)
    }

    /// Why the connection closed, once it has
    pub fn close_reason(&self) -> Option<&ConnectionError> {
        self.close_reason.as_ref()
    }

    /// Open a locally initiated stream
    pub fn open_stream(&mut self) -> Result<StreamId> {
        if self.is_closed() {
            return Err(ConnectionError::Closed.into());
        }
        let id = self.next_local_stream;
        self.next_local_stream = id.next();

        let mut stream = Stream::new(id, self.limits);
        stream.accepted = true;
        self.streams.insert(id, stream);
        self.had_streams = true;
        self.stats.streams_opened += 1;
        debug!("Connection {} opened stream {}", self.connection_id, id);
        Ok(id)
    }

    /// Take the oldest peer-initiated stream waiting for acceptance.
    ///
    /// Coming up empty re-arms the acceptable notification.
    pub fn accept_stream(&mut self) -> Result<StreamId> {
        while let Some(id) = self.pending_accept.pop_front() {
            let Some(stream) = self.streams.get_mut(&id) else {
                continue;
            };
            stream.accepted = true;
            if stream.has_readable() {
                self.events.push_back(ConnectionEvent::StreamReadable(id));
            }
            debug!("Connection {} accepted stream {}", self.connection_id, id);
            return Ok(id);
        }
        self.accept_readiness.arm();
        Err(StreamError::NoPendingStream.into())
    }

    pub fn pending_accept_count(&self) -> usize {
        self.pending_accept.len()
    }

    pub fn stream(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn stream_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    pub fn has_pending_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Whether `poll_transmit` would produce a datagram right now
    pub fn wants_transmit(&self) -> bool {
        match self.state {
            ConnectionState::Closing => true,
            ConnectionState::Closed => false,
            _ => {
                self.ack_manager.wants_ack()
                    || (self.congestion.can_send(self.max_payload as u64) && self.has_ack_eliciting_work())
            }
        }
    }

    /// Process one inbound datagram whose header the caller already decoded
    pub fn handle_packet(&mut self, now: Instant, header: &PacketHeader, header_bytes: &[u8], body: &[u8]) -> Result<()> {
        if self.state == ConnectionState::Closed {
            trace!("Connection {} draining, dropping packet {}", self.connection_id, header.packet_number);
            return Ok(());
        }

        let packet = Packet::open(
            header.clone(),
            header_bytes,
            body,
            self.side.peer(),
            self.protection.as_ref(),
        )?;
        let frames = Frame::decode_all(&packet.payload)?;
        if frames.is_empty() {
            return Err(ProtocolError::InvalidPacketFormat("packet without frames".to_string()).into());
        }

        let ack_eliciting = frames.iter().any(Frame::is_ack_eliciting);
        if !self.ack_manager.on_packet_received(header.packet_number, ack_eliciting, now) {
            self.stats.duplicate_packets += 1;
            return Ok(());
        }

        self.stats.packets_received += 1;
        self.stats.bytes_received += (header_bytes.len() + body.len()) as u64;
        self.last_activity = now;
        if self.state == ConnectionState::Handshaking {
            self.state = ConnectionState::Connected;
            info!("Connection {} established with {}", self.connection_id, self.remote_addr);
        }

        for frame in frames {
            if let Err(e) = self.handle_frame(now, frame) {
                warn!("Connection {}: dropping frame: {}", self.connection_id, e);
            }
            if self.state == ConnectionState::Closed {
                break;
            }
        }
        Ok(())
    }

    fn handle_frame(&mut self, now: Instant, frame: Frame) -> Result<()> {
        trace!("Connection {} received {:?}", self.connection_id, frame);
        match frame {
            Frame::Padding { .. } | Frame::Ping => {}
            Frame::Ack {
                ack_delay, ack_ranges, ..
            } => self.on_ack(now, &ack_ranges, Duration::from_micros(ack_delay)),
            Frame::Stream {
                stream_id,
                offset,
                data,
                fin,
            } => {
                if !self.ensure_stream(stream_id)? {
                    return Ok(());
                }
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    if stream.on_stream_frame(offset, data, fin)? && stream.accepted {
                        self.events.push_back(ConnectionEvent::StreamReadable(stream_id));
                    }
                }
            }
            Frame::StopSending { stream_id, .. } => {
                if !self.ensure_stream(stream_id)? {
                    return Ok(());
                }
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    if stream.on_stop_sending() && stream.accepted {
                        self.events.push_back(ConnectionEvent::StreamWritable(stream_id));
                    }
                }
            }
            Frame::MaxStreamData {
                stream_id,
                maximum_stream_data,
            } => {
                if !self.ensure_stream(stream_id)? {
                    return Ok(());
                }
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.on_max_stream_data(maximum_stream_data);
                }
            }
            Frame::ConnectionClose {
                error_code,
                reason_phrase,
                ..
            } => {
                info!(
                    "Connection {} closed by peer (code {}): {}",
                    self.connection_id, error_code, reason_phrase
                );
                self.enter_closed(
                    now,
                    ConnectionError::ClosedByPeer {
                        code: error_code,
                        reason: reason_phrase,
                    },
                );
            }
        }
        Ok(())
    }

    /// Make sure `id` has a stream, opening peer-initiated streams on first
    /// sight. Returns false for streams that were already retired.
    fn ensure_stream(&mut self, id: StreamId) -> Result<bool> {
        if !id.is_valid() {
            return Err(ProtocolError::InvalidStreamId(format!("{} is not bidirectional", id)).into());
        }
        if self.streams.contains_key(&id) {
            return Ok(true);
        }

        if id.initiator() == self.side {
            if id < self.next_local_stream {
                return Ok(false);
            }
            return Err(ProtocolError::InvalidStreamId(format!("{} was never opened locally", id)).into());
        }
        if id < self.next_remote_stream {
            return Ok(false);
        }

        let new_streams = (id.value() - self.next_remote_stream.value()) / 4 + 1;
        let open_remote = self.streams.keys().filter(|s| s.initiator() != self.side).count() as u64;
        if open_remote + new_streams > self.max_streams {
            return Err(ProtocolError::StreamLimit(format!(
                "{} would exceed {} concurrent streams",
                id, self.max_streams
            ))
            .into());
        }

        while self.next_remote_stream <= id {
            let new_id = self.next_remote_stream;
            self.streams.insert(new_id, Stream::new(new_id, self.limits));
            self.pending_accept.push_back(new_id);
            self.next_remote_stream = new_id.next();
            self.stats.streams_opened += 1;
            debug!("Connection {} observed remote stream {}", self.connection_id, new_id);
        }
        self.had_streams = true;

        if self.accept_readiness.fire() {
            self.events.push_back(ConnectionEvent::IncomingStream);
        }
        Ok(true)
    }

    fn on_ack(&mut self, now: Instant, ack_ranges: &[(u64, u64)], ack_delay: Duration) {
        let outcome = self.loss.on_ack_received(now, ack_ranges, ack_delay);

        for packet in &outcome.newly_acked {
            self.congestion.on_packet_acked(packet.size as u64, packet.time_sent);
            for frame in &packet.frames {
                if let SentFrame::Stream { stream_id, chunk } = frame {
                    if let Some(stream) = self.streams.get_mut(stream_id) {
                        if stream.on_chunk_acked(chunk) && stream.accepted {
                            self.events.push_back(ConnectionEvent::StreamWritable(*stream_id));
                        }
                    }
                }
            }
        }

        if !outcome.lost.is_empty() {
            self.on_packets_lost(now, outcome.lost);
        }
    }

    fn on_packets_lost(&mut self, now: Instant, lost: Vec<SentPacket>) {
        let bytes: u64 = lost.iter().map(|p| p.size as u64).sum();
        let largest_time_sent = lost.iter().map(|p| p.time_sent).max().unwrap_or(now);
        self.congestion.on_packets_lost(bytes, largest_time_sent, now);
        self.stats.packets_lost += lost.len() as u64;

        for packet in lost {
            for frame in packet.frames {
                match frame {
                    SentFrame::Stream { stream_id, chunk } => {
                        if let Some(stream) = self.streams.get_mut(&stream_id) {
                            stream.on_chunk_lost(&chunk);
                        }
                    }
                    SentFrame::MaxStreamData { stream_id } => {
                        if let Some(stream) = self.streams.get_mut(&stream_id) {
                            stream.requeue_max_stream_data();
                        }
                    }
                    SentFrame::StopSending { stream_id } => {
                        if let Some(stream) = self.streams.get_mut(&stream_id) {
                            stream.requeue_stop_sending();
                        }
                    }
                    SentFrame::Ping => {}
                }
            }
        }
    }

    fn packet_type(&self) -> PacketType {
        if self.state == ConnectionState::Handshaking {
            PacketType::Initial
        } else {
            PacketType::OneRtt
        }
    }

    fn has_ack_eliciting_work(&self) -> bool {
        self.ping_pending
            || self
                .streams
                .values()
                .any(|s| s.has_pending_data() || s.wants_control_frames())
    }

    /// Build the next outbound datagram, if there is anything to send
    pub fn poll_transmit(&mut self, now: Instant) -> Result<Option<Vec<u8>>> {
        match self.state {
            ConnectionState::Closed => return Ok(None),
            ConnectionState::Closing => {
                let Some(frame) = self.close_frame.take() else {
                    self.enter_closed(now, ConnectionError::Closed);
                    return Ok(None);
                };
                let mut payload = BytesMut::new();
                frame.encode_to(&mut payload);
                let datagram = self.seal(now, payload, Vec::new())?;
                self.enter_closed(now, ConnectionError::Closed);
                return Ok(Some(datagram));
            }
            _ => {}
        }

        let header_len = PacketHeader::new(self.packet_type(), self.connection_id, self.next_packet_number).encoded_len();
        let budget = self
            .max_payload
            .saturating_sub(header_len + self.protection.overhead());
        let may_send = self.congestion.can_send(self.max_payload as u64) && self.has_ack_eliciting_work();

        let mut payload = BytesMut::with_capacity(budget);
        let mut sent_frames = Vec::new();

        let mut ack_written = false;
        if self.ack_manager.wants_ack() {
            ack_written = self.write_ack(now, budget, &mut payload);
        }

        if may_send {
            if self.ping_pending {
                Frame::Ping.encode_to(&mut payload);
                sent_frames.push(SentFrame::Ping);
                self.ping_pending = false;
            }
            self.write_control_frames(budget, &mut payload, &mut sent_frames);
            self.write_stream_frames(budget, &mut payload, &mut sent_frames);
        }

        // piggyback an ACK on data when it still fits
        if !ack_written && !sent_frames.is_empty() {
            self.write_ack(now, budget, &mut payload);
        }

        if payload.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.seal(now, payload, sent_frames)?))
    }

    fn write_ack(&mut self, now: Instant, budget: usize, payload: &mut BytesMut) -> bool {
        let Some(ack) = self.ack_manager.ack_frame(now) else {
            return false;
        };
        if payload.len() + ack.encoded_len() > budget {
            return false;
        }
        ack.encode_to(payload);
        self.ack_manager.on_ack_sent();
        true
    }

    fn write_control_frames(&mut self, budget: usize, payload: &mut BytesMut, sent_frames: &mut Vec<SentFrame>) {
        for (id, stream) in self.streams.iter_mut() {
            if !stream.wants_control_frames() {
                continue;
            }
            if stream.take_stop_sending() {
                let frame = Frame::StopSending {
                    stream_id: *id,
                    application_error_code: 0,
                };
                if payload.len() + frame.encoded_len() > budget {
                    stream.requeue_stop_sending();
                    return;
                }
                frame.encode_to(payload);
                sent_frames.push(SentFrame::StopSending { stream_id: *id });
            }
            if let Some(maximum_stream_data) = stream.take_max_stream_data() {
                let frame = Frame::MaxStreamData {
                    stream_id: *id,
                    maximum_stream_data,
                };
                if payload.len() + frame.encoded_len() > budget {
                    stream.requeue_max_stream_data();
                    return;
                }
                frame.encode_to(payload);
                sent_frames.push(SentFrame::MaxStreamData { stream_id: *id });
            }
        }
    }

    /// One chunk per stream per packet, starting after the stream served last
    fn write_stream_frames(&mut self, budget: usize, payload: &mut BytesMut, sent_frames: &mut Vec<SentFrame>) {
        let mut ready: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, s)| s.has_pending_data())
            .map(|(id, _)| *id)
            .collect();
        if let Some(last) = self.last_served {
            let split = ready.partition_point(|id| *id <= last);
            ready.rotate_left(split);
        }

        for id in ready {
            let remaining = budget.saturating_sub(payload.len());
            let overhead = stream_header_len(id, MAX_VARINT, remaining);
            if remaining <= overhead {
                break;
            }
            let Some(stream) = self.streams.get_mut(&id) else {
                continue;
            };
            let Some(chunk) = stream.next_chunk(remaining - overhead) else {
                continue;
            };
            Frame::Stream {
                stream_id: id,
                offset: chunk.offset,
                data: stream.chunk_bytes(&chunk),
                fin: chunk.fin,
            }
            .encode_to(payload);
            trace!("Stream {} sending {} bytes at {} (fin: {})", id, chunk.len, chunk.offset, chunk.fin);
            sent_frames.push(SentFrame::Stream { stream_id: id, chunk });
            self.last_served = Some(id);
        }
    }

    fn seal(&mut self, now: Instant, payload: BytesMut, sent_frames: Vec<SentFrame>) -> Result<Vec<u8>> {
        let packet_number = self.next_packet_number;
        let header = PacketHeader::new(self.packet_type(), self.connection_id, packet_number);
        let datagram = Packet::new(header, payload.freeze()).seal(self.side, self.protection.as_ref())?;
        self.next_packet_number = packet_number.next();

        self.stats.packets_sent += 1;
        self.stats.bytes_sent += datagram.len() as u64;

        if !sent_frames.is_empty() {
            if !self.loss.has_in_flight() {
                self.last_activity = self.last_activity.max(now);
            }
            self.last_ack_eliciting_sent = now;
            self.congestion.on_packet_sent(datagram.len() as u64);
            self.loss.on_packet_sent(SentPacket {
                packet_number,
                time_sent: now,
                size: datagram.len(),
                frames: sent_frames,
            });
        }
        Ok(datagram)
    }

    /// Earliest instant `on_timeout` has work to do
    pub fn next_timeout(&self) -> Option<Instant> {
        match self.state {
            ConnectionState::Closed => return self.drain_deadline,
            ConnectionState::Closing => return None,
            _ => {}
        }
        let mut deadline = self.last_activity + self.idle_timeout;
        if let Some(loss) = self.loss.loss_timer() {
            deadline = deadline.min(loss);
        }
        if let Some(keep_alive) = self.keep_alive_deadline() {
            deadline = deadline.min(keep_alive);
        }
        Some(deadline)
    }

    fn keep_alive_deadline(&self) -> Option<Instant> {
        let interval = self.keep_alive?;
        (!self.streams.is_empty() && !self.loss.has_in_flight() && !self.ping_pending)
            .then(|| self.last_ack_eliciting_sent + interval)
    }

    /// Run timers that have expired at `now`
    pub fn on_timeout(&mut self, now: Instant) {
        if self.is_closed() {
            return;
        }
        if now >= self.last_activity + self.idle_timeout {
            info!("Connection {} idle for {:?}, closing", self.connection_id, self.idle_timeout);
            self.enter_closed(now, ConnectionError::IdleTimeout);
            return;
        }

        let lost = self.loss.on_timeout(now);
        if !lost.is_empty() {
            debug!("Connection {} retransmission timeout, {} packets", self.connection_id, lost.len());
            self.on_packets_lost(now, lost);
            self.congestion.on_retransmission_timeout();
        }

        if self.keep_alive_deadline().is_some_and(|deadline| now >= deadline) {
            trace!("Connection {} sending keep-alive", self.connection_id);
            self.ping_pending = true;
        }
    }

    /// Close the connection locally. The CONNECTION_CLOSE frame goes out on
    /// the next transmit. Idempotent.
    pub fn close(&mut self, error_code: u64, reason: &str) {
        if self.is_closed() {
            return;
        }
        info!("Closing connection {}: {}", self.connection_id, reason);
        self.state = ConnectionState::Closing;
        self.close_frame = Some(Frame::ConnectionClose {
            error_code,
            frame_type: None,
            reason_phrase: reason.to_string(),
        });
        self.abandon_streams();
    }

    fn enter_closed(&mut self, now: Instant, reason: ConnectionError) {
        if self.state == ConnectionState::Closed {
            return;
        }
        let was_closing = self.state == ConnectionState::Closing;
        self.state = ConnectionState::Closed;
        self.drain_deadline = Some(now + self.loss.rto() * 3);
        if !was_closing {
            self.abandon_streams();
        }
        self.close_reason = Some(reason);
        self.events.push_back(ConnectionEvent::Closed);
    }

    fn abandon_streams(&mut self) {
        for (id, stream) in self.streams.iter_mut() {
            let (readable, writable) = stream.on_connection_closed();
            if !stream.accepted {
                continue;
            }
            if writable {
                self.events.push_back(ConnectionEvent::StreamWritable(*id));
            }
            if readable {
                self.events.push_back(ConnectionEvent::StreamReadable(*id));
            }
        }
    }

    /// Remove retired streams, returning their ids
    pub fn reap_streams(&mut self) -> Vec<StreamId> {
        let retired: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, s)| s.is_retired())
            .map(|(id, _)| *id)
            .collect();
        for id in &retired {
            self.streams.remove(id);
            debug!("Connection {} retired stream {}", self.connection_id, id);
        }
        if !retired.is_empty() {
            self.pending_accept.retain(|id| !retired.contains(id));
            self.stats.streams_closed += retired.len() as u64;
        }
        retired
    }

    /// A live connection whose every stream has finished and been settled
    pub fn is_finished(&self) -> bool {
        self.auto_reclaim
            && self.had_streams
            && !self.is_closed()
            && self.streams.is_empty()
            && self.pending_accept.is_empty()
            && !self.loss.has_in_flight()
            && !self.ack_manager.wants_ack()
    }

    /// Whether a closed connection has drained and can be dropped
    pub fn is_drained(&self, now: Instant) -> bool {
        if self.state != ConnectionState::Closed {
            return false;
        }
        let closed_remotely = matches!(self.close_reason, Some(ConnectionError::ClosedByPeer { .. }));
        self.drain_deadline.is_some_and(|deadline| now >= deadline) || (closed_remotely && self.streams.is_empty())
    }

    pub fn stats(&self) -> ConnectionStats {
        let mut stats = self.stats.clone();
        stats.smoothed_rtt_us = self.loss.rtt().smoothed().as_micros() as u64;
        stats.congestion_window = self.congestion.congestion_window();
        stats
    }

    /// Ranges still unacknowledged or packets still in flight
    pub fn has_in_flight(&self) -> bool {
        self.loss.has_in_flight()
    }
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod connection_tests;
