use super::*;
use crate::config::ConfigBuilder;
use crate::crypto::{ChaChaProtection, Plaintext};
use crate::quic::error::QuicError;
use crate::quic::packet::PacketHeader;

const CLIENT_ADDR: &str = "127.0.0.1:40000";
const SERVER_ADDR: &str = "127.0.0.1:9999";

/// Two connections wired back to back, with a manually advanced clock
struct Pair {
    client: Connection,
    server: Connection,
    now: Instant,
}

impl Pair {
    fn new() -> Self {
        Self::with_config(&EngineConfig::default())
    }

    fn with_config(config: &EngineConfig) -> Self {
        let cid = ConnectionId::from_bytes([7; CONNECTION_ID_LEN]);
        let now = Instant::now();
        Self {
            client: Connection::new(
                Side::Client,
                cid,
                SERVER_ADDR.parse().unwrap(),
                Box::new(Plaintext),
                config,
                now,
            ),
            server: Connection::new(
                Side::Server,
                cid,
                CLIENT_ADDR.parse().unwrap(),
                Box::new(Plaintext),
                config,
                now,
            ),
            now,
        }
    }

    fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    fn client_to_server(&mut self) -> usize {
        let datagrams = drain(&mut self.client, self.now);
        for datagram in &datagrams {
            deliver(&mut self.server, self.now, datagram).unwrap();
        }
        datagrams.len()
    }

    fn server_to_client(&mut self) -> usize {
        let datagrams = drain(&mut self.server, self.now);
        for datagram in &datagrams {
            deliver(&mut self.client, self.now, datagram).unwrap();
        }
        datagrams.len()
    }

    /// Shuttle datagrams both ways until neither side has anything to send
    fn exchange(&mut self) {
        for _ in 0..1000 {
            let sent = self.client_to_server() + self.server_to_client();
            if sent == 0 {
                return;
            }
        }
        panic!("connections never went quiet");
    }
}

fn drain(conn: &mut Connection, now: Instant) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(datagram) = conn.poll_transmit(now).unwrap() {
        out.push(datagram);
    }
    out
}

fn deliver(conn: &mut Connection, now: Instant, datagram: &[u8]) -> Result<()> {
    let (header, len) = PacketHeader::decode(datagram)?;
    conn.handle_packet(now, &header, &datagram[..len], &datagram[len..])
}

fn events(conn: &mut Connection) -> Vec<ConnectionEvent> {
    std::iter::from_fn(|| conn.poll_event()).collect()
}

fn read_all(conn: &mut Connection, id: StreamId) -> Vec<u8> {
    let stream = conn.stream_mut(id).unwrap();
    let mut out = Vec::new();
    let mut buf = [0u8; 512];
    loop {
        let n = stream.read(&mut buf);
        if n == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..n]);
    }
}

fn write(conn: &mut Connection, id: StreamId, data: &[u8]) -> usize {
    conn.stream_mut(id).unwrap().write(data).unwrap()
}

#[test]
fn test_connection_id_display_and_parse() {
    let cid = ConnectionId::from_bytes([0xab; CONNECTION_ID_LEN]);
    assert_eq!(cid.to_string(), "abababababababab");
    assert_eq!(ConnectionId::from_slice(cid.as_bytes()), Some(cid));
    assert_eq!(ConnectionId::from_slice(&[1, 2, 3]), None);
    assert_ne!(ConnectionId::new(), ConnectionId::new());
}

#[test]
fn test_client_stream_reaches_server() {
    let mut pair = Pair::new();
    assert_eq!(pair.client.state(), ConnectionState::Handshaking);

    let id = pair.client.open_stream().unwrap();
    assert_eq!(id, StreamId::new(0));
    assert_eq!(write(&mut pair.client, id, b"ping"), 4);

    pair.client_to_server();
    // first streams are announced by the listener, not by the connection
    assert!(!events(&mut pair.server).contains(&ConnectionEvent::IncomingStream));

    let accepted = pair.server.accept_stream().unwrap();
    assert_eq!(accepted, id);
    assert_eq!(events(&mut pair.server), vec![ConnectionEvent::StreamReadable(id)]);
    assert_eq!(read_all(&mut pair.server, id), b"ping");

    pair.server_to_client();
    assert_eq!(pair.client.state(), ConnectionState::Connected);
    assert!(!pair.client.has_in_flight());
}

#[test]
fn test_initial_packets_until_server_replies() {
    let mut pair = Pair::new();
    let id = pair.client.open_stream().unwrap();
    write(&mut pair.client, id, b"x");
    let datagrams = drain(&mut pair.client, pair.now);
    let (header, _) = PacketHeader::decode(&datagrams[0]).unwrap();
    assert_eq!(header.packet_type, PacketType::Initial);

    for datagram in &datagrams {
        deliver(&mut pair.server, pair.now, datagram).unwrap();
    }
    let replies = drain(&mut pair.server, pair.now);
    let (header, _) = PacketHeader::decode(&replies[0]).unwrap();
    assert_eq!(header.packet_type, PacketType::OneRtt);
}

#[test]
fn test_accept_queue_is_fifo_and_rearms() {
    let mut pair = Pair::new();
    let ids: Vec<StreamId> = (0..3).map(|_| pair.client.open_stream().unwrap()).collect();
    for id in &ids {
        write(&mut pair.client, *id, b"data");
    }
    pair.client_to_server();

    for id in &ids {
        assert_eq!(pair.server.accept_stream().unwrap(), *id);
    }
    assert!(matches!(
        pair.server.accept_stream(),
        Err(QuicError::Stream(StreamError::NoPendingStream))
    ));
    events(&mut pair.server);

    // the empty accept armed the notification: the next stream fires it once
    let late = pair.client.open_stream().unwrap();
    write(&mut pair.client, late, b"late");
    let later = pair.client.open_stream().unwrap();
    write(&mut pair.client, later, b"later");
    pair.client_to_server();

    let fired = events(&mut pair.server)
        .into_iter()
        .filter(|e| *e == ConnectionEvent::IncomingStream)
        .count();
    assert_eq!(fired, 1);
    assert_eq!(pair.server.pending_accept_count(), 2);
}

#[test]
fn test_client_is_told_about_server_streams() {
    let mut pair = Pair::new();
    let id = pair.client.open_stream().unwrap();
    write(&mut pair.client, id, b"hello");
    pair.exchange();

    let pushed = pair.server.open_stream().unwrap();
    assert_eq!(pushed, StreamId::new(1));
    write(&mut pair.server, pushed, b"push");
    pair.server_to_client();

    assert!(events(&mut pair.client).contains(&ConnectionEvent::IncomingStream));
    assert_eq!(pair.client.accept_stream().unwrap(), pushed);
    assert_eq!(read_all(&mut pair.client, pushed), b"push");
}

#[test]
fn test_lost_packet_is_replayed_after_timeout() {
    let mut pair = Pair::new();
    let id = pair.client.open_stream().unwrap();
    write(&mut pair.client, id, b"hello");

    // the network eats the first transmission
    assert_eq!(drain(&mut pair.client, pair.now).len(), 1);
    assert!(pair.client.has_in_flight());

    let deadline = pair.client.next_timeout().unwrap();
    pair.now = deadline;
    pair.client.on_timeout(pair.now);
    assert_eq!(pair.client.stats().packets_lost, 1);

    pair.exchange();
    pair.server.accept_stream().unwrap();
    assert_eq!(read_all(&mut pair.server, id), b"hello");
    assert!(!pair.client.has_in_flight());
}

#[test]
fn test_reordered_packets_deliver_in_order() {
    let mut config = EngineConfig::default();
    config.connection.max_udp_payload_size = 256;
    let mut pair = Pair::with_config(&config);

    let id = pair.client.open_stream().unwrap();
    let data: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(write(&mut pair.client, id, &data), data.len());

    let datagrams = drain(&mut pair.client, pair.now);
    assert!(datagrams.len() >= 3);

    // everything but the first segment arrives, newest first
    for datagram in datagrams[1..].iter().rev() {
        deliver(&mut pair.server, pair.now, datagram).unwrap();
    }
    let accepted = pair.server.accept_stream().unwrap();
    assert_eq!(read_all(&mut pair.server, accepted), b"");

    deliver(&mut pair.server, pair.now, &datagrams[0]).unwrap();
    assert_eq!(read_all(&mut pair.server, accepted), data);
}

#[test]
fn test_duplicate_packets_are_ignored() {
    let mut pair = Pair::new();
    let id = pair.client.open_stream().unwrap();
    write(&mut pair.client, id, b"once");
    let datagrams = drain(&mut pair.client, pair.now);

    deliver(&mut pair.server, pair.now, &datagrams[0]).unwrap();
    deliver(&mut pair.server, pair.now, &datagrams[0]).unwrap();
    assert_eq!(pair.server.stats().duplicate_packets, 1);

    pair.server.accept_stream().unwrap();
    assert_eq!(read_all(&mut pair.server, id), b"once");
}

#[test]
fn test_write_exhaustion_fires_writable_once() {
    let config = ConfigBuilder::new().send_buffer_size(1000).build().unwrap();
    let mut pair = Pair::with_config(&config);
    let id = pair.client.open_stream().unwrap();

    let data = vec![9u8; 1010];
    assert_eq!(write(&mut pair.client, id, &data), 1000);
    assert_eq!(write(&mut pair.client, id, &data[1000..]), 0);
    assert!(events(&mut pair.client).is_empty());

    pair.exchange();
    let writable = events(&mut pair.client)
        .into_iter()
        .filter(|e| *e == ConnectionEvent::StreamWritable(id))
        .count();
    assert_eq!(writable, 1);
    assert_eq!(write(&mut pair.client, id, &data[1000..]), 10);
}

#[test]
fn test_partial_write_fires_writable_without_empty_write() {
    let config = ConfigBuilder::new().send_buffer_size(1000).build().unwrap();
    let mut pair = Pair::with_config(&config);
    let id = pair.client.open_stream().unwrap();

    // one oversized write and nothing else
    assert_eq!(write(&mut pair.client, id, &[5u8; 1010]), 1000);
    pair.exchange();
    let writable = events(&mut pair.client)
        .into_iter()
        .filter(|e| *e == ConnectionEvent::StreamWritable(id))
        .count();
    assert_eq!(writable, 1);
}

#[test]
fn test_reply_on_connected_stream_is_announced() {
    let mut pair = Pair::new();
    let id = pair.client.open_stream().unwrap();
    write(&mut pair.client, id, b"ping");
    pair.exchange();
    events(&mut pair.client);

    pair.server.accept_stream().unwrap();
    assert_eq!(read_all(&mut pair.server, id), b"ping");
    write(&mut pair.server, id, b"pong");
    pair.exchange();

    // the client never read before, yet the reply is reported
    assert!(events(&mut pair.client).contains(&ConnectionEvent::StreamReadable(id)));
    assert_eq!(read_all(&mut pair.client, id), b"pong");
}

#[test]
fn test_large_transfer_respects_flow_control() {
    let mut pair = Pair::new();
    let id = pair.client.open_stream().unwrap();
    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
    assert_eq!(write(&mut pair.client, id, &data), data.len());

    let mut received = Vec::new();
    for _ in 0..500 {
        pair.client_to_server();
        if pair.server.pending_accept_count() > 0 {
            pair.server.accept_stream().unwrap();
        }
        received.extend(read_all(&mut pair.server, id));
        pair.server_to_client();
        pair.advance(Duration::from_millis(1));
        if received.len() == data.len() {
            break;
        }
    }
    assert_eq!(received.len(), data.len());
    assert!(received == data);
    assert_eq!(pair.client.stats().packets_lost, 0);
}

#[test]
fn test_stop_sending_closes_remote_write_side() {
    let mut pair = Pair::new();
    let id = pair.client.open_stream().unwrap();
    write(&mut pair.client, id, b"unwanted");
    pair.exchange();

    pair.server.accept_stream().unwrap();
    pair.server.stream_mut(id).unwrap().read_close();
    pair.exchange();

    let stream = pair.client.stream_mut(id).unwrap();
    assert!(stream.write_is_closed());
    assert_eq!(stream.write(b"more").unwrap(), 0);
}

#[test]
fn test_stream_limit_is_enforced() {
    let mut config = EngineConfig::default();
    config.connection.max_streams = 2;
    let mut pair = Pair::with_config(&config);
    for _ in 0..3 {
        let id = pair.client.open_stream().unwrap();
        write(&mut pair.client, id, b"s");
    }
    pair.client_to_server();

    assert!(pair.server.accept_stream().is_ok());
    assert!(pair.server.accept_stream().is_ok());
    assert!(pair.server.accept_stream().is_err());
}

#[test]
fn test_close_propagates_to_peer() {
    let mut pair = Pair::new();
    let id = pair.client.open_stream().unwrap();
    write(&mut pair.client, id, b"bye");
    pair.exchange();
    pair.server.accept_stream().unwrap();

    pair.client.close(0, "done");
    pair.client.close(0, "done");
    assert!(pair.client.stream(id).unwrap().write_is_closed());
    assert_eq!(pair.client.state(), ConnectionState::Closing);

    pair.client_to_server();
    assert_eq!(pair.client.state(), ConnectionState::Closed);
    assert_eq!(pair.server.state(), ConnectionState::Closed);
    assert_eq!(
        pair.server.close_reason(),
        Some(&ConnectionError::ClosedByPeer {
            code: 0,
            reason: "done".to_string()
        })
    );
    assert!(events(&mut pair.server).contains(&ConnectionEvent::Closed));

    // buffered bytes stay readable, then the stream reports closed
    assert_eq!(read_all(&mut pair.server, id), b"bye");
    assert!(pair.server.stream(id).unwrap().read_is_closed());
    assert!(pair.server.stream(id).unwrap().write_is_closed());

    assert_eq!(pair.server.reap_streams(), vec![id]);
    assert!(pair.server.is_drained(pair.now));
    assert!(!pair.client.is_drained(pair.now));
    assert!(pair.client.is_drained(pair.now + Duration::from_secs(60)));
}

#[test]
fn test_idle_timeout_closes_silently() {
    let mut pair = Pair::new();
    pair.advance(Duration::from_secs(31));
    pair.server.on_timeout(pair.now);
    assert_eq!(pair.server.state(), ConnectionState::Closed);
    assert_eq!(pair.server.close_reason(), Some(&ConnectionError::IdleTimeout));
    assert!(drain(&mut pair.server, pair.now).is_empty());
}

#[test]
fn test_keep_alive_sends_ping() {
    let mut pair = Pair::new();
    let id = pair.client.open_stream().unwrap();
    write(&mut pair.client, id, b"k");
    pair.exchange();

    pair.advance(Duration::from_secs(10));
    assert!(pair.client.next_timeout().is_some_and(|t| t <= pair.now));
    pair.client.on_timeout(pair.now);
    assert_eq!(drain(&mut pair.client, pair.now).len(), 1);
    assert!(pair.client.has_in_flight());
}

#[test]
fn test_streams_retire_and_connection_finishes() {
    let mut pair = Pair::new();
    let id = pair.client.open_stream().unwrap();
    write(&mut pair.client, id, b"hi");
    pair.client.stream_mut(id).unwrap().write_close();
    pair.exchange();

    pair.server.accept_stream().unwrap();
    assert_eq!(read_all(&mut pair.server, id), b"hi");
    write(&mut pair.server, id, b"hi");
    pair.server.stream_mut(id).unwrap().write_close();
    pair.exchange();

    assert_eq!(read_all(&mut pair.client, id), b"hi");
    pair.exchange();

    assert!(!pair.client.is_finished());
    assert_eq!(pair.client.reap_streams(), vec![id]);
    assert_eq!(pair.server.reap_streams(), vec![id]);
    assert!(pair.client.is_finished());
    assert!(pair.server.is_finished());
    assert_eq!(pair.client.stats().streams_closed, 1);

    // late duplicates for a retired stream are harmless
    assert!(pair.server.ensure_stream(id).is_ok_and(|open| !open));
}

#[test]
fn test_mismatched_keys_drop_packets() {
    let config = EngineConfig::default();
    let cid = ConnectionId::from_bytes([3; CONNECTION_ID_LEN]);
    let now = Instant::now();
    let mut client = Connection::new(
        Side::Client,
        cid,
        SERVER_ADDR.parse().unwrap(),
        Box::new(ChaChaProtection::new(&[1u8; 32], &cid).unwrap()),
        &config,
        now,
    );
    let mut server = Connection::new(
        Side::Server,
        cid,
        CLIENT_ADDR.parse().unwrap(),
        Box::new(ChaChaProtection::new(&[2u8; 32], &cid).unwrap()),
        &config,
        now,
    );

    let id = client.open_stream().unwrap();
    write(&mut client, id, b"secret");
    let datagrams = drain(&mut client, now);
    let err = deliver(&mut server, now, &datagrams[0]).unwrap_err();
    assert!(err.is_remote());
    assert_eq!(server.stats().packets_received, 0);
}
