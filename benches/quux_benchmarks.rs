//! Codec and packet protection benchmarks

use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use quux::crypto::{ChaChaProtection, PacketProtection, Plaintext};
use quux::quic::connection::{ConnectionId, Side};
use quux::quic::frame::Frame;
use quux::quic::packet::{Packet, PacketHeader, PacketNumber, PacketType};
use quux::quic::range_set::RangeSet;
use quux::quic::stream::StreamId;

fn stream_frame(len: usize) -> Frame {
    Frame::Stream {
        stream_id: StreamId::new(4),
        offset: 1 << 20,
        data: Bytes::from(vec![0x5a; len]),
        fin: false,
    }
}

fn bench_frame_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");

    for size in [64usize, 1100] {
        let frame = stream_frame(size);
        let encoded = frame.encode();
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encode_stream", size), &frame, |b, frame| {
            b.iter(|| black_box(frame.encode()));
        });
        group.bench_with_input(BenchmarkId::new("decode_stream", size), &encoded, |b, encoded| {
            b.iter(|| black_box(Frame::decode(encoded).unwrap()));
        });
    }

    let ack = Frame::Ack {
        largest_acknowledged: 10_000,
        ack_delay: 250,
        ack_ranges: (0..32).map(|i| (10_000 - i * 10 - 5, 10_000 - i * 10)).collect(),
    };
    let encoded = ack.encode();
    group.bench_function("decode_ack_32_ranges", |b| {
        b.iter(|| black_box(Frame::decode(&encoded).unwrap()));
    });

    group.finish();
}

fn bench_packet_protection(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_protection");
    let connection_id = ConnectionId::from_bytes([9; 8]);
    let header = PacketHeader::new(PacketType::OneRtt, connection_id, PacketNumber::new(1234));
    let payload = stream_frame(1100).encode();
    let packet = Packet::new(header.clone(), payload.clone());
    group.throughput(Throughput::Bytes(payload.len() as u64));

    let backends: Vec<(&str, Box<dyn PacketProtection>)> = vec![
        ("plaintext", Box::new(Plaintext)),
        ("chacha20_poly1305", Box::new(ChaChaProtection::new(&[7; 32], &connection_id).unwrap())),
    ];
    for (name, protection) in &backends {
        let datagram = packet.seal(Side::Client, protection.as_ref()).unwrap();
        let header_len = header.encoded_len();

        group.bench_function(BenchmarkId::new("seal", name), |b| {
            b.iter(|| black_box(packet.seal(Side::Client, protection.as_ref()).unwrap()));
        });
        group.bench_function(BenchmarkId::new("open", name), |b| {
            b.iter(|| {
                let (decoded, _) = PacketHeader::decode(&datagram).unwrap();
                let (header_bytes, body) = datagram.split_at(header_len);
                black_box(Packet::open(decoded, header_bytes, body, Side::Client, protection.as_ref()).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_range_set(c: &mut Criterion) {
    c.bench_function("range_set_out_of_order_inserts", |b| {
        b.iter(|| {
            let mut set = RangeSet::new();
            for i in (0..512u64).rev().step_by(2) {
                set.insert(i * 100..i * 100 + 100);
            }
            for i in (1..512u64).step_by(2) {
                set.insert(i * 100..i * 100 + 100);
            }
            black_box(set.len())
        });
    });
}

criterion_group!(benches, bench_frame_codec, bench_packet_protection, bench_range_set);
criterion_main!(benches);
