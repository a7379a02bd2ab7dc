use std::time::Instant;
use tracing::{debug, trace};

use super::frame::Frame;
use super::packet::PacketNumber;
use super::range_set::RangeSet;

/// Received packet bookkeeping and ACK frame generation
#[derive(Debug)]
pub struct AckManager {
    /// Received packet numbers, as ranges
    received: RangeSet,
    /// Packet numbers below this have been forgotten and count as duplicates
    floor: u64,
    /// Largest received packet number and when it arrived
    largest_received: Option<(PacketNumber, Instant)>,
    /// An ack-eliciting packet arrived since the last ACK was sent
    ack_pending: bool,
    /// Maximum ranges reported in one ACK frame
    max_ranges: usize,
}

impl AckManager {
    pub fn new(max_ranges: usize) -> Self {
        Self {
            received: RangeSet::new(),
            floor: 0,
            largest_received: None,
            ack_pending: false,
            max_ranges: max_ranges.max(1),
        }
    }

    /// Record a received packet. Returns false for a duplicate, which must
    /// not be processed again.
    pub fn on_packet_received(&mut self, packet_number: PacketNumber, ack_eliciting: bool, now: Instant) -> bool {
        let value = packet_number.value();
        if value < self.floor || self.received.contains(value) {
            debug!("Duplicate packet received: {}", value);
            // the peer is retransmitting, so our last ACK may have been lost
            if ack_eliciting {
                self.ack_pending = true;
            }
            return false;
        }

        self.received.insert(value..value + 1);
        if let Some(floor) = self.received.truncate_low(self.max_ranges) {
            trace!("Forgetting packets below {}", floor);
            self.floor = floor;
        }

        if self.largest_received.is_none_or(|(largest, _)| packet_number > largest) {
            self.largest_received = Some((packet_number, now));
        }
        if ack_eliciting {
            self.ack_pending = true;
        }
        true
    }

    pub fn largest_received(&self) -> Option<PacketNumber> {
        self.largest_received.map(|(pn, _)| pn)
    }

    /// Highest packet number below which nothing is missing
    pub fn largest_contiguous(&self) -> Option<u64> {
        self.received
            .first()
            .filter(|range| range.start <= self.floor)
            .map(|range| range.end - 1)
    }

    /// Number of holes in the received sequence
    pub fn gap_count(&self) -> usize {
        let leading = usize::from(self.received.first().is_some_and(|r| r.start > self.floor));
        self.received.len().saturating_sub(1) + leading
    }

    pub fn wants_ack(&self) -> bool {
        self.ack_pending
    }

    /// Build an ACK frame covering everything received
    pub fn ack_frame(&self, now: Instant) -> Option<Frame> {
        let (largest, received_at) = self.largest_received?;
        let ack_ranges: Vec<(u64, u64)> = self
            .received
            .iter()
            .rev()
            .map(|range| (range.start, range.end - 1))
            .collect();
        Some(Frame::Ack {
            largest_acknowledged: largest.value(),
            ack_delay: now.saturating_duration_since(received_at).as_micros() as u64,
            ack_ranges,
        })
    }

    pub fn on_ack_sent(&mut self) {
        self.ack_pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_duplicate_detection() {
        let mut manager = AckManager::new(8);
        let now = Instant::now();
        assert!(manager.on_packet_received(PacketNumber::new(0), true, now));
        manager.on_ack_sent();
        assert!(!manager.on_packet_received(PacketNumber::new(0), true, now));
        // a duplicate still asks for a fresh ACK
        assert!(manager.wants_ack());
    }

    #[test]
    fn test_gaps_produce_selective_ranges() {
        let mut manager = AckManager::new(8);
        let now = Instant::now();
        for pn in [0u64, 1, 2, 5, 6, 9] {
            manager.on_packet_received(PacketNumber::new(pn), true, now);
        }
        assert_eq!(manager.largest_contiguous(), Some(2));
        assert_eq!(manager.gap_count(), 2);

        let frame = manager.ack_frame(now + Duration::from_millis(3)).unwrap();
        match frame {
            Frame::Ack {
                largest_acknowledged,
                ack_delay,
                ack_ranges,
            } => {
                assert_eq!(largest_acknowledged, 9);
                assert_eq!(ack_delay, 3000);
                assert_eq!(ack_ranges, vec![(9, 9), (5, 6), (0, 2)]);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_out_of_order_arrival_fills_gap() {
        let mut manager = AckManager::new(8);
        let now = Instant::now();
        manager.on_packet_received(PacketNumber::new(1), true, now);
        assert_eq!(manager.largest_contiguous(), None);
        assert_eq!(manager.gap_count(), 1);

        manager.on_packet_received(PacketNumber::new(0), true, now);
        assert_eq!(manager.largest_contiguous(), Some(1));
        assert_eq!(manager.gap_count(), 0);
        assert_eq!(manager.largest_received(), Some(PacketNumber::new(1)));
    }

    #[test]
    fn test_ack_only_packets_do_not_elicit() {
        let mut manager = AckManager::new(8);
        manager.on_packet_received(PacketNumber::new(0), false, Instant::now());
        assert!(!manager.wants_ack());
        assert!(manager.ack_frame(Instant::now()).is_some());
    }

    #[test]
    fn test_range_limit_forgets_oldest() {
        let mut manager = AckManager::new(2);
        let now = Instant::now();
        for pn in [0u64, 2, 4] {
            manager.on_packet_received(PacketNumber::new(pn), true, now);
        }
        // packet 1 is now below the floor and counts as a duplicate
        assert!(!manager.on_packet_received(PacketNumber::new(1), true, now));
        assert!(manager.on_packet_received(PacketNumber::new(3), true, now));
    }
}
