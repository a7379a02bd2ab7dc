use std::time::Instant;
use tracing::{debug, warn};

/// NewReno-style congestion controller.
///
/// Only gates ack-eliciting packets; acknowledgments and connection close
/// frames are always allowed out.
#[derive(Debug)]
pub struct CongestionController {
    congestion_window: u64,
    ssthresh: u64,
    bytes_in_flight: u64,
    max_datagram_size: u64,
    min_congestion_window: u64,
    /// Packets sent before this instant do not trigger another reduction
    recovery_start_time: Option<Instant>,
}

impl CongestionController {
    /// Create a new congestion controller
    pub fn new(max_datagram_size: u64, initial_window_packets: u64) -> Self {
        let min_congestion_window = 2 * max_datagram_size;
        Self {
            congestion_window: (initial_window_packets * max_datagram_size).max(min_congestion_window),
            ssthresh: u64::MAX,
            bytes_in_flight: 0,
            max_datagram_size,
            min_congestion_window,
            recovery_start_time: None,
        }
    }

    /// Get current congestion window size
    pub fn congestion_window(&self) -> u64 {
        self.congestion_window
    }

    /// Get bytes currently in flight
    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    /// Check if we can send data
    pub fn can_send(&self, bytes: u64) -> bool {
        self.bytes_in_flight + bytes <= self.congestion_window
    }

    pub fn in_slow_start(&self) -> bool {
        self.congestion_window < self.ssthresh
    }

    /// Called when an ack-eliciting packet is sent
    pub fn on_packet_sent(&mut self, bytes: u64) {
        self.bytes_in_flight += bytes;
    }

    /// Called for each newly acknowledged packet
    pub fn on_packet_acked(&mut self, bytes: u64, time_sent: Instant) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);

        if self.recovery_start_time.is_some_and(|start| time_sent <= start) {
            return;
        }
        if self.in_slow_start() {
            self.congestion_window += bytes;
        } else {
            self.congestion_window += (self.max_datagram_size * bytes) / self.congestion_window;
        }
    }

    /// Called when packets are declared lost. `largest_time_sent` is the send
    /// time of the most recent lost packet.
    pub fn on_packets_lost(&mut self, lost_bytes: u64, largest_time_sent: Instant, now: Instant) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(lost_bytes);

        // one reduction per round trip
        if self.recovery_start_time.is_some_and(|start| largest_time_sent <= start) {
            return;
        }
        self.recovery_start_time = Some(now);
        self.ssthresh = std::cmp::max(self.congestion_window / 2, self.min_congestion_window);
        self.congestion_window = self.ssthresh;

        warn!(
            "Packet loss detected: {} bytes lost, cwnd reduced to {}",
            lost_bytes, self.congestion_window
        );
    }

    /// Called when the retransmission timer fires
    pub fn on_retransmission_timeout(&mut self) {
        self.congestion_window = self.min_congestion_window;
        debug!("Retransmission timeout, cwnd collapsed to {}", self.congestion_window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_slow_start_growth() {
        let mut cc = CongestionController::new(1200, 10);
        assert_eq!(cc.congestion_window(), 12_000);
        assert!(cc.in_slow_start());

        let now = Instant::now();
        cc.on_packet_sent(1200);
        assert_eq!(cc.bytes_in_flight(), 1200);
        cc.on_packet_acked(1200, now);
        assert_eq!(cc.congestion_window(), 13_200);
        assert_eq!(cc.bytes_in_flight(), 0);
    }

    #[test]
    fn test_loss_halves_window_once_per_round() {
        let mut cc = CongestionController::new(1200, 10);
        let start = Instant::now();
        for _ in 0..4 {
            cc.on_packet_sent(1200);
        }
        let now = start + Duration::from_millis(10);
        cc.on_packets_lost(1200, start, now);
        assert_eq!(cc.congestion_window(), 6_000);
        assert!(!cc.in_slow_start());

        // a second loss from the same flight does not reduce again
        cc.on_packets_lost(1200, start, now + Duration::from_millis(1));
        assert_eq!(cc.congestion_window(), 6_000);

        // acks for packets sent before recovery started do not grow the window
        cc.on_packet_acked(1200, start);
        assert_eq!(cc.congestion_window(), 6_000);

        // acks for later packets grow it linearly
        cc.on_packet_acked(1200, now + Duration::from_millis(5));
        assert_eq!(cc.congestion_window(), 6_000 + 1200 * 1200 / 6_000);
    }

    #[test]
    fn test_can_send_respects_window() {
        let mut cc = CongestionController::new(1000, 2);
        assert!(cc.can_send(2000));
        cc.on_packet_sent(1500);
        assert!(!cc.can_send(1000));
        cc.on_retransmission_timeout();
        assert_eq!(cc.congestion_window(), 2000);
    }
}
