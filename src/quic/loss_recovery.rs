use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::packet::PacketNumber;
use super::stream::{Chunk, StreamId};
use crate::config::RecoveryConfig;

/// Timer granularity used as a floor for RTT variance
const GRANULARITY: Duration = Duration::from_millis(1);

/// What an ack-eliciting packet carried, so its contents can be settled on
/// acknowledgment or requeued on loss
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentFrame {
    Stream { stream_id: StreamId, chunk: Chunk },
    MaxStreamData { stream_id: StreamId },
    StopSending { stream_id: StreamId },
    Ping,
}

#[derive(Debug, Clone)]
pub struct SentPacket {
    pub packet_number: PacketNumber,
    pub time_sent: Instant,
    pub size: usize,
    pub frames: Vec<SentFrame>,
}

/// Result of processing one ACK frame
#[derive(Debug, Default)]
pub struct AckOutcome {
    pub newly_acked: Vec<SentPacket>,
    pub lost: Vec<SentPacket>,
    pub rtt_sample: Option<Duration>,
}

/// Round-trip time estimation
#[derive(Debug, Clone)]
pub struct RttEstimator {
    latest: Option<Duration>,
    smoothed: Option<Duration>,
    variance: Duration,
    min: Option<Duration>,
    initial: Duration,
}

impl RttEstimator {
    pub fn new(initial: Duration) -> Self {
        Self {
            latest: None,
            smoothed: None,
            variance: initial / 2,
            min: None,
            initial,
        }
    }

    pub fn update(&mut self, sample: Duration, ack_delay: Duration) {
        self.latest = Some(sample);
        let min = self.min.map_or(sample, |m| m.min(sample));
        self.min = Some(min);

        // only discount the peer's delay when it cannot push us below min_rtt
        let adjusted = if sample >= min + ack_delay {
            sample - ack_delay
        } else {
            sample
        };

        match self.smoothed {
            None => {
                self.smoothed = Some(adjusted);
                self.variance = adjusted / 2;
            }
            Some(smoothed) => {
                let deviation = if smoothed > adjusted {
                    smoothed - adjusted
                } else {
                    adjusted - smoothed
                };
                self.variance = (self.variance * 3 + deviation) / 4;
                self.smoothed = Some((smoothed * 7 + adjusted) / 8);
            }
        }
    }

    pub fn smoothed(&self) -> Duration {
        self.smoothed.unwrap_or(self.initial)
    }

    pub fn latest(&self) -> Option<Duration> {
        self.latest
    }

    pub fn min(&self) -> Option<Duration> {
        self.min
    }

    /// srtt + max(4 * rttvar, granularity)
    pub fn rto_base(&self) -> Duration {
        self.smoothed() + (self.variance * 4).max(GRANULARITY)
    }
}

/// Packet loss detection and retransmission timing
#[derive(Debug)]
pub struct LossRecovery {
    /// Ack-eliciting packets sent but not yet acknowledged
    sent_packets: BTreeMap<PacketNumber, SentPacket>,
    largest_acked: Option<PacketNumber>,
    rtt: RttEstimator,
    /// Packet reordering threshold
    packet_threshold: u64,
    /// Consecutive retransmission timeouts without an acknowledgment
    rto_count: u32,
    min_rto: Duration,
    max_rto: Duration,
}

impl LossRecovery {
    pub fn new(config: &RecoveryConfig) -> Self {
        Self {
            sent_packets: BTreeMap::new(),
            largest_acked: None,
            rtt: RttEstimator::new(Duration::from_millis(config.initial_rtt)),
            packet_threshold: config.packet_threshold.max(1),
            rto_count: 0,
            min_rto: Duration::from_millis(config.min_rto),
            max_rto: Duration::from_millis(config.max_rto),
        }
    }

    pub fn on_packet_sent(&mut self, packet: SentPacket) {
        trace!("Tracking packet {} ({} bytes)", packet.packet_number, packet.size);
        self.sent_packets.insert(packet.packet_number, packet);
    }

    /// Process the inclusive ranges of an ACK frame, largest first
    pub fn on_ack_received(&mut self, now: Instant, ack_ranges: &[(u64, u64)], ack_delay: Duration) -> AckOutcome {
        let mut outcome = AckOutcome::default();
        let Some(&(_, largest)) = ack_ranges.first() else {
            return outcome;
        };

        for &(lo, hi) in ack_ranges {
            if lo > hi {
                continue;
            }
            let acked: Vec<PacketNumber> = self
                .sent_packets
                .range(PacketNumber::new(lo)..=PacketNumber::new(hi))
                .map(|(pn, _)| *pn)
                .collect();
            for pn in acked {
                if let Some(packet) = self.sent_packets.remove(&pn) {
                    outcome.newly_acked.push(packet);
                }
            }
        }

        let largest = PacketNumber::new(largest);
        if self.largest_acked.is_none_or(|current| largest > current) {
            self.largest_acked = Some(largest);
        }

        if let Some(packet) = outcome.newly_acked.iter().find(|p| p.packet_number == largest) {
            let sample = now.saturating_duration_since(packet.time_sent);
            self.rtt.update(sample, ack_delay);
            outcome.rtt_sample = Some(sample);
            trace!("RTT sample {:?}, smoothed {:?}", sample, self.rtt.smoothed());
        }

        if !outcome.newly_acked.is_empty() {
            self.rto_count = 0;
        }

        outcome.lost = self.detect_lost(now);
        outcome
    }

    fn detect_lost(&mut self, now: Instant) -> Vec<SentPacket> {
        let Some(largest) = self.largest_acked else {
            return Vec::new();
        };
        let loss_delay = (self.rtt.smoothed().max(self.rtt.latest().unwrap_or_default()) * 9 / 8).max(GRANULARITY);
        let lost: Vec<PacketNumber> = self
            .sent_packets
            .range(..largest)
            .filter(|(pn, packet)| {
                pn.value() + self.packet_threshold <= largest.value() || packet.time_sent + loss_delay <= now
            })
            .map(|(pn, _)| *pn)
            .collect();

        if !lost.is_empty() {
            debug!("Declared {} packets lost below {}", lost.len(), largest);
        }
        lost.into_iter().filter_map(|pn| self.sent_packets.remove(&pn)).collect()
    }

    /// Current retransmission timeout, including exponential backoff
    pub fn rto(&self) -> Duration {
        let base = self.rtt.rto_base().clamp(self.min_rto, self.max_rto);
        base.saturating_mul(1u32 << self.rto_count.min(16)).min(self.max_rto)
    }

    /// When the oldest outstanding packet times out
    pub fn loss_timer(&self) -> Option<Instant> {
        self.sent_packets
            .values()
            .map(|p| p.time_sent)
            .min()
            .map(|oldest| oldest + self.rto())
    }

    /// Fire the retransmission timer. Every packet outstanding for a full
    /// timeout is presumed lost.
    pub fn on_timeout(&mut self, now: Instant) -> Vec<SentPacket> {
        match self.loss_timer() {
            Some(deadline) if now >= deadline => {}
            _ => return Vec::new(),
        }
        let rto = self.rto();
        let expired: Vec<PacketNumber> = self
            .sent_packets
            .iter()
            .filter(|(_, p)| p.time_sent + rto <= now)
            .map(|(pn, _)| *pn)
            .collect();
        self.rto_count += 1;
        debug!(
            "Retransmission timeout after {:?}: {} packets presumed lost (backoff {})",
            rto,
            expired.len(),
            self.rto_count
        );
        expired.into_iter().filter_map(|pn| self.sent_packets.remove(&pn)).collect()
    }

    pub fn has_in_flight(&self) -> bool {
        !self.sent_packets.is_empty()
    }

    pub fn in_flight_count(&self) -> usize {
        self.sent_packets.len()
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn rto_count(&self) -> u32 {
        self.rto_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RecoveryConfig {
        RecoveryConfig {
            initial_rtt: 100,
            min_rto: 50,
            max_rto: 2_000,
            packet_threshold: 3,
            initial_congestion_window: 10,
        }
    }

    fn sent(pn: u64, at: Instant) -> SentPacket {
        SentPacket {
            packet_number: PacketNumber::new(pn),
            time_sent: at,
            size: 100,
            frames: vec![SentFrame::Ping],
        }
    }

    #[test]
    fn test_ack_removes_packets_and_samples_rtt() {
        let mut recovery = LossRecovery::new(&config());
        let start = Instant::now();
        recovery.on_packet_sent(sent(0, start));
        recovery.on_packet_sent(sent(1, start));

        let outcome = recovery.on_ack_received(start + Duration::from_millis(40), &[(0, 1)], Duration::ZERO);
        assert_eq!(outcome.newly_acked.len(), 2);
        assert!(outcome.lost.is_empty());
        assert_eq!(outcome.rtt_sample, Some(Duration::from_millis(40)));
        assert_eq!(recovery.rtt().smoothed(), Duration::from_millis(40));
        assert!(!recovery.has_in_flight());
    }

    #[test]
    fn test_packet_threshold_loss() {
        let mut recovery = LossRecovery::new(&config());
        let start = Instant::now();
        for pn in 0..5 {
            recovery.on_packet_sent(sent(pn, start));
        }
        // 0 is missing; 4 acked puts it three packets behind
        let outcome = recovery.on_ack_received(start + Duration::from_millis(1), &[(1, 4)], Duration::ZERO);
        assert_eq!(outcome.newly_acked.len(), 4);
        assert_eq!(outcome.lost.len(), 1);
        assert_eq!(outcome.lost[0].packet_number, PacketNumber::new(0));
    }

    #[test]
    fn test_reordering_within_threshold_is_not_loss() {
        let mut recovery = LossRecovery::new(&config());
        let start = Instant::now();
        for pn in 0..3 {
            recovery.on_packet_sent(sent(pn, start));
        }
        let outcome = recovery.on_ack_received(start + Duration::from_millis(1), &[(1, 2)], Duration::ZERO);
        assert!(outcome.lost.is_empty());
        assert!(recovery.has_in_flight());
    }

    #[test]
    fn test_timeout_declares_loss_and_backs_off() {
        let mut recovery = LossRecovery::new(&config());
        let start = Instant::now();
        recovery.on_packet_sent(sent(0, start));

        let rto = recovery.rto();
        assert_eq!(recovery.loss_timer(), Some(start + rto));
        assert!(recovery.on_timeout(start + rto / 2).is_empty());

        let lost = recovery.on_timeout(start + rto);
        assert_eq!(lost.len(), 1);
        assert_eq!(recovery.rto_count(), 1);
        assert_eq!(recovery.rto(), (rto * 2).min(Duration::from_millis(2_000)));
        assert_eq!(recovery.loss_timer(), None);
    }

    #[test]
    fn test_rto_is_clamped() {
        let mut recovery = LossRecovery::new(&config());
        let start = Instant::now();
        for pn in 0..20 {
            recovery.on_packet_sent(sent(pn, start));
            let deadline = recovery.loss_timer().unwrap();
            recovery.on_timeout(deadline);
        }
        assert_eq!(recovery.rto(), Duration::from_millis(2_000));
    }
}
