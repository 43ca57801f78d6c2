use std::time::Instant;

use super::{Bandwidth, CongestionControl, INITIAL_MAX_DATAGRAM_SIZE, Pacer, PacketNumber, RttStats};

const PKT_INFO_SLOT_COUNT: usize = 4;
const MIN_SAMPLE_COUNT: u64 = 50;
const MIN_ACK_RATE: f64 = 0.8;
const CONGESTION_WINDOW_MULTIPLIER: f64 = 1.5;
// Window used before the first RTT sample.
const DEFAULT_CONGESTION_WINDOW: u64 = 10240;

#[derive(Debug, Clone, Copy, Default)]
struct PktInfo {
    timestamp: u64,
    ack_count: u64,
    loss_count: u64,
}

/// Sends at a fixed target rate regardless of loss, compensating for the
/// observed ack rate over the last few seconds.
#[derive(Debug, Clone)]
pub struct BrutalSender {
    rtt_stats: RttStats,
    bps: Bandwidth,
    max_datagram_size: u64,
    pacer: Pacer,
    created: Instant,
    pkt_info_slots: [PktInfo; PKT_INFO_SLOT_COUNT],
    ack_rate: f64,
}

impl BrutalSender {
    pub fn new(bps: Bandwidth, now: Instant) -> Self {
        Self {
            rtt_stats: RttStats::default(),
            bps,
            max_datagram_size: INITIAL_MAX_DATAGRAM_SIZE,
            pacer: Pacer::new(bps),
            created: now,
            pkt_info_slots: [PktInfo::default(); PKT_INFO_SLOT_COUNT],
            ack_rate: 1.0,
        }
    }

    pub fn bps(&self) -> Bandwidth {
        self.bps
    }

    pub fn ack_rate(&self) -> f64 {
        self.ack_rate
    }

    fn pacing_rate(&self) -> Bandwidth {
        (self.bps as f64 / self.ack_rate) as Bandwidth
    }

    fn timestamp(&self, event_time: Instant) -> u64 {
        event_time.saturating_duration_since(self.created).as_secs()
    }

    fn record(&mut self, event_time: Instant, acked: bool) {
        let timestamp = self.timestamp(event_time);
        let slot = &mut self.pkt_info_slots[timestamp as usize % PKT_INFO_SLOT_COUNT];
        if slot.timestamp != timestamp {
            // unused or stale
            *slot = PktInfo {
                timestamp,
                ack_count: 0,
                loss_count: 0,
            };
        }
        if acked {
            slot.ack_count += 1;
        } else {
            slot.loss_count += 1;
        }
        self.update_ack_rate(timestamp);
    }

    fn update_ack_rate(&mut self, timestamp: u64) {
        let min_timestamp = timestamp.saturating_sub(PKT_INFO_SLOT_COUNT as u64);
        let (ack_count, loss_count) = self
            .pkt_info_slots
            .iter()
            .filter(|info| info.timestamp >= min_timestamp)
            .fold((0, 0), |(acks, losses), info| {
                (acks + info.ack_count, losses + info.loss_count)
            });

        if ack_count + loss_count < MIN_SAMPLE_COUNT {
            self.ack_rate = 1.0;
            return;
        }
        let rate = ack_count as f64 / (ack_count + loss_count) as f64;
        self.ack_rate = rate.max(MIN_ACK_RATE);
    }
}

impl CongestionControl for BrutalSender {
    fn set_rtt_stats(&mut self, rtt_stats: RttStats) {
        self.rtt_stats = rtt_stats;
    }

    fn time_until_send(&self, _bytes_in_flight: u64) -> Option<Instant> {
        self.pacer.time_until_send(self.pacing_rate())
    }

    fn has_pacing_budget(&self, now: Instant) -> bool {
        self.pacer.budget(now, self.pacing_rate()) >= self.max_datagram_size
    }

    fn on_packet_sent(
        &mut self,
        sent_time: Instant,
        _bytes_in_flight: u64,
        _packet_number: PacketNumber,
        bytes: u64,
        _is_retransmittable: bool,
    ) {
        let pacing_rate = self.pacing_rate();
        self.pacer.on_packet_sent(sent_time, bytes, pacing_rate);
    }

    fn maybe_exit_slow_start(&mut self) {}

    fn on_packet_acked(
        &mut self,
        _packet_number: PacketNumber,
        _acked_bytes: u64,
        _prior_in_flight: u64,
        event_time: Instant,
    ) {
        self.record(event_time, true);
    }

    fn on_packet_lost(
        &mut self,
        _packet_number: PacketNumber,
        _lost_bytes: u64,
        _prior_in_flight: u64,
        event_time: Instant,
    ) {
        self.record(event_time, false);
    }

    fn on_retransmission_timeout(&mut self, _packets_retransmitted: bool) {}

    fn set_max_datagram_size(&mut self, size: u64) {
        self.max_datagram_size = size;
        self.pacer.set_max_datagram_size(size);
    }

    fn congestion_window(&self) -> u64 {
        let rtt = self.rtt_stats.smoothed_rtt;
        if rtt.is_zero() {
            return DEFAULT_CONGESTION_WINDOW;
        }
        (self.bps as f64 * rtt.as_secs_f64() * CONGESTION_WINDOW_MULTIPLIER / self.ack_rate) as u64
    }

    fn in_slow_start(&self) -> bool {
        false
    }

    fn in_recovery(&self) -> bool {
        false
    }

    fn bandwidth_estimate(&self) -> Bandwidth {
        self.bps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const MBPS_100: Bandwidth = 100 * 125_000;

    fn with_rtt(sender: &mut BrutalSender, rtt: Duration) {
        sender.set_rtt_stats(RttStats::new(rtt, rtt, rtt));
    }

    #[test]
    fn test_window_without_rtt() {
        let sender = BrutalSender::new(MBPS_100, Instant::now());
        assert_eq!(sender.congestion_window(), 10240);
        assert!(!sender.in_slow_start());
        assert!(!sender.in_recovery());
    }

    #[test]
    fn test_window_from_rate_and_rtt() {
        let mut sender = BrutalSender::new(MBPS_100, Instant::now());
        with_rtt(&mut sender, Duration::from_millis(100));
        // 12.5MB/s * 0.1s * 1.5
        assert_eq!(sender.congestion_window(), 1_875_000);
        assert_eq!(sender.bandwidth_estimate(), MBPS_100);
    }

    #[test]
    fn test_few_samples_keep_full_ack_rate() {
        let now = Instant::now();
        let mut sender = BrutalSender::new(MBPS_100, now);
        for packet_number in 0..40 {
            sender.on_packet_lost(packet_number, 1200, 0, now);
        }
        assert_eq!(sender.ack_rate(), 1.0);
    }

    #[test]
    fn test_ack_rate_compensates_for_loss() {
        let now = Instant::now();
        let mut sender = BrutalSender::new(MBPS_100, now);
        with_rtt(&mut sender, Duration::from_millis(100));
        for packet_number in 0..90 {
            sender.on_packet_acked(packet_number, 1200, 0, now);
        }
        for packet_number in 90..100 {
            sender.on_packet_lost(packet_number, 1200, 0, now);
        }
        assert!((sender.ack_rate() - 0.9).abs() < 1e-9);
        assert_eq!(
            sender.congestion_window(),
            (MBPS_100 as f64 * 0.1 * 1.5 / 0.9) as u64
        );
    }

    #[test]
    fn test_ack_rate_floor() {
        let now = Instant::now();
        let mut sender = BrutalSender::new(MBPS_100, now);
        for packet_number in 0..50 {
            sender.on_packet_acked(packet_number, 1200, 0, now);
        }
        for packet_number in 50..150 {
            sender.on_packet_lost(packet_number, 1200, 0, now);
        }
        assert_eq!(sender.ack_rate(), MIN_ACK_RATE);
    }

    #[test]
    fn test_old_slots_are_ignored() {
        let now = Instant::now();
        let mut sender = BrutalSender::new(MBPS_100, now);
        for packet_number in 0..100 {
            sender.on_packet_lost(packet_number, 1200, 0, now);
        }
        assert_eq!(sender.ack_rate(), MIN_ACK_RATE);
        let later = now + Duration::from_secs(10);
        for packet_number in 100..160 {
            sender.on_packet_acked(packet_number, 1200, 0, later);
        }
        assert_eq!(sender.ack_rate(), 1.0);
    }
}
