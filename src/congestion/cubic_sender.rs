use std::time::Instant;

use super::{
    Bandwidth, CongestionControl, Cubic, HybridSlowStart, INFINITE_BANDWIDTH,
    INITIAL_CONGESTION_WINDOW_PACKETS, Pacer, PacketNumber, RttStats, bandwidth_from_delta,
};

const MAX_BURST_PACKETS: u64 = 3;
const RENO_BETA: f32 = 0.7;
const MIN_CONGESTION_WINDOW_PACKETS: u64 = 2;
pub const MAX_CONGESTION_WINDOW_PACKETS: u64 = 20000;

/// Loss based sender running either CUBIC or classic Reno congestion
/// avoidance, with HyStart governing the slow start exit.
#[derive(Debug, Clone)]
pub struct CubicSender {
    hybrid_slow_start: HybridSlowStart,
    rtt_stats: RttStats,
    cubic: Cubic,
    pacer: Pacer,
    reno: bool,
    largest_sent_packet_number: Option<PacketNumber>,
    largest_acked_packet_number: Option<PacketNumber>,
    // Largest packet outstanding when the window was last cut back. Losses
    // of packets up to here belong to the same loss event.
    largest_sent_at_last_cutback: Option<PacketNumber>,
    last_cutback_exited_slow_start: bool,
    congestion_window: u64,
    slow_start_threshold: u64,
    // Ack counter for Reno congestion avoidance.
    num_acked_packets: u64,
    initial_congestion_window: u64,
    initial_max_congestion_window: u64,
    max_datagram_size: u64,
}

impl CubicSender {
    pub fn new(initial_max_datagram_size: u64, reno: bool) -> Self {
        Self::with_windows(
            initial_max_datagram_size,
            reno,
            INITIAL_CONGESTION_WINDOW_PACKETS * initial_max_datagram_size,
            MAX_CONGESTION_WINDOW_PACKETS * initial_max_datagram_size,
        )
    }

    pub fn with_windows(
        initial_max_datagram_size: u64,
        reno: bool,
        initial_congestion_window: u64,
        initial_max_congestion_window: u64,
    ) -> Self {
        let mut pacer = Pacer::new(INFINITE_BANDWIDTH);
        pacer.set_max_datagram_size(initial_max_datagram_size);
        Self {
            hybrid_slow_start: HybridSlowStart::new(),
            rtt_stats: RttStats::default(),
            cubic: Cubic::new(initial_max_datagram_size),
            pacer,
            reno,
            largest_sent_packet_number: None,
            largest_acked_packet_number: None,
            largest_sent_at_last_cutback: None,
            last_cutback_exited_slow_start: false,
            congestion_window: initial_congestion_window,
            slow_start_threshold: u64::MAX,
            num_acked_packets: 0,
            initial_congestion_window,
            initial_max_congestion_window,
            max_datagram_size: initial_max_datagram_size,
        }
    }

    pub fn is_reno(&self) -> bool {
        self.reno
    }

    pub fn slow_start_threshold(&self) -> u64 {
        self.slow_start_threshold
    }

    pub fn last_cutback_exited_slow_start(&self) -> bool {
        self.last_cutback_exited_slow_start
    }

    fn max_congestion_window(&self) -> u64 {
        self.max_datagram_size * MAX_CONGESTION_WINDOW_PACKETS
    }

    fn min_congestion_window(&self) -> u64 {
        self.max_datagram_size * MIN_CONGESTION_WINDOW_PACKETS
    }

    fn pacing_rate(&self) -> Bandwidth {
        // Pace slightly above the estimate so RTT jitter does not leave the
        // window underused.
        let estimate = self.bandwidth_estimate();
        estimate.saturating_add(estimate / 4)
    }

    fn maybe_increase_cwnd(&mut self, acked_bytes: u64, prior_in_flight: u64, event_time: Instant) {
        // Only grow when the sender is close to using the current window.
        if !self.is_cwnd_limited(prior_in_flight) {
            self.cubic.on_application_limited();
            return;
        }
        if self.congestion_window >= self.max_congestion_window() {
            return;
        }
        if self.in_slow_start() {
            // One datagram per ack doubles the window every round trip.
            self.congestion_window += self.max_datagram_size;
            return;
        }
        if self.reno {
            self.num_acked_packets += 1;
            if self.num_acked_packets >= self.congestion_window / self.max_datagram_size {
                self.congestion_window += self.max_datagram_size;
                self.num_acked_packets = 0;
            }
        } else {
            self.congestion_window = self.max_congestion_window().min(
                self.cubic.congestion_window_after_ack(
                    acked_bytes,
                    self.congestion_window,
                    self.rtt_stats.min_rtt,
                    event_time,
                ),
            );
        }
    }

    fn is_cwnd_limited(&self, bytes_in_flight: u64) -> bool {
        let congestion_window = self.congestion_window();
        if bytes_in_flight >= congestion_window {
            return true;
        }
        let available_bytes = congestion_window - bytes_in_flight;
        let slow_start_limited = self.in_slow_start() && bytes_in_flight > congestion_window / 2;
        slow_start_limited || available_bytes <= MAX_BURST_PACKETS * self.max_datagram_size
    }

    pub fn on_connection_migration(&mut self) {
        self.hybrid_slow_start.restart();
        self.largest_sent_packet_number = None;
        self.largest_acked_packet_number = None;
        self.largest_sent_at_last_cutback = None;
        self.last_cutback_exited_slow_start = false;
        self.cubic.reset();
        self.num_acked_packets = 0;
        self.congestion_window = self.initial_congestion_window;
        self.slow_start_threshold = self.initial_max_congestion_window;
    }
}

impl CongestionControl for CubicSender {
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
        packet_number: PacketNumber,
        bytes: u64,
        is_retransmittable: bool,
    ) {
        let pacing_rate = self.pacing_rate();
        self.pacer.on_packet_sent(sent_time, bytes, pacing_rate);
        if !is_retransmittable {
            return;
        }
        self.largest_sent_packet_number = Some(packet_number);
        self.hybrid_slow_start.on_packet_sent(packet_number);
    }

    fn maybe_exit_slow_start(&mut self) {
        if self.in_slow_start()
            && self.hybrid_slow_start.should_exit_slow_start(
                self.rtt_stats.latest_rtt,
                self.rtt_stats.min_rtt,
                self.congestion_window() / self.max_datagram_size,
            )
        {
            self.slow_start_threshold = self.congestion_window;
        }
    }

    fn on_packet_acked(
        &mut self,
        packet_number: PacketNumber,
        acked_bytes: u64,
        prior_in_flight: u64,
        event_time: Instant,
    ) {
        self.largest_acked_packet_number = Some(
            self.largest_acked_packet_number
                .map_or(packet_number, |largest| largest.max(packet_number)),
        );
        if self.in_recovery() {
            return;
        }
        self.maybe_increase_cwnd(acked_bytes, prior_in_flight, event_time);
        if self.in_slow_start() {
            self.hybrid_slow_start.on_packet_acked(packet_number);
        }
    }

    fn on_packet_lost(
        &mut self,
        packet_number: PacketNumber,
        _lost_bytes: u64,
        _prior_in_flight: u64,
        _event_time: Instant,
    ) {
        // Losses of packets sent before the last cutback are part of the same
        // loss event (RFC 6582).
        if let Some(cutback) = self.largest_sent_at_last_cutback
            && packet_number <= cutback
        {
            return;
        }
        self.last_cutback_exited_slow_start = self.in_slow_start();

        self.congestion_window = if self.reno {
            (self.congestion_window as f32 * RENO_BETA) as u64
        } else {
            self.cubic
                .congestion_window_after_packet_loss(self.congestion_window)
        };
        self.congestion_window = self.congestion_window.max(self.min_congestion_window());
        self.slow_start_threshold = self.congestion_window;
        self.largest_sent_at_last_cutback = self.largest_sent_packet_number;
        self.num_acked_packets = 0;
    }

    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool) {
        self.largest_sent_at_last_cutback = None;
        if !packets_retransmitted {
            return;
        }
        self.hybrid_slow_start.restart();
        self.cubic.reset();
        self.slow_start_threshold = self.congestion_window / 2;
        self.congestion_window = self.min_congestion_window();
    }

    fn set_max_datagram_size(&mut self, size: u64) {
        if size == self.max_datagram_size {
            return;
        }
        let cwnd_is_min_cwnd = self.congestion_window == self.min_congestion_window();
        self.max_datagram_size = size;
        if cwnd_is_min_cwnd {
            self.congestion_window = self.min_congestion_window();
        }
        self.cubic.set_max_datagram_size(size);
        self.pacer.set_max_datagram_size(size);
    }

    fn congestion_window(&self) -> u64 {
        self.congestion_window
    }

    fn in_slow_start(&self) -> bool {
        self.congestion_window() < self.slow_start_threshold
    }

    fn in_recovery(&self) -> bool {
        match (
            self.largest_acked_packet_number,
            self.largest_sent_at_last_cutback,
        ) {
            (Some(acked), Some(cutback)) => acked <= cutback,
            _ => false,
        }
    }

    fn bandwidth_estimate(&self) -> Bandwidth {
        if self.rtt_stats.smoothed_rtt.is_zero() {
            return INFINITE_BANDWIDTH;
        }
        bandwidth_from_delta(self.congestion_window(), self.rtt_stats.smoothed_rtt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion::{AckedPacket, LostPacket};
    use std::time::Duration;

    const MSS: u64 = 1252;

    struct Harness {
        sender: CubicSender,
        now: Instant,
        next_packet: PacketNumber,
        in_flight: u64,
        outstanding: std::collections::VecDeque<PacketNumber>,
    }

    impl Harness {
        fn new(reno: bool) -> Self {
            let mut sender = CubicSender::new(MSS, reno);
            sender.set_rtt_stats(RttStats::new(
                Duration::from_millis(100),
                Duration::from_millis(100),
                Duration::from_millis(100),
            ));
            Self {
                sender,
                now: Instant::now(),
                next_packet: 1,
                in_flight: 0,
                outstanding: Default::default(),
            }
        }

        fn send_available(&mut self) -> usize {
            let mut sent = 0;
            while self.sender.can_send(self.in_flight) {
                self.sender
                    .on_packet_sent(self.now, self.in_flight, self.next_packet, MSS, true);
                self.outstanding.push_back(self.next_packet);
                self.next_packet += 1;
                self.in_flight += MSS;
                sent += 1;
            }
            sent
        }

        fn ack(&mut self, count: usize) {
            self.now += Duration::from_millis(1);
            let mut acked = vec![];
            for _ in 0..count {
                if let Some(packet_number) = self.outstanding.pop_front() {
                    acked.push(AckedPacket {
                        packet_number,
                        bytes_acked: MSS,
                        receive_time: self.now,
                    });
                }
            }
            let prior_in_flight = self.in_flight;
            self.in_flight -= acked.len() as u64 * MSS;
            self.sender
                .on_congestion_event(prior_in_flight, self.now, &acked, &[]);
        }

        fn lose(&mut self) {
            let packet_number = self.outstanding.pop_front().unwrap();
            let prior_in_flight = self.in_flight;
            self.in_flight -= MSS;
            self.sender.on_congestion_event(
                prior_in_flight,
                self.now,
                &[],
                &[LostPacket {
                    packet_number,
                    bytes_lost: MSS,
                }],
            );
        }
    }

    #[test]
    fn test_initial_window() {
        let harness = Harness::new(false);
        assert_eq!(harness.sender.congestion_window(), 32 * MSS);
        assert!(harness.sender.in_slow_start());
        assert!(!harness.sender.in_recovery());
    }

    #[test]
    fn test_slow_start_grows_one_mss_per_ack() {
        let mut harness = Harness::new(false);
        assert_eq!(harness.send_available(), 32);
        harness.ack(2);
        assert_eq!(harness.sender.congestion_window(), 34 * MSS);
    }

    #[test]
    fn test_window_monotonic_under_pure_acks() {
        for reno in [false, true] {
            let mut harness = Harness::new(reno);
            let mut previous = harness.sender.congestion_window();
            for _ in 0..3000 {
                harness.send_available();
                harness.ack(2);
                let window = harness.sender.congestion_window();
                assert!(window >= previous);
                assert!(window <= MAX_CONGESTION_WINDOW_PACKETS * MSS);
                previous = window;
            }
        }
    }

    #[test]
    fn test_loss_reduces_window() {
        for reno in [false, true] {
            let mut harness = Harness::new(reno);
            harness.send_available();
            harness.ack(10);
            harness.send_available();
            let before = harness.sender.congestion_window();
            harness.lose();
            let after = harness.sender.congestion_window();
            assert!(after <= (before as f32 * 0.7) as u64);
            assert!(after >= 2 * MSS);
            assert!(harness.sender.in_recovery());
            assert!(!harness.sender.in_slow_start());
            assert!(harness.sender.last_cutback_exited_slow_start());

            // a second loss from the same flight is the same loss event
            harness.lose();
            assert_eq!(harness.sender.congestion_window(), after);
        }
    }

    #[test]
    fn test_window_never_below_minimum() {
        let mut sender = CubicSender::with_windows(MSS, true, 2 * MSS, 100 * MSS);
        let now = Instant::now();
        sender.on_packet_sent(now, 0, 1, MSS, true);
        sender.on_packet_lost(1, MSS, MSS, now);
        assert_eq!(sender.congestion_window(), 2 * MSS);
    }

    #[test]
    fn test_retransmission_timeout() {
        let mut harness = Harness::new(false);
        harness.send_available();
        harness.sender.on_retransmission_timeout(true);
        assert_eq!(harness.sender.congestion_window(), 2 * MSS);
        assert_eq!(harness.sender.slow_start_threshold(), 16 * MSS);
    }

    #[test]
    fn test_bandwidth_estimate() {
        let mut sender = CubicSender::new(MSS, false);
        assert_eq!(sender.bandwidth_estimate(), INFINITE_BANDWIDTH);
        sender.set_rtt_stats(RttStats::new(
            Duration::from_millis(100),
            Duration::from_millis(100),
            Duration::from_millis(100),
        ));
        assert_eq!(sender.bandwidth_estimate(), 32 * MSS * 10);
    }

    #[test]
    fn test_pacing_budget() {
        let mut sender = CubicSender::new(MSS, false);
        let now = Instant::now();
        assert!(sender.has_pacing_budget(now));
        assert!(sender.time_until_send(0).is_none());
        sender.set_rtt_stats(RttStats::new(
            Duration::from_millis(100),
            Duration::from_millis(100),
            Duration::from_millis(100),
        ));
        for packet_number in 1..=20 {
            sender.on_packet_sent(now, 0, packet_number, MSS, true);
        }
        assert!(!sender.has_pacing_budget(now));
        assert!(sender.time_until_send(0).unwrap() > now);
    }
}
