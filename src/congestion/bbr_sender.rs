use std::time::{Duration, Instant};

use rand::Rng;

use super::{
    AckedPacket, Bandwidth, BandwidthSampler, CongestionControl, LostPacket, MaxFilter, Pacer,
    PacketNumber, RttStats, WindowedFilter, bandwidth_from_delta, bytes_from_bandwidth_and_time,
};

pub const DEFAULT_MAX_CONGESTION_WINDOW_PACKETS: u64 = 10000;
const MIN_CONGESTION_WINDOW_PACKETS: u64 = 4;

// Used as the min RTT until a sample is taken.
const INITIAL_RTT: Duration = Duration::from_millis(100);

// 2 / ln(2), the smallest gain that doubles the delivery rate every round.
const DEFAULT_HIGH_GAIN: f64 = 2.885;
const DEFAULT_CONGESTION_WINDOW_GAIN: f64 = 2.0;

const PACING_GAIN: [f64; 8] = [1.25, 0.75, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
const GAIN_CYCLE_LENGTH: usize = PACING_GAIN.len();
// Bandwidth filter window, in round trips.
const BANDWIDTH_WINDOW_SIZE: u64 = GAIN_CYCLE_LENGTH as u64 + 2;

const MIN_RTT_EXPIRY: Duration = Duration::from_secs(10);
const PROBE_RTT_TIME: Duration = Duration::from_millis(200);

// STARTUP ends once the bandwidth estimate fails to grow by this factor for
// this many consecutive rounds.
const STARTUP_GROWTH_TARGET: f64 = 1.25;
const ROUND_TRIPS_WITHOUT_GROWTH_BEFORE_EXITING_STARTUP: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BbrMode {
    Startup,
    Drain,
    ProbeBw,
    ProbeRtt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecoveryState {
    NotInRecovery,
    // One extra outstanding byte per byte acked.
    Conservation,
    // Two extra outstanding bytes per byte acked.
    Growth,
}

/// BBR v1: models the path as a bottleneck bandwidth and a minimum RTT and
/// paces at the estimated bandwidth times a mode dependent gain.
#[derive(Debug, Clone)]
pub struct BbrSender {
    mode: BbrMode,
    rtt_stats: RttStats,
    bytes_in_flight: u64,
    sampler: BandwidthSampler,
    round_trip_count: u64,
    last_sent_packet: PacketNumber,
    // Acking any packet after this one starts a new round trip.
    current_round_trip_end: Option<PacketNumber>,
    max_bandwidth: WindowedFilter<Bandwidth, MaxFilter>,
    // Bytes acked beyond what max_bandwidth predicts, from ack aggregation.
    max_ack_height: WindowedFilter<u64, MaxFilter>,
    aggregation_epoch_start_time: Option<Instant>,
    aggregation_epoch_bytes: u64,
    min_rtt: Duration,
    min_rtt_timestamp: Instant,
    congestion_window: u64,
    initial_congestion_window: u64,
    max_congestion_window: u64,
    min_congestion_window: u64,
    high_gain: f64,
    high_cwnd_gain: f64,
    drain_gain: f64,
    pacing_rate: Bandwidth,
    pacing_gain: f64,
    congestion_window_gain: f64,
    congestion_window_gain_constant: f64,
    num_startup_rtts: u64,
    cycle_current_offset: usize,
    last_cycle_start: Option<Instant>,
    is_at_full_bandwidth: bool,
    rounds_without_bandwidth_gain: u64,
    bandwidth_at_last_round: Bandwidth,
    exiting_quiescence: bool,
    // None until bytes in flight drops to the PROBE_RTT window.
    exit_probe_rtt_at: Option<Instant>,
    probe_rtt_round_passed: bool,
    last_sample_is_app_limited: bool,
    has_non_app_limited_sample: bool,
    recovery_state: RecoveryState,
    end_recovery_at: Option<PacketNumber>,
    recovery_window: u64,
    pacer: Pacer,
    max_datagram_size: u64,
}

impl BbrSender {
    pub fn new(
        initial_max_datagram_size: u64,
        initial_congestion_window: u64,
        max_congestion_window: u64,
        now: Instant,
    ) -> Self {
        let mut pacer = Pacer::new(0);
        pacer.set_max_datagram_size(initial_max_datagram_size);
        Self {
            mode: BbrMode::Startup,
            rtt_stats: RttStats::default(),
            bytes_in_flight: 0,
            sampler: BandwidthSampler::new(),
            round_trip_count: 0,
            last_sent_packet: 0,
            current_round_trip_end: None,
            max_bandwidth: WindowedFilter::new(BANDWIDTH_WINDOW_SIZE),
            max_ack_height: WindowedFilter::new(BANDWIDTH_WINDOW_SIZE),
            aggregation_epoch_start_time: None,
            aggregation_epoch_bytes: 0,
            min_rtt: Duration::ZERO,
            min_rtt_timestamp: now,
            congestion_window: initial_congestion_window,
            initial_congestion_window,
            max_congestion_window,
            min_congestion_window: MIN_CONGESTION_WINDOW_PACKETS * initial_max_datagram_size,
            high_gain: DEFAULT_HIGH_GAIN,
            high_cwnd_gain: DEFAULT_HIGH_GAIN,
            drain_gain: 1.0 / DEFAULT_HIGH_GAIN,
            pacing_rate: 0,
            pacing_gain: DEFAULT_HIGH_GAIN,
            congestion_window_gain: DEFAULT_HIGH_GAIN,
            congestion_window_gain_constant: DEFAULT_CONGESTION_WINDOW_GAIN,
            num_startup_rtts: ROUND_TRIPS_WITHOUT_GROWTH_BEFORE_EXITING_STARTUP,
            cycle_current_offset: 0,
            last_cycle_start: None,
            is_at_full_bandwidth: false,
            rounds_without_bandwidth_gain: 0,
            bandwidth_at_last_round: 0,
            exiting_quiescence: false,
            exit_probe_rtt_at: None,
            probe_rtt_round_passed: false,
            last_sample_is_app_limited: false,
            has_non_app_limited_sample: false,
            recovery_state: RecoveryState::NotInRecovery,
            end_recovery_at: None,
            recovery_window: max_congestion_window,
            pacer,
            max_datagram_size: initial_max_datagram_size,
        }
    }

    pub fn mode(&self) -> BbrMode {
        self.mode
    }

    pub fn pacing_gain(&self) -> f64 {
        self.pacing_gain
    }

    pub fn min_rtt(&self) -> Duration {
        if self.min_rtt.is_zero() {
            INITIAL_RTT
        } else {
            self.min_rtt
        }
    }

    pub fn round_trip_count(&self) -> u64 {
        self.round_trip_count
    }

    pub fn is_at_full_bandwidth(&self) -> bool {
        self.is_at_full_bandwidth
    }

    /// The rate packets are released at, which is the configured pacing rate
    /// or a startup rate derived from the initial window.
    pub fn pacing_rate(&self) -> Bandwidth {
        if self.pacing_rate == 0 {
            let initial = bandwidth_from_delta(self.initial_congestion_window, self.min_rtt());
            return (self.high_gain * initial as f64) as Bandwidth;
        }
        self.pacing_rate
    }

    fn probe_rtt_congestion_window(&self) -> u64 {
        self.min_congestion_window
    }

    fn target_congestion_window(&self, gain: f64) -> u64 {
        let bdp = bytes_from_bandwidth_and_time(self.bandwidth_estimate(), self.min_rtt());
        let mut congestion_window = (gain * bdp as f64) as u64;
        // No bandwidth samples yet.
        if congestion_window == 0 {
            congestion_window = (gain * self.initial_congestion_window as f64) as u64;
        }
        congestion_window.max(self.min_congestion_window)
    }

    fn update_round_trip_counter(&mut self, last_acked_packet: PacketNumber) -> bool {
        let round_ended = match self.current_round_trip_end {
            Some(end) => last_acked_packet > end,
            None => true,
        };
        if round_ended {
            self.round_trip_count += 1;
            self.current_round_trip_end = Some(self.last_sent_packet);
        }
        round_ended
    }

    fn update_bandwidth_and_min_rtt(&mut self, now: Instant, acked_packets: &[AckedPacket]) -> bool {
        let mut sample_min_rtt: Option<Duration> = None;
        for packet in acked_packets {
            let sample = self.sampler.on_packet_acked(now, packet.packet_number);
            if !sample.state_at_send.is_valid {
                continue;
            }
            self.last_sample_is_app_limited = sample.state_at_send.is_app_limited;
            self.has_non_app_limited_sample |= !sample.state_at_send.is_app_limited;
            if !sample.rtt.is_zero() {
                sample_min_rtt = Some(sample_min_rtt.map_or(sample.rtt, |rtt| rtt.min(sample.rtt)));
            }
            if !sample.state_at_send.is_app_limited
                || sample.bandwidth > self.bandwidth_estimate()
            {
                self.max_bandwidth
                    .update(sample.bandwidth, self.round_trip_count);
            }
        }

        let sample_min_rtt = match sample_min_rtt {
            Some(rtt) => rtt,
            None => return false,
        };

        // An unset min RTT never expires.
        let min_rtt_expired =
            !self.min_rtt.is_zero() && now > self.min_rtt_timestamp + MIN_RTT_EXPIRY;
        if min_rtt_expired || sample_min_rtt < self.min_rtt || self.min_rtt.is_zero() {
            self.min_rtt = sample_min_rtt;
            self.min_rtt_timestamp = now;
        }
        min_rtt_expired
    }

    fn discard_lost_packets(&mut self, lost_packets: &[LostPacket]) {
        for packet in lost_packets {
            self.sampler.on_packet_lost(packet.packet_number);
        }
    }

    fn update_recovery_state(
        &mut self,
        last_acked_packet: PacketNumber,
        has_losses: bool,
        is_round_start: bool,
    ) {
        // Recovery ends after a full round without losses.
        if has_losses {
            self.end_recovery_at = Some(self.last_sent_packet);
        }

        match self.recovery_state {
            RecoveryState::NotInRecovery => {
                if has_losses {
                    self.recovery_state = RecoveryState::Conservation;
                    // Initialized in calculate_recovery_window.
                    self.recovery_window = 0;
                    // Conservation lasts a whole round, starting now.
                    self.current_round_trip_end = Some(self.last_sent_packet);
                }
            }
            RecoveryState::Conservation | RecoveryState::Growth => {
                if self.recovery_state == RecoveryState::Conservation && is_round_start {
                    self.recovery_state = RecoveryState::Growth;
                }
                let past_recovery_point = self
                    .end_recovery_at
                    .is_none_or(|end| last_acked_packet > end);
                if !has_losses && past_recovery_point {
                    self.recovery_state = RecoveryState::NotInRecovery;
                }
            }
        }
    }

    fn update_ack_aggregation_bytes(&mut self, ack_time: Instant, newly_acked_bytes: u64) -> u64 {
        let epoch_start = *self.aggregation_epoch_start_time.get_or_insert(ack_time);
        // Bytes the max bandwidth would have delivered since the epoch started.
        let expected_acked_bytes = bytes_from_bandwidth_and_time(
            self.max_bandwidth.best(),
            ack_time.saturating_duration_since(epoch_start),
        );
        // Start a new epoch once acks arrive no faster than max bandwidth.
        if self.aggregation_epoch_bytes <= expected_acked_bytes {
            self.aggregation_epoch_bytes = newly_acked_bytes;
            self.aggregation_epoch_start_time = Some(ack_time);
            return 0;
        }
        self.aggregation_epoch_bytes += newly_acked_bytes;
        let excess = self.aggregation_epoch_bytes - expected_acked_bytes;
        self.max_ack_height.update(excess, self.round_trip_count);
        excess
    }

    fn update_gain_cycle_phase(&mut self, now: Instant, prior_in_flight: u64, has_losses: bool) {
        let mut should_advance_gain_cycling = self
            .last_cycle_start
            .is_none_or(|start| now.saturating_duration_since(start) > self.min_rtt());

        // While probing, hold the high gain until the extra data is actually in
        // flight unless losses show the buffer cannot take it.
        if self.pacing_gain > 1.0
            && !has_losses
            && prior_in_flight < self.target_congestion_window(self.pacing_gain)
        {
            should_advance_gain_cycling = false;
        }

        // While draining, leave early once the queue is gone.
        if self.pacing_gain < 1.0 && self.bytes_in_flight <= self.target_congestion_window(1.0) {
            should_advance_gain_cycling = true;
        }

        if should_advance_gain_cycling {
            self.cycle_current_offset = (self.cycle_current_offset + 1) % GAIN_CYCLE_LENGTH;
            self.last_cycle_start = Some(now);
            self.pacing_gain = PACING_GAIN[self.cycle_current_offset];
        }
    }

    fn check_if_full_bandwidth_reached(&mut self) {
        if self.last_sample_is_app_limited {
            return;
        }

        let target = (self.bandwidth_at_last_round as f64 * STARTUP_GROWTH_TARGET) as Bandwidth;
        if self.bandwidth_estimate() >= target {
            self.bandwidth_at_last_round = self.bandwidth_estimate();
            self.rounds_without_bandwidth_gain = 0;
            return;
        }

        self.rounds_without_bandwidth_gain += 1;
        if self.rounds_without_bandwidth_gain >= self.num_startup_rtts {
            self.is_at_full_bandwidth = true;
        }
    }

    fn maybe_exit_startup_or_drain(&mut self, now: Instant) {
        if self.mode == BbrMode::Startup && self.is_at_full_bandwidth {
            self.mode = BbrMode::Drain;
            self.pacing_gain = self.drain_gain;
            self.congestion_window_gain = self.high_cwnd_gain;
        }
        if self.mode == BbrMode::Drain && self.bytes_in_flight <= self.target_congestion_window(1.0)
        {
            self.enter_probe_bandwidth_mode(now);
        }
    }

    fn enter_startup_mode(&mut self) {
        self.mode = BbrMode::Startup;
        self.pacing_gain = self.high_gain;
        self.congestion_window_gain = self.high_cwnd_gain;
    }

    fn enter_probe_bandwidth_mode(&mut self, now: Instant) {
        self.mode = BbrMode::ProbeBw;
        self.congestion_window_gain = self.congestion_window_gain_constant;

        // Random offset from {0, 2..7}. 1 is excluded so the 0.75 phase always
        // directly follows the 1.25 phase.
        let mut offset = rand::rng().random_range(0..GAIN_CYCLE_LENGTH - 1);
        if offset >= 1 {
            offset += 1;
        }
        self.cycle_current_offset = offset;
        self.last_cycle_start = Some(now);
        self.pacing_gain = PACING_GAIN[offset];
    }

    fn maybe_enter_or_exit_probe_rtt(
        &mut self,
        now: Instant,
        is_round_start: bool,
        min_rtt_expired: bool,
    ) {
        if min_rtt_expired && !self.exiting_quiescence && self.mode != BbrMode::ProbeRtt {
            self.mode = BbrMode::ProbeRtt;
            self.pacing_gain = 1.0;
            self.exit_probe_rtt_at = None;
        }

        if self.mode == BbrMode::ProbeRtt {
            self.sampler.on_app_limited();
            match self.exit_probe_rtt_at {
                None => {
                    // QUIC checks the window before sending, so allow one extra
                    // packet above the PROBE_RTT window.
                    if self.bytes_in_flight
                        < self.probe_rtt_congestion_window() + self.max_datagram_size
                    {
                        self.exit_probe_rtt_at = Some(now + PROBE_RTT_TIME);
                        self.probe_rtt_round_passed = false;
                    }
                }
                Some(exit_at) => {
                    if is_round_start {
                        self.probe_rtt_round_passed = true;
                    }
                    if now >= exit_at && self.probe_rtt_round_passed {
                        self.min_rtt_timestamp = now;
                        if !self.is_at_full_bandwidth {
                            self.enter_startup_mode();
                        } else {
                            self.enter_probe_bandwidth_mode(now);
                        }
                    }
                }
            }
        }

        self.exiting_quiescence = false;
    }

    fn calculate_pacing_rate(&mut self) {
        let bandwidth_estimate = self.bandwidth_estimate();
        if bandwidth_estimate == 0 {
            return;
        }

        let target_rate = (self.pacing_gain * bandwidth_estimate as f64) as Bandwidth;
        if self.is_at_full_bandwidth {
            self.pacing_rate = target_rate;
            return;
        }

        // Pace at initial_window / RTT once an RTT measurement exists.
        if self.pacing_rate == 0 {
            let min_rtt = if self.min_rtt.is_zero() {
                self.rtt_stats.min_rtt
            } else {
                self.min_rtt
            };
            if !min_rtt.is_zero() {
                self.pacing_rate = bandwidth_from_delta(self.initial_congestion_window, min_rtt);
                return;
            }
        }

        // Never lower the pacing rate during STARTUP.
        self.pacing_rate = self.pacing_rate.max(target_rate);
    }

    fn calculate_congestion_window(&mut self, bytes_acked: u64) {
        if self.mode == BbrMode::ProbeRtt {
            return;
        }

        let mut target_window = self.target_congestion_window(self.congestion_window_gain);
        if self.is_at_full_bandwidth {
            target_window += self.max_ack_height.best();
        }

        // Grow towards the target by at most the acked bytes.
        if self.is_at_full_bandwidth {
            self.congestion_window = target_window.min(self.congestion_window + bytes_acked);
        } else if self.congestion_window < target_window
            || self.sampler.total_bytes_acked() < self.initial_congestion_window
        {
            // The window never shrinks in STARTUP.
            self.congestion_window += bytes_acked;
        }

        self.congestion_window = self
            .congestion_window
            .clamp(self.min_congestion_window, self.max_congestion_window);
    }

    fn calculate_recovery_window(&mut self, bytes_acked: u64, bytes_lost: u64) {
        if self.recovery_state == RecoveryState::NotInRecovery {
            return;
        }

        if self.recovery_window == 0 {
            self.recovery_window =
                (self.bytes_in_flight + bytes_acked).max(self.min_congestion_window);
            return;
        }

        self.recovery_window = if self.recovery_window >= bytes_lost {
            self.recovery_window - bytes_lost
        } else {
            self.max_datagram_size
        };
        // CONSERVATION only removes losses, GROWTH also releases acked bytes
        // like slow start.
        if self.recovery_state == RecoveryState::Growth {
            self.recovery_window += bytes_acked;
        }
        self.recovery_window = self
            .recovery_window
            .max(self.bytes_in_flight + bytes_acked)
            .max(self.min_congestion_window);
    }
}

impl CongestionControl for BbrSender {
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
        bytes_in_flight: u64,
        packet_number: PacketNumber,
        bytes: u64,
        is_retransmittable: bool,
    ) {
        let pacing_rate = self.pacing_rate();
        self.pacer.on_packet_sent(sent_time, bytes, pacing_rate);
        self.last_sent_packet = packet_number;

        if bytes_in_flight == 0 && self.sampler.is_app_limited() {
            self.exiting_quiescence = true;
        }

        if self.aggregation_epoch_start_time.is_none() {
            self.aggregation_epoch_start_time = Some(sent_time);
        }

        self.sampler.on_packet_sent(
            sent_time,
            packet_number,
            bytes,
            bytes_in_flight,
            is_retransmittable,
        );
        self.bytes_in_flight = bytes_in_flight + bytes;
    }

    fn maybe_exit_slow_start(&mut self) {}

    fn on_app_limited(&mut self, bytes_in_flight: u64) {
        if bytes_in_flight >= self.congestion_window() {
            return;
        }
        self.sampler.on_app_limited();
    }

    fn on_packet_acked(
        &mut self,
        packet_number: PacketNumber,
        acked_bytes: u64,
        prior_in_flight: u64,
        event_time: Instant,
    ) {
        let acked = [AckedPacket {
            packet_number,
            bytes_acked: acked_bytes,
            receive_time: event_time,
        }];
        self.on_congestion_event(prior_in_flight, event_time, &acked, &[]);
    }

    fn on_packet_lost(
        &mut self,
        packet_number: PacketNumber,
        lost_bytes: u64,
        prior_in_flight: u64,
        event_time: Instant,
    ) {
        let lost = [LostPacket {
            packet_number,
            bytes_lost: lost_bytes,
        }];
        self.on_congestion_event(prior_in_flight, event_time, &[], &lost);
    }

    fn on_congestion_event(
        &mut self,
        prior_in_flight: u64,
        event_time: Instant,
        acked_packets: &[AckedPacket],
        lost_packets: &[LostPacket],
    ) {
        let acked_total: u64 = acked_packets.iter().map(|p| p.bytes_acked).sum();
        let bytes_lost: u64 = lost_packets.iter().map(|p| p.bytes_lost).sum();
        self.bytes_in_flight = prior_in_flight.saturating_sub(acked_total + bytes_lost);

        let total_bytes_acked_before = self.sampler.total_bytes_acked();
        let mut is_round_start = false;
        let mut min_rtt_expired = false;

        self.discard_lost_packets(lost_packets);

        if let Some(last_acked) = acked_packets.last() {
            is_round_start = self.update_round_trip_counter(last_acked.packet_number);
            min_rtt_expired = self.update_bandwidth_and_min_rtt(event_time, acked_packets);
            self.update_recovery_state(
                last_acked.packet_number,
                !lost_packets.is_empty(),
                is_round_start,
            );
            let bytes_acked = self.sampler.total_bytes_acked() - total_bytes_acked_before;
            self.update_ack_aggregation_bytes(event_time, bytes_acked);
        }

        if self.mode == BbrMode::ProbeBw {
            self.update_gain_cycle_phase(event_time, prior_in_flight, !lost_packets.is_empty());
        }

        if is_round_start && !self.is_at_full_bandwidth {
            self.check_if_full_bandwidth_reached();
        }
        self.maybe_exit_startup_or_drain(event_time);

        self.maybe_enter_or_exit_probe_rtt(event_time, is_round_start, min_rtt_expired);

        let bytes_acked = self.sampler.total_bytes_acked() - total_bytes_acked_before;

        self.calculate_pacing_rate();
        self.calculate_congestion_window(bytes_acked);
        self.calculate_recovery_window(bytes_acked, bytes_lost);
    }

    fn on_retransmission_timeout(&mut self, _packets_retransmitted: bool) {}

    fn set_max_datagram_size(&mut self, size: u64) {
        if size == self.max_datagram_size {
            return;
        }
        let cwnd_is_min_cwnd = self.congestion_window == self.min_congestion_window;
        self.max_datagram_size = size;
        self.min_congestion_window = MIN_CONGESTION_WINDOW_PACKETS * size;
        if cwnd_is_min_cwnd {
            self.congestion_window = self.min_congestion_window;
        }
        self.congestion_window = self.congestion_window.max(self.min_congestion_window);
        self.pacer.set_max_datagram_size(size);
    }

    fn congestion_window(&self) -> u64 {
        if self.mode == BbrMode::ProbeRtt {
            return self.probe_rtt_congestion_window();
        }
        if self.in_recovery() {
            return self.congestion_window.min(self.recovery_window);
        }
        self.congestion_window
    }

    fn in_slow_start(&self) -> bool {
        self.mode == BbrMode::Startup
    }

    fn in_recovery(&self) -> bool {
        self.recovery_state != RecoveryState::NotInRecovery
    }

    fn bandwidth_estimate(&self) -> Bandwidth {
        self.max_bandwidth.best()
    }
}
