use std::time::Duration;

use super::PacketNumber;

// Windows below this many packets never exit slow start early.
const LOW_WINDOW_PACKETS: u64 = 16;
// Number of RTT samples per round used to find the round's minimum.
const MIN_SAMPLES: u32 = 8;
// Exit when the round's min RTT exceeds the connection min by min_rtt / 8,
// clamped to [4ms, 16ms].
const DELAY_FACTOR_EXP: u32 = 3;
const DELAY_MIN_THRESHOLD: Duration = Duration::from_micros(4000);
const DELAY_MAX_THRESHOLD: Duration = Duration::from_micros(16000);

/// Delay based slow start exit heuristic (HyStart).
#[derive(Debug, Clone, Default)]
pub struct HybridSlowStart {
    end_packet_number: PacketNumber,
    last_sent_packet_number: PacketNumber,
    started: bool,
    current_min_rtt: Duration,
    rtt_sample_count: u32,
    hystart_found: bool,
}

impl HybridSlowStart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_packet_sent(&mut self, packet_number: PacketNumber) {
        self.last_sent_packet_number = packet_number;
    }

    pub fn on_packet_acked(&mut self, acked_packet_number: PacketNumber) {
        if self.is_end_of_round(acked_packet_number) {
            self.started = false;
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn restart(&mut self) {
        self.started = false;
        self.hystart_found = false;
    }

    fn start_receive_round(&mut self, last_sent: PacketNumber) {
        self.end_packet_number = last_sent;
        self.current_min_rtt = Duration::ZERO;
        self.rtt_sample_count = 0;
        self.started = true;
    }

    fn is_end_of_round(&self, ack: PacketNumber) -> bool {
        self.end_packet_number < ack
    }

    pub fn should_exit_slow_start(
        &mut self,
        latest_rtt: Duration,
        min_rtt: Duration,
        congestion_window_packets: u64,
    ) -> bool {
        if !self.started {
            self.start_receive_round(self.last_sent_packet_number);
        }
        if self.hystart_found {
            return true;
        }

        self.rtt_sample_count += 1;
        if self.rtt_sample_count <= MIN_SAMPLES
            && (self.current_min_rtt.is_zero() || self.current_min_rtt > latest_rtt)
        {
            self.current_min_rtt = latest_rtt;
        }

        if self.rtt_sample_count == MIN_SAMPLES {
            let threshold = (min_rtt / (1 << DELAY_FACTOR_EXP))
                .clamp(DELAY_MIN_THRESHOLD, DELAY_MAX_THRESHOLD);
            if self.current_min_rtt > min_rtt + threshold {
                self.hystart_found = true;
            }
        }

        congestion_window_packets >= LOW_WINDOW_PACKETS && self.hystart_found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_tracking() {
        let mut slow_start = HybridSlowStart::new();
        slow_start.on_packet_sent(10);
        assert!(!slow_start.started());
        slow_start.should_exit_slow_start(
            Duration::from_millis(60),
            Duration::from_millis(60),
            100,
        );
        assert!(slow_start.started());
        slow_start.on_packet_acked(10);
        assert!(slow_start.started());
        slow_start.on_packet_acked(11);
        assert!(!slow_start.started());
    }

    #[test]
    fn test_delay_increase_exits() {
        let mut slow_start = HybridSlowStart::new();
        let min_rtt = Duration::from_millis(60);
        // 60ms / 8 = 7.5ms threshold
        let rtt = min_rtt + Duration::from_millis(10);
        for _ in 0..MIN_SAMPLES - 1 {
            assert!(!slow_start.should_exit_slow_start(rtt, min_rtt, 100));
        }
        assert!(slow_start.should_exit_slow_start(rtt, min_rtt, 100));
    }

    #[test]
    fn test_no_exit_on_stable_rtt() {
        let mut slow_start = HybridSlowStart::new();
        let min_rtt = Duration::from_millis(60);
        let rtt = min_rtt + Duration::from_millis(5);
        for _ in 0..20 {
            assert!(!slow_start.should_exit_slow_start(rtt, min_rtt, 100));
        }
    }

    #[test]
    fn test_low_window_never_exits() {
        let mut slow_start = HybridSlowStart::new();
        let min_rtt = Duration::from_millis(60);
        let rtt = Duration::from_millis(100);
        for _ in 0..20 {
            assert!(!slow_start.should_exit_slow_start(rtt, min_rtt, 8));
        }
        slow_start.restart();
        assert!(!slow_start.started());
    }
}
