use std::time::{Duration, Instant};

use super::{Bandwidth, INITIAL_MAX_DATAGRAM_SIZE, bytes_from_bandwidth_and_time};

const MAX_BURST_SIZE_PACKETS: u64 = 10;
const MIN_PACING_DELAY: Duration = Duration::from_millis(1);
const TIMER_GRANULARITY: Duration = Duration::from_millis(1);

/// Token bucket that spreads sends over time at the owner's pacing rate.
///
/// The rate is supplied on every call rather than stored, since each
/// controller derives it from state that changes between calls.
#[derive(Debug, Clone)]
pub struct Pacer {
    budget_at_last_sent: u64,
    max_datagram_size: u64,
    last_sent_time: Option<Instant>,
}

impl Pacer {
    pub fn new(initial_bandwidth: Bandwidth) -> Self {
        let mut pacer = Self {
            budget_at_last_sent: 0,
            max_datagram_size: INITIAL_MAX_DATAGRAM_SIZE,
            last_sent_time: None,
        };
        pacer.budget_at_last_sent = pacer.max_burst_size(initial_bandwidth);
        pacer
    }

    pub fn on_packet_sent(&mut self, sent_time: Instant, size: u64, bandwidth: Bandwidth) {
        let budget = self.budget(sent_time, bandwidth);
        self.budget_at_last_sent = budget.saturating_sub(size);
        self.last_sent_time = Some(sent_time);
    }

    pub fn budget(&self, now: Instant, bandwidth: Bandwidth) -> u64 {
        let max_burst = self.max_burst_size(bandwidth);
        let last_sent_time = match self.last_sent_time {
            Some(t) => t,
            None => return max_burst,
        };
        let refill =
            bytes_from_bandwidth_and_time(bandwidth, now.saturating_duration_since(last_sent_time));
        self.budget_at_last_sent
            .saturating_add(refill)
            .min(max_burst)
    }

    fn max_burst_size(&self, bandwidth: Bandwidth) -> u64 {
        let timer_burst =
            bytes_from_bandwidth_and_time(bandwidth, MIN_PACING_DELAY + TIMER_GRANULARITY);
        timer_burst.max(MAX_BURST_SIZE_PACKETS * self.max_datagram_size)
    }

    /// Returns when the next packet may be sent, or `None` when there is
    /// already enough budget for a full datagram.
    pub fn time_until_send(&self, bandwidth: Bandwidth) -> Option<Instant> {
        if self.budget_at_last_sent >= self.max_datagram_size {
            return None;
        }
        let last_sent_time = self.last_sent_time?;
        let missing = (self.max_datagram_size - self.budget_at_last_sent) as u128 * 1_000_000_000;
        let bandwidth = bandwidth.max(1) as u128;
        // round up so the budget covers a full datagram when the timer fires
        let nanos = missing.div_ceil(bandwidth);
        let delay = Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX));
        Some(last_sent_time + delay.max(MIN_PACING_DELAY))
    }

    pub fn set_max_datagram_size(&mut self, size: u64) {
        self.max_datagram_size = size;
    }

    pub fn max_datagram_size(&self) -> u64 {
        self.max_datagram_size
    }
}
