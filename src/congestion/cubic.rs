use std::time::{Duration, Instant};

// The cubic function is evaluated in fixed point: time in units of 1/1024
// seconds and the window scaled by 2^40 / 410.
const CUBE_SCALE: u32 = 40;
const CUBE_CONGESTION_WINDOW_SCALE: u64 = 410;

const DEFAULT_NUM_CONNECTIONS: u32 = 1;

// Multiplicative decrease applied on loss.
const BETA: f32 = 0.7;
// Additional backoff of the remembered max window when a loss happens before
// the window recovered to the previous max.
const BETA_LAST_MAX: f32 = 0.85;

/// The CUBIC window growth function (RFC 8312) with a Reno-friendly floor.
#[derive(Debug, Clone)]
pub struct Cubic {
    max_datagram_size: u64,
    num_connections: u32,
    epoch: Option<Instant>,
    last_max_congestion_window: u64,
    acked_bytes_count: u64,
    estimated_tcp_congestion_window: u64,
    origin_point_congestion_window: u64,
    time_to_origin_point: u32,
    last_target_congestion_window: u64,
}

impl Cubic {
    pub fn new(max_datagram_size: u64) -> Self {
        Self {
            max_datagram_size,
            num_connections: DEFAULT_NUM_CONNECTIONS,
            epoch: None,
            last_max_congestion_window: 0,
            acked_bytes_count: 0,
            estimated_tcp_congestion_window: 0,
            origin_point_congestion_window: 0,
            time_to_origin_point: 0,
            last_target_congestion_window: 0,
        }
    }

    pub fn reset(&mut self) {
        self.epoch = None;
        self.last_max_congestion_window = 0;
        self.acked_bytes_count = 0;
        self.estimated_tcp_congestion_window = 0;
        self.origin_point_congestion_window = 0;
        self.time_to_origin_point = 0;
        self.last_target_congestion_window = 0;
    }

    pub fn set_num_connections(&mut self, num_connections: u32) {
        self.num_connections = num_connections.max(1);
    }

    pub fn set_max_datagram_size(&mut self, max_datagram_size: u64) {
        self.max_datagram_size = max_datagram_size;
    }

    fn alpha(&self) -> f32 {
        // TCP friendly additive increase for the emulated Reno window.
        let b = self.beta();
        let n = self.num_connections as f32;
        3.0 * n * n * (1.0 - b) / (1.0 + b)
    }

    fn beta(&self) -> f32 {
        let n = self.num_connections as f32;
        (n - 1.0 + BETA) / n
    }

    fn beta_last_max(&self) -> f32 {
        let n = self.num_connections as f32;
        (n - 1.0 + BETA_LAST_MAX) / n
    }

    fn cube_factor(&self) -> u64 {
        (1u64 << CUBE_SCALE) / CUBE_CONGESTION_WINDOW_SCALE / self.max_datagram_size
    }

    /// Restarts the epoch so time spent app-limited does not count towards
    /// window growth.
    pub fn on_application_limited(&mut self) {
        self.epoch = None;
    }

    pub fn congestion_window_after_packet_loss(&mut self, current_congestion_window: u64) -> u64 {
        if current_congestion_window + self.max_datagram_size < self.last_max_congestion_window {
            // Lost before reaching the previous max, so back off the max further.
            self.last_max_congestion_window =
                (self.beta_last_max() * current_congestion_window as f32) as u64;
        } else {
            self.last_max_congestion_window = current_congestion_window;
        }
        self.epoch = None;
        (current_congestion_window as f32 * self.beta()) as u64
    }

    pub fn congestion_window_after_ack(
        &mut self,
        acked_bytes: u64,
        current_congestion_window: u64,
        delay_min: Duration,
        event_time: Instant,
    ) -> u64 {
        self.acked_bytes_count += acked_bytes;

        let epoch = match self.epoch {
            Some(epoch) => epoch,
            None => {
                // First ack after a loss or app-limited period.
                self.epoch = Some(event_time);
                self.acked_bytes_count = acked_bytes;
                self.estimated_tcp_congestion_window = current_congestion_window;
                if self.last_max_congestion_window <= current_congestion_window {
                    self.time_to_origin_point = 0;
                    self.origin_point_congestion_window = current_congestion_window;
                } else {
                    let distance = self.last_max_congestion_window - current_congestion_window;
                    self.time_to_origin_point =
                        ((self.cube_factor() * distance) as f64).cbrt() as u32;
                    self.origin_point_congestion_window = self.last_max_congestion_window;
                }
                event_time
            }
        };

        // Time since the epoch in 1/1024 second units, projected one min RTT ahead.
        let elapsed_micros = (event_time + delay_min)
            .saturating_duration_since(epoch)
            .as_micros() as i64;
        let elapsed_time = (elapsed_micros << 10) / 1_000_000;

        let offset = (self.time_to_origin_point as i64 - elapsed_time).unsigned_abs();
        let delta_congestion_window = ((CUBE_CONGESTION_WINDOW_SCALE as u128
            * (offset as u128).pow(3)
            * self.max_datagram_size as u128)
            >> CUBE_SCALE) as u64;

        let mut target_congestion_window = if elapsed_time > self.time_to_origin_point as i64 {
            self.origin_point_congestion_window
                .saturating_add(delta_congestion_window)
        } else {
            self.origin_point_congestion_window
                .saturating_sub(delta_congestion_window)
        };
        // Limit growth to half the acked bytes per ack.
        target_congestion_window =
            target_congestion_window.min(current_congestion_window + self.acked_bytes_count / 2);

        if self.estimated_tcp_congestion_window > 0 {
            self.estimated_tcp_congestion_window += (self.acked_bytes_count as f32
                * self.alpha()
                * self.max_datagram_size as f32
                / self.estimated_tcp_congestion_window as f32)
                as u64;
        }
        self.acked_bytes_count = 0;
        self.last_target_congestion_window = target_congestion_window;

        target_congestion_window.max(self.estimated_tcp_congestion_window)
    }
}
