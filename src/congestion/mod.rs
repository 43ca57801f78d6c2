//! Congestion controllers for the QUIC proxy transports.
//!
//! The controllers here are pure state machines driven by send, ack and loss
//! callbacks. They never perform I/O and never fail; degenerate inputs such as
//! a zero RTT produce sentinel values instead. `quinn_adapter` installs any of
//! them into a quinn transport config.

mod bandwidth_sampler;
mod bbr_sender;
mod brutal;
mod cubic;
mod cubic_sender;
mod hybrid_slow_start;
mod pacer;
mod quinn_adapter;
mod windowed_filter;

use std::fmt::Debug;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub use bandwidth_sampler::{BandwidthSample, BandwidthSampler, SendTimeState};
pub use bbr_sender::{BbrMode, BbrSender};
pub use brutal::BrutalSender;
pub use cubic::Cubic;
pub use cubic_sender::CubicSender;
pub use hybrid_slow_start::HybridSlowStart;
pub use pacer::Pacer;
pub use quinn_adapter::{CongestionSwitch, FactoryKind, QuinnController, QuinnControllerFactory};
pub use windowed_filter::{MaxFilter, MinFilter, WindowedFilter};

pub type PacketNumber = u64;

/// Bytes per second.
pub type Bandwidth = u64;

pub const INFINITE_BANDWIDTH: Bandwidth = u64::MAX;

/// Default datagram size used for window computations before the path MTU is known.
pub const INITIAL_MAX_DATAGRAM_SIZE: u64 = 1252;
pub const INITIAL_PACKET_SIZE_IPV4: u64 = 1252;
pub const INITIAL_PACKET_SIZE_IPV6: u64 = 1232;

pub const INITIAL_CONGESTION_WINDOW_PACKETS: u64 = 32;

pub fn initial_packet_size(addr: &std::net::SocketAddr) -> u64 {
    if addr.is_ipv4() {
        INITIAL_PACKET_SIZE_IPV4
    } else {
        INITIAL_PACKET_SIZE_IPV6
    }
}

/// Returns `bytes / delta` in bytes per second, or `INFINITE_BANDWIDTH` when
/// `delta` is zero.
pub fn bandwidth_from_delta(bytes: u64, delta: Duration) -> Bandwidth {
    let nanos = delta.as_nanos();
    if nanos == 0 {
        return INFINITE_BANDWIDTH;
    }
    let bandwidth = (bytes as u128) * 1_000_000_000 / nanos;
    u64::try_from(bandwidth).unwrap_or(INFINITE_BANDWIDTH)
}

/// Number of bytes that `bandwidth` delivers over `delta`.
pub fn bytes_from_bandwidth_and_time(bandwidth: Bandwidth, delta: Duration) -> u64 {
    let bytes = (bandwidth as u128) * delta.as_nanos() / 1_000_000_000;
    u64::try_from(bytes).unwrap_or(u64::MAX)
}

/// RTT statistics supplied by the transport. A zero duration means no sample
/// has been taken yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RttStats {
    pub smoothed_rtt: Duration,
    pub min_rtt: Duration,
    pub latest_rtt: Duration,
}

impl RttStats {
    pub fn new(smoothed_rtt: Duration, min_rtt: Duration, latest_rtt: Duration) -> Self {
        Self {
            smoothed_rtt,
            min_rtt,
            latest_rtt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckedPacket {
    pub packet_number: PacketNumber,
    pub bytes_acked: u64,
    pub receive_time: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LostPacket {
    pub packet_number: PacketNumber,
    pub bytes_lost: u64,
}

/// The callback surface shared by every controller.
pub trait CongestionControl: Send + Sync + Debug {
    fn set_rtt_stats(&mut self, rtt_stats: RttStats);

    /// Returns the earliest time the next packet may be sent, or `None` if it
    /// may be sent immediately.
    fn time_until_send(&self, bytes_in_flight: u64) -> Option<Instant>;

    fn has_pacing_budget(&self, now: Instant) -> bool;

    fn on_packet_sent(
        &mut self,
        sent_time: Instant,
        bytes_in_flight: u64,
        packet_number: PacketNumber,
        bytes: u64,
        is_retransmittable: bool,
    );

    fn can_send(&self, bytes_in_flight: u64) -> bool {
        bytes_in_flight < self.congestion_window()
    }

    fn maybe_exit_slow_start(&mut self);

    /// Called when the sender ran out of data before filling the window.
    fn on_app_limited(&mut self, _bytes_in_flight: u64) {}

    fn on_packet_acked(
        &mut self,
        packet_number: PacketNumber,
        acked_bytes: u64,
        prior_in_flight: u64,
        event_time: Instant,
    );

    fn on_packet_lost(
        &mut self,
        packet_number: PacketNumber,
        lost_bytes: u64,
        prior_in_flight: u64,
        event_time: Instant,
    );

    /// Delivers one batch of acks and losses. Losses are processed before acks.
    fn on_congestion_event(
        &mut self,
        prior_in_flight: u64,
        event_time: Instant,
        acked_packets: &[AckedPacket],
        lost_packets: &[LostPacket],
    ) {
        self.maybe_exit_slow_start();
        for lost in lost_packets {
            self.on_packet_lost(
                lost.packet_number,
                lost.bytes_lost,
                prior_in_flight,
                event_time,
            );
        }
        for acked in acked_packets {
            self.on_packet_acked(
                acked.packet_number,
                acked.bytes_acked,
                prior_in_flight,
                acked.receive_time,
            );
        }
    }

    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool);

    fn set_max_datagram_size(&mut self, size: u64);

    fn congestion_window(&self) -> u64;

    fn in_slow_start(&self) -> bool;

    fn in_recovery(&self) -> bool;

    fn bandwidth_estimate(&self) -> Bandwidth;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CongestionControlKind {
    #[default]
    Cubic,
    #[serde(alias = "reno", alias = "newreno")]
    NewReno,
    Bbr,
}

#[derive(Debug, Clone)]
pub enum CongestionController {
    Cubic(CubicSender),
    Bbr(BbrSender),
    Brutal(BrutalSender),
}

impl CongestionController {
    pub fn new(kind: CongestionControlKind, max_datagram_size: u64, now: Instant) -> Self {
        match kind {
            CongestionControlKind::Cubic => {
                CongestionController::Cubic(CubicSender::new(max_datagram_size, false))
            }
            CongestionControlKind::NewReno => {
                CongestionController::Cubic(CubicSender::new(max_datagram_size, true))
            }
            CongestionControlKind::Bbr => CongestionController::Bbr(BbrSender::new(
                max_datagram_size,
                INITIAL_CONGESTION_WINDOW_PACKETS * max_datagram_size,
                bbr_sender::DEFAULT_MAX_CONGESTION_WINDOW_PACKETS * max_datagram_size,
                now,
            )),
        }
    }

    pub fn new_brutal(bps: u64, now: Instant) -> Self {
        CongestionController::Brutal(BrutalSender::new(bps, now))
    }

    fn inner(&self) -> &dyn CongestionControl {
        match self {
            CongestionController::Cubic(c) => c,
            CongestionController::Bbr(b) => b,
            CongestionController::Brutal(b) => b,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn CongestionControl {
        match self {
            CongestionController::Cubic(c) => c,
            CongestionController::Bbr(b) => b,
            CongestionController::Brutal(b) => b,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CongestionController::Cubic(c) if c.is_reno() => "new_reno",
            CongestionController::Cubic(_) => "cubic",
            CongestionController::Bbr(_) => "bbr",
            CongestionController::Brutal(_) => "brutal",
        }
    }
}

impl CongestionControl for CongestionController {
    fn set_rtt_stats(&mut self, rtt_stats: RttStats) {
        self.inner_mut().set_rtt_stats(rtt_stats)
    }

    fn time_until_send(&self, bytes_in_flight: u64) -> Option<Instant> {
        self.inner().time_until_send(bytes_in_flight)
    }

    fn has_pacing_budget(&self, now: Instant) -> bool {
        self.inner().has_pacing_budget(now)
    }

    fn on_packet_sent(
        &mut self,
        sent_time: Instant,
        bytes_in_flight: u64,
        packet_number: PacketNumber,
        bytes: u64,
        is_retransmittable: bool,
    ) {
        self.inner_mut().on_packet_sent(
            sent_time,
            bytes_in_flight,
            packet_number,
            bytes,
            is_retransmittable,
        )
    }

    fn can_send(&self, bytes_in_flight: u64) -> bool {
        self.inner().can_send(bytes_in_flight)
    }

    fn maybe_exit_slow_start(&mut self) {
        self.inner_mut().maybe_exit_slow_start()
    }

    fn on_app_limited(&mut self, bytes_in_flight: u64) {
        self.inner_mut().on_app_limited(bytes_in_flight)
    }

    fn on_packet_acked(
        &mut self,
        packet_number: PacketNumber,
        acked_bytes: u64,
        prior_in_flight: u64,
        event_time: Instant,
    ) {
        self.inner_mut()
            .on_packet_acked(packet_number, acked_bytes, prior_in_flight, event_time)
    }

    fn on_packet_lost(
        &mut self,
        packet_number: PacketNumber,
        lost_bytes: u64,
        prior_in_flight: u64,
        event_time: Instant,
    ) {
        self.inner_mut()
            .on_packet_lost(packet_number, lost_bytes, prior_in_flight, event_time)
    }

    fn on_congestion_event(
        &mut self,
        prior_in_flight: u64,
        event_time: Instant,
        acked_packets: &[AckedPacket],
        lost_packets: &[LostPacket],
    ) {
        self.inner_mut().on_congestion_event(
            prior_in_flight,
            event_time,
            acked_packets,
            lost_packets,
        )
    }

    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool) {
        self.inner_mut()
            .on_retransmission_timeout(packets_retransmitted)
    }

    fn set_max_datagram_size(&mut self, size: u64) {
        self.inner_mut().set_max_datagram_size(size)
    }

    fn congestion_window(&self) -> u64 {
        self.inner().congestion_window()
    }

    fn in_slow_start(&self) -> bool {
        self.inner().in_slow_start()
    }

    fn in_recovery(&self) -> bool {
        self.inner().in_recovery()
    }

    fn bandwidth_estimate(&self) -> Bandwidth {
        self.inner().bandwidth_estimate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bandwidth_from_delta() {
        assert_eq!(
            bandwidth_from_delta(1000, Duration::from_millis(10)),
            100_000
        );
        assert_eq!(bandwidth_from_delta(1000, Duration::ZERO), INFINITE_BANDWIDTH);
        assert_eq!(
            bytes_from_bandwidth_and_time(100_000, Duration::from_millis(10)),
            1000
        );
    }

    #[test]
    fn test_controller_selection() {
        let now = Instant::now();
        let cubic = CongestionController::new(CongestionControlKind::Cubic, 1252, now);
        assert_eq!(cubic.name(), "cubic");
        let reno = CongestionController::new(CongestionControlKind::NewReno, 1252, now);
        assert_eq!(reno.name(), "new_reno");
        let bbr = CongestionController::new(CongestionControlKind::Bbr, 1252, now);
        assert_eq!(bbr.name(), "bbr");
        assert_eq!(bbr.congestion_window(), 32 * 1252);
        let brutal = CongestionController::new_brutal(1_000_000, now);
        assert_eq!(brutal.name(), "brutal");
        assert!(!brutal.in_slow_start());
    }

    #[test]
    fn test_congestion_control_kind_yaml() {
        let kind: CongestionControlKind = serde_yaml::from_str("new_reno").unwrap();
        assert_eq!(kind, CongestionControlKind::NewReno);
        let kind: CongestionControlKind = serde_yaml::from_str("bbr").unwrap();
        assert_eq!(kind, CongestionControlKind::Bbr);
        assert_eq!(CongestionControlKind::default(), CongestionControlKind::Cubic);
    }
}
