use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use quinn::congestion::{Controller, ControllerFactory};
use quinn_proto::RttEstimator;

use super::{
    AckedPacket, Bandwidth, CongestionControl, CongestionControlKind, CongestionController,
    LostPacket, PacketNumber, RttStats,
};

// Bounds the bookkeeping for packets quinn never reports back.
const MAX_TRACKED_PACKETS: usize = 1 << 16;

#[derive(Debug, Clone, Copy)]
struct SentPacket {
    packet_number: PacketNumber,
    sent_time: Instant,
    bytes: u64,
}

/// Drives a `CongestionController` from quinn's congestion callbacks.
///
/// quinn reports acks one packet at a time keyed by send time and closes each
/// batch with `on_end_acks`. The adapter maps send times back to packet
/// numbers and replays every batch as a single congestion event. quinn paces
/// on its own, so only the window is consulted.
#[derive(Debug, Clone)]
pub struct QuinnController {
    inner: CongestionController,
    switch: Option<(Arc<CongestionSwitch>, u64)>,
    max_datagram_size: u64,
    initial_window: u64,
    bytes_in_flight: u64,
    sent_packets: VecDeque<SentPacket>,
    // Packet number is None when the send record was already gone.
    pending_acks: Vec<(Option<PacketNumber>, u64)>,
}

impl QuinnController {
    pub fn new(inner: CongestionController, max_datagram_size: u64) -> Self {
        let initial_window = inner.congestion_window();
        Self {
            inner,
            switch: None,
            max_datagram_size,
            initial_window,
            bytes_in_flight: 0,
            sent_packets: VecDeque::new(),
            pending_acks: vec![],
        }
    }

    pub fn inner(&self) -> &CongestionController {
        &self.inner
    }

    fn with_switch(mut self, switch: Arc<CongestionSwitch>) -> Self {
        let generation = switch.generation();
        self.switch = Some((switch, generation));
        self
    }

    fn maybe_switch(&mut self, now: Instant) {
        let Some((switch, seen)) = self.switch.as_mut() else {
            return;
        };
        let generation = switch.generation();
        if generation == *seen {
            return;
        }
        *seen = generation;
        if let Some(kind) = switch.target() {
            log::debug!("switching congestion control to {kind:?}");
            self.inner = kind.build(now, self.max_datagram_size);
        }
    }

    fn record_sent(&mut self, now: Instant, bytes: u64, packet_number: PacketNumber) {
        self.maybe_switch(now);
        if self.sent_packets.len() >= MAX_TRACKED_PACKETS {
            self.sent_packets.pop_front();
        }
        self.sent_packets.push_back(SentPacket {
            packet_number,
            sent_time: now,
            bytes,
        });
        self.inner
            .on_packet_sent(now, self.bytes_in_flight, packet_number, bytes, true);
        self.bytes_in_flight += bytes;
    }

    fn record_ack(&mut self, sent: Instant, bytes: u64, rtt_stats: RttStats) {
        self.inner.set_rtt_stats(rtt_stats);
        let packet_number = self
            .sent_packets
            .iter()
            .position(|p| p.sent_time == sent && p.bytes == bytes)
            .or_else(|| self.sent_packets.iter().position(|p| p.sent_time == sent))
            .and_then(|index| self.sent_packets.remove(index))
            .map(|p| p.packet_number);
        self.pending_acks.push((packet_number, bytes));
    }

    fn finish_acks(
        &mut self,
        now: Instant,
        in_flight: u64,
        app_limited: bool,
        largest_packet_num_acked: Option<PacketNumber>,
    ) {
        if self.pending_acks.is_empty() {
            return;
        }

        let mut acked = Vec::with_capacity(self.pending_acks.len());
        for (packet_number, bytes) in self.pending_acks.drain(..) {
            let packet_number = match packet_number.or(largest_packet_num_acked) {
                Some(packet_number) => packet_number,
                None => continue,
            };
            acked.push(AckedPacket {
                packet_number,
                bytes_acked: bytes,
                receive_time: now,
            });
        }
        acked.sort_by_key(|p| p.packet_number);

        let acked_bytes: u64 = acked.iter().map(|p| p.bytes_acked).sum();
        let prior_in_flight = in_flight + acked_bytes;
        self.inner
            .on_congestion_event(prior_in_flight, now, &acked, &[]);
        self.bytes_in_flight = in_flight;

        if app_limited {
            self.inner.on_app_limited(in_flight);
        }
    }

    fn record_loss(
        &mut self,
        now: Instant,
        sent: Instant,
        is_persistent_congestion: bool,
        lost_bytes: u64,
    ) {
        let mut lost = vec![];
        while let Some(packet) = self.sent_packets.front() {
            if packet.sent_time > sent {
                break;
            }
            lost.push(LostPacket {
                packet_number: packet.packet_number,
                bytes_lost: packet.bytes,
            });
            self.sent_packets.pop_front();
        }
        if lost.is_empty() {
            let packet_number = self
                .sent_packets
                .front()
                .map(|p| p.packet_number.saturating_sub(1))
                .unwrap_or_default();
            lost.push(LostPacket {
                packet_number,
                bytes_lost: lost_bytes,
            });
        }

        let prior_in_flight = self.bytes_in_flight;
        self.inner
            .on_congestion_event(prior_in_flight, now, &[], &lost);
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(lost_bytes);

        if is_persistent_congestion {
            self.inner.on_retransmission_timeout(true);
        }
    }
}

impl Controller for QuinnController {
    fn on_sent(&mut self, now: Instant, bytes: u64, last_packet_number: u64) {
        self.record_sent(now, bytes, last_packet_number);
    }

    fn on_ack(
        &mut self,
        now: Instant,
        sent: Instant,
        bytes: u64,
        _app_limited: bool,
        rtt: &RttEstimator,
    ) {
        let rtt_stats = RttStats::new(
            rtt.get(),
            rtt.min(),
            now.saturating_duration_since(sent),
        );
        self.record_ack(sent, bytes, rtt_stats);
    }

    fn on_end_acks(
        &mut self,
        now: Instant,
        in_flight: u64,
        app_limited: bool,
        largest_packet_num_acked: Option<u64>,
    ) {
        self.finish_acks(now, in_flight, app_limited, largest_packet_num_acked);
    }

    fn on_congestion_event(
        &mut self,
        now: Instant,
        sent: Instant,
        is_persistent_congestion: bool,
        lost_bytes: u64,
    ) {
        self.record_loss(now, sent, is_persistent_congestion, lost_bytes);
    }

    fn on_mtu_update(&mut self, new_mtu: u16) {
        self.max_datagram_size = new_mtu as u64;
        self.inner.set_max_datagram_size(new_mtu as u64);
    }

    fn window(&self) -> u64 {
        self.inner.congestion_window()
    }

    fn clone_box(&self) -> Box<dyn Controller> {
        Box::new(self.clone())
    }

    fn initial_window(&self) -> u64 {
        self.initial_window
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactoryKind {
    Standard(CongestionControlKind),
    Brutal(Bandwidth),
}

impl FactoryKind {
    fn build(self, now: Instant, max_datagram_size: u64) -> CongestionController {
        match self {
            FactoryKind::Standard(kind) => CongestionController::new(kind, max_datagram_size, now),
            FactoryKind::Brutal(bps) => {
                let mut brutal = CongestionController::new_brutal(bps, now);
                brutal.set_max_datagram_size(max_datagram_size);
                brutal
            }
        }
    }
}

/// Lets one connection replace its controller once the handshake settled
/// which one to use.
#[derive(Debug, Default)]
pub struct CongestionSwitch {
    generation: AtomicU64,
    target: Mutex<Option<FactoryKind>>,
}

impl CongestionSwitch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_brutal(&self, bps: Bandwidth) {
        self.set(FactoryKind::Brutal(bps));
    }

    pub fn set_standard(&self, kind: CongestionControlKind) {
        self.set(FactoryKind::Standard(kind));
    }

    fn set(&self, kind: FactoryKind) {
        *self.target.lock() = Some(kind);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn target(&self) -> Option<FactoryKind> {
        *self.target.lock()
    }
}

/// Builds a fresh controller for every quinn connection.
#[derive(Debug, Clone)]
pub struct QuinnControllerFactory {
    kind: FactoryKind,
    switch: Option<Arc<CongestionSwitch>>,
}

impl QuinnControllerFactory {
    pub fn new(kind: CongestionControlKind) -> Self {
        Self {
            kind: FactoryKind::Standard(kind),
            switch: None,
        }
    }

    /// A Brutal controller sending at `bps` bytes per second.
    pub fn brutal(bps: Bandwidth) -> Self {
        Self {
            kind: FactoryKind::Brutal(bps),
            switch: None,
        }
    }

    /// Starts with `kind` and follows later changes made through `switch`.
    /// Meant for a transport config that serves a single connection.
    pub fn switchable(kind: CongestionControlKind, switch: Arc<CongestionSwitch>) -> Self {
        Self {
            kind: FactoryKind::Standard(kind),
            switch: Some(switch),
        }
    }

    pub fn into_arc(self) -> Arc<dyn ControllerFactory + Send + Sync> {
        Arc::new(self)
    }

    fn build_controller(&self, now: Instant, current_mtu: u16) -> QuinnController {
        let max_datagram_size = current_mtu as u64;
        let controller = QuinnController::new(self.kind.build(now, max_datagram_size), max_datagram_size);
        match self.switch.as_ref() {
            Some(switch) => controller.with_switch(switch.clone()),
            None => controller,
        }
    }
}

impl ControllerFactory for QuinnControllerFactory {
    fn build(self: Arc<Self>, now: Instant, current_mtu: u16) -> Box<dyn Controller> {
        Box::new(self.build_controller(now, current_mtu))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const MTU: u16 = 1200;

    fn rtt(ms: u64) -> RttStats {
        let rtt = Duration::from_millis(ms);
        RttStats::new(rtt, rtt, rtt)
    }

    #[test]
    fn test_factory_builds_requested_controller() {
        let now = Instant::now();
        let cubic = QuinnControllerFactory::new(CongestionControlKind::Cubic).build_controller(now, MTU);
        assert_eq!(cubic.inner().name(), "cubic");
        assert_eq!(cubic.window(), 32 * MTU as u64);
        assert_eq!(cubic.initial_window(), cubic.window());

        let bbr = QuinnControllerFactory::new(CongestionControlKind::Bbr).build_controller(now, MTU);
        assert_eq!(bbr.inner().name(), "bbr");

        let brutal = QuinnControllerFactory::brutal(125_000).build_controller(now, MTU);
        assert_eq!(brutal.inner().name(), "brutal");
        assert_eq!(brutal.window(), 10240);
    }

    #[test]
    fn test_ack_batch_grows_window() {
        let start = Instant::now();
        let mut controller =
            QuinnControllerFactory::new(CongestionControlKind::Cubic).build_controller(start, MTU);
        let initial = controller.window();

        let mut in_flight = 0;
        for packet_number in 0..32 {
            controller.record_sent(start, MTU as u64, packet_number);
            in_flight += MTU as u64;
        }
        let now = start + Duration::from_millis(50);
        for _ in 0..10 {
            controller.record_ack(start, MTU as u64, rtt(50));
            in_flight -= MTU as u64;
        }
        controller.finish_acks(now, in_flight, false, Some(9));

        assert!(controller.window() > initial);
        assert_eq!(controller.sent_packets.len(), 22);
        assert!(controller.pending_acks.is_empty());
        assert_eq!(controller.bytes_in_flight, in_flight);
    }

    #[test]
    fn test_loss_removes_older_packets() {
        let start = Instant::now();
        let mut controller =
            QuinnControllerFactory::new(CongestionControlKind::Cubic).build_controller(start, MTU);
        let initial = controller.window();

        for packet_number in 0..10u64 {
            let sent = start + Duration::from_millis(packet_number);
            controller.record_sent(sent, MTU as u64, packet_number);
        }
        let lost_sent = start + Duration::from_millis(2);
        controller.record_loss(
            start + Duration::from_millis(100),
            lost_sent,
            false,
            3 * MTU as u64,
        );
        assert_eq!(controller.sent_packets.len(), 7);
        assert_eq!(controller.bytes_in_flight, 7 * MTU as u64);
        assert!(controller.window() < initial);
    }

    #[test]
    fn test_persistent_congestion_collapses_window() {
        let start = Instant::now();
        let mut controller =
            QuinnControllerFactory::new(CongestionControlKind::NewReno).build_controller(start, MTU);
        controller.record_sent(start, MTU as u64, 0);
        controller.record_loss(start + Duration::from_secs(1), start, true, MTU as u64);
        assert_eq!(controller.window(), 2 * MTU as u64);
    }

    #[test]
    fn test_switch_replaces_controller() {
        let start = Instant::now();
        let switch = CongestionSwitch::new();
        let mut controller =
            QuinnControllerFactory::switchable(CongestionControlKind::Bbr, switch.clone())
                .build_controller(start, MTU);
        assert_eq!(controller.inner().name(), "bbr");

        controller.record_sent(start, MTU as u64, 0);
        assert_eq!(controller.inner().name(), "bbr");

        switch.set_brutal(125_000);
        controller.record_sent(start, MTU as u64, 1);
        assert_eq!(controller.inner().name(), "brutal");
        assert_eq!(controller.bytes_in_flight, 2 * MTU as u64);
    }

    #[test]
    fn test_mtu_update() {
        let start = Instant::now();
        let mut controller =
            QuinnControllerFactory::new(CongestionControlKind::Bbr).build_controller(start, MTU);
        controller.on_mtu_update(1400);
        assert!(controller.window() >= 4 * 1400);
    }
}
