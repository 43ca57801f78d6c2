use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use super::{Bandwidth, INFINITE_BANDWIDTH, PacketNumber, bandwidth_from_delta};

/// Connection totals captured when a packet was sent, handed back to the
/// controller once that packet is acked or lost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendTimeState {
    pub is_valid: bool,
    pub is_app_limited: bool,
    pub total_bytes_sent: u64,
    pub total_bytes_acked: u64,
    pub total_bytes_lost: u64,
}

#[derive(Debug, Clone)]
struct ConnectionStateOnSentPacket {
    send_time: Instant,
    size: u64,
    total_bytes_sent_at_last_acked_packet: u64,
    last_acked_packet_sent_time: Option<Instant>,
    last_acked_packet_ack_time: Option<Instant>,
    send_time_state: SendTimeState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandwidthSample {
    /// Zero when no sample could be taken.
    pub bandwidth: Bandwidth,
    /// Zero when no sample could be taken.
    pub rtt: Duration,
    pub state_at_send: SendTimeState,
}

/// Produces one delivery rate sample per acknowledged packet.
///
/// Every sent packet remembers the most recently acked packet at the time it
/// was sent (S0, A0). When it is acked (S1, A1) the sampler computes
///
/// ```text
/// send_rate = (bytes(S1) - bytes(S0)) / (time(S1) - time(S0))
/// ack_rate  = (bytes(A1) - bytes(A0)) / (time(A1) - time(A0))
/// sample    = min(send_rate, ack_rate)
/// ```
///
/// The send rate caps the ack rate so ack compression cannot inflate the
/// estimate. After `on_app_limited` every packet sent is flagged app-limited
/// until a packet sent after that call is acked.
#[derive(Debug, Clone, Default)]
pub struct BandwidthSampler {
    total_bytes_sent: u64,
    total_bytes_acked: u64,
    total_bytes_lost: u64,
    total_bytes_sent_at_last_acked_packet: u64,
    last_acked_packet_sent_time: Option<Instant>,
    last_acked_packet_ack_time: Option<Instant>,
    last_sent_packet: PacketNumber,
    is_app_limited: bool,
    end_of_app_limited_phase: PacketNumber,
    connection_states: FxHashMap<PacketNumber, ConnectionStateOnSentPacket>,
}

impl BandwidthSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_bytes_acked(&self) -> u64 {
        self.total_bytes_acked
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.total_bytes_sent
    }

    pub fn total_bytes_lost(&self) -> u64 {
        self.total_bytes_lost
    }

    pub fn is_app_limited(&self) -> bool {
        self.is_app_limited
    }

    pub fn tracked_packets(&self) -> usize {
        self.connection_states.len()
    }

    pub fn on_packet_sent(
        &mut self,
        sent_time: Instant,
        packet_number: PacketNumber,
        bytes: u64,
        bytes_in_flight: u64,
        is_retransmittable: bool,
    ) {
        self.last_sent_packet = packet_number;

        if !is_retransmittable {
            return;
        }

        self.total_bytes_sent += bytes;

        // With nothing in flight, the start of this transmission serves as the
        // A0 point. Ack compression is not a concern here so the send rate is
        // effectively infinite.
        if bytes_in_flight == 0 {
            self.last_acked_packet_ack_time = Some(sent_time);
            self.total_bytes_sent_at_last_acked_packet = self.total_bytes_sent;
            self.last_acked_packet_sent_time = Some(sent_time);
        }

        self.connection_states.entry(packet_number).or_insert_with(|| {
            ConnectionStateOnSentPacket {
                send_time: sent_time,
                size: bytes,
                total_bytes_sent_at_last_acked_packet: self.total_bytes_sent_at_last_acked_packet,
                last_acked_packet_sent_time: self.last_acked_packet_sent_time,
                last_acked_packet_ack_time: self.last_acked_packet_ack_time,
                send_time_state: SendTimeState {
                    is_valid: true,
                    is_app_limited: self.is_app_limited,
                    total_bytes_sent: self.total_bytes_sent,
                    total_bytes_acked: self.total_bytes_acked,
                    total_bytes_lost: self.total_bytes_lost,
                },
            }
        });
    }

    pub fn on_packet_acked(
        &mut self,
        ack_time: Instant,
        packet_number: PacketNumber,
    ) -> BandwidthSample {
        match self.connection_states.remove(&packet_number) {
            Some(sent_packet) => self.on_packet_acked_inner(ack_time, packet_number, &sent_packet),
            None => BandwidthSample::default(),
        }
    }

    fn on_packet_acked_inner(
        &mut self,
        ack_time: Instant,
        packet_number: PacketNumber,
        sent_packet: &ConnectionStateOnSentPacket,
    ) -> BandwidthSample {
        self.total_bytes_acked += sent_packet.size;
        self.total_bytes_sent_at_last_acked_packet = sent_packet.send_time_state.total_bytes_sent;
        self.last_acked_packet_sent_time = Some(sent_packet.send_time);
        self.last_acked_packet_ack_time = Some(ack_time);

        if self.is_app_limited && packet_number > self.end_of_app_limited_phase {
            self.is_app_limited = false;
        }

        // Nothing had been acked when this packet was sent.
        let (prior_sent_time, prior_ack_time) = match (
            sent_packet.last_acked_packet_sent_time,
            sent_packet.last_acked_packet_ack_time,
        ) {
            (Some(s), Some(a)) => (s, a),
            _ => return BandwidthSample::default(),
        };

        let send_rate = if sent_packet.send_time > prior_sent_time {
            bandwidth_from_delta(
                sent_packet.send_time_state.total_bytes_sent
                    - sent_packet.total_bytes_sent_at_last_acked_packet,
                sent_packet.send_time - prior_sent_time,
            )
        } else {
            INFINITE_BANDWIDTH
        };

        if ack_time <= prior_ack_time {
            return BandwidthSample::default();
        }

        let ack_rate = bandwidth_from_delta(
            self.total_bytes_acked - sent_packet.send_time_state.total_bytes_acked,
            ack_time - prior_ack_time,
        );

        BandwidthSample {
            bandwidth: send_rate.min(ack_rate),
            rtt: ack_time.saturating_duration_since(sent_packet.send_time),
            state_at_send: sent_packet.send_time_state,
        }
    }

    pub fn on_packet_lost(&mut self, packet_number: PacketNumber) -> SendTimeState {
        match self.connection_states.remove(&packet_number) {
            Some(sent_packet) => {
                self.total_bytes_lost += sent_packet.size;
                sent_packet.send_time_state
            }
            None => SendTimeState::default(),
        }
    }

    pub fn on_app_limited(&mut self) {
        self.is_app_limited = true;
        self.end_of_app_limited_phase = self.last_sent_packet;
    }

    /// Forgets packets below `least_unacked` that were neither acked nor lost.
    pub fn remove_obsolete_packets(&mut self, least_unacked: PacketNumber) {
        self.connection_states
            .retain(|packet_number, _| *packet_number >= least_unacked);
    }
}
