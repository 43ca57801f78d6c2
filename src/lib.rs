//! quictun - TUIC v5 and Hysteria2 proxy transports over QUIC.
//!
//! Both protocols share the same pieces:
//!
//! - [`congestion`]: Cubic, NewReno, BBR and Hysteria2's Brutal controllers
//! - [`tunnel`]: An authenticated QUIC connection and its UDP sessions
//! - [`udp_session`]: Datagram fragmentation, reassembly and session dispatch
//! - [`server_handler`]: Where accepted streams and sessions are delivered
//!
//! [`tuic`] and [`hysteria2`] hold the wire formats plus the client and server
//! managers built on top of them.

pub mod address;
pub mod config;
pub mod congestion;
pub mod direct_handler;
pub mod forward;
pub mod hysteria2;
pub mod quic_stream;
pub mod quic_util;
pub mod rustls_util;
pub mod server_handler;
pub mod tuic;
pub mod tunnel;
pub mod udp_session;
pub mod util;
pub mod uuid_util;
pub mod varint;

#[cfg(test)]
mod test_util;
