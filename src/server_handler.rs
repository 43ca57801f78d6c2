use std::fmt::Debug;
use std::net::SocketAddr;

use async_trait::async_trait;

use crate::address::NetLocation;
use crate::quic_stream::QuicStream;
use crate::udp_session::UdpSession;

/// Where an inbound connection came from and where it wants to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMetadata {
    pub protocol: &'static str,
    pub source: SocketAddr,
    pub destination: NetLocation,
    /// Name of the authenticated user, when the config gives one.
    pub user: Option<String>,
}

/// Receives the streams and UDP sessions a server accepted.
///
/// Each call runs on its own task and owns the stream or session until it
/// returns.
#[async_trait]
pub trait ServerHandler: Send + Sync + Debug {
    async fn new_connection(
        &self,
        stream: QuicStream,
        metadata: InboundMetadata,
    ) -> std::io::Result<()>;

    /// `metadata.destination` is the destination of the session's first
    /// packet; later packets may go elsewhere.
    async fn new_packet_connection(
        &self,
        session: UdpSession,
        metadata: InboundMetadata,
    ) -> std::io::Result<()>;
}
