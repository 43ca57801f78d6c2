use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::address::NetLocation;
use crate::quic_stream::QuicStream;
use crate::rustls_util::{create_client_config, create_server_config};
use crate::server_handler::{InboundMetadata, ServerHandler};
use crate::udp_session::UdpSession;

#[derive(Debug)]
pub enum Event {
    Stream(InboundMetadata),
    Packet(InboundMetadata, Bytes, NetLocation),
}

/// Echoes every stream and packet back to the client and reports what it saw.
#[derive(Debug)]
pub struct EchoHandler {
    events: mpsc::UnboundedSender<Event>,
}

impl EchoHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (Self { events }, receiver)
    }
}

#[async_trait]
impl ServerHandler for EchoHandler {
    async fn new_connection(
        &self,
        mut stream: QuicStream,
        metadata: InboundMetadata,
    ) -> std::io::Result<()> {
        let _ = self.events.send(Event::Stream(metadata));
        let mut buf = vec![0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            stream.write_all(&buf[..n]).await?;
            stream.flush().await?;
        }
        stream.shutdown().await
    }

    async fn new_packet_connection(
        &self,
        session: UdpSession,
        metadata: InboundMetadata,
    ) -> std::io::Result<()> {
        loop {
            let (data, destination) = session.read_packet().await?;
            let _ = self.events.send(Event::Packet(
                metadata.clone(),
                data.clone(),
                destination.clone(),
            ));
            session.write_packet(data, &destination).await?;
        }
    }
}

pub struct TestTls {
    pub server: rustls::ServerConfig,
    pub client: rustls::ClientConfig,
}

/// A self-signed server config and a client config that trusts it.
pub fn test_tls(alpn: &[&str], early_data: bool) -> TestTls {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let alpn: Vec<String> = alpn.iter().map(|s| s.to_string()).collect();
    let server = create_server_config(
        certified.cert.pem().as_bytes(),
        certified.key_pair.serialize_pem().as_bytes(),
        &alpn,
        early_data,
    )
    .unwrap();
    let client = create_client_config(false, &[], &alpn, early_data).unwrap();
    TestTls { server, client }
}

pub fn localhost(address: SocketAddr) -> NetLocation {
    NetLocation::from_socket_addr(address)
}
