use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error};
use rustc_hash::FxHashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};

use crate::address::NetLocation;
use crate::quic_stream::QuicStream;
use crate::server_handler::{InboundMetadata, ServerHandler};
use crate::udp_session::UdpSession;
use crate::util::is_closed_error;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_UDP_PACKET_SIZE: usize = 65535;
const MAX_CACHED_LOCATIONS: usize = 256;

/// Connects every request straight to its destination.
#[derive(Debug, Default)]
pub struct DirectHandler;

async fn connect(destination: &NetLocation) -> std::io::Result<TcpStream> {
    let target_addr = destination.resolve().await?;
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(target_addr))
        .await
        .map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("timed out connecting to {destination}"),
            )
        })??;
    if let Err(e) = stream.set_nodelay(true) {
        error!("Failed to set TCP no-delay: {e}");
    }
    Ok(stream)
}

#[async_trait]
impl ServerHandler for DirectHandler {
    async fn new_connection(
        &self,
        mut stream: QuicStream,
        metadata: InboundMetadata,
    ) -> std::io::Result<()> {
        let mut target = match connect(&metadata.destination).await {
            Ok(target) => target,
            Err(e) => {
                debug!(
                    "{} connect to {} failed: {e}",
                    metadata.protocol, metadata.destination
                );
                if let Err(reject_error) = stream.reject(&e.to_string()).await {
                    debug!("failed to reject stream: {reject_error}");
                }
                return Err(e);
            }
        };
        // Sends any pending response frame before the target speaks.
        stream.flush().await?;

        match tokio::io::copy_bidirectional(&mut stream, &mut target).await {
            Ok((sent, received)) => {
                debug!(
                    "{} {} -> {} finished, {sent} bytes up, {received} bytes down",
                    metadata.protocol, metadata.source, metadata.destination
                );
                Ok(())
            }
            Err(e) if is_closed_error(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn new_packet_connection(
        &self,
        session: UdpSession,
        metadata: InboundMetadata,
    ) -> std::io::Result<()> {
        let (socket, dual_stack) = bind_relay_socket().await?;
        let mut relay = UdpRelay {
            socket,
            dual_stack,
            resolved: FxHashMap::default(),
            sources: FxHashMap::default(),
        };

        let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];
        let result: std::io::Result<()> = loop {
            tokio::select! {
                packet = session.read_packet() => {
                    let (data, destination) = match packet {
                        Ok(packet) => packet,
                        Err(e) => break Err(e),
                    };
                    if let Err(e) = relay.send(&data, destination).await {
                        debug!("failed to relay udp packet: {e}");
                    }
                }
                received = relay.socket.recv_from(&mut buf) => {
                    let (len, source) = match received {
                        Ok(received) => received,
                        Err(e) => break Err(e),
                    };
                    let source = relay.source_location(source);
                    let data = Bytes::copy_from_slice(&buf[..len]);
                    if let Err(e) = session.write_packet(data, &source).await {
                        break Err(e);
                    }
                }
            }
        };
        session.close().await;
        match result {
            Err(e) if !is_closed_error(&e) => Err(e),
            _ => Ok(()),
        }
    }
}

/// Binds `[::]:0` so later packets may go to either address family, or
/// `0.0.0.0:0` where IPv6 is unavailable.
async fn bind_relay_socket() -> std::io::Result<(UdpSocket, bool)> {
    match UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0)).await {
        Ok(socket) => Ok((socket, true)),
        Err(e) => {
            debug!("ipv6 udp bind failed, using ipv4: {e}");
            Ok((UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?, false))
        }
    }
}

/// Remembers which names resolved to which addresses so replies carry the
/// location the client asked for.
struct UdpRelay {
    socket: UdpSocket,
    dual_stack: bool,
    resolved: FxHashMap<NetLocation, SocketAddr>,
    sources: FxHashMap<SocketAddr, NetLocation>,
}

impl UdpRelay {
    async fn send(&mut self, data: &Bytes, destination: NetLocation) -> std::io::Result<()> {
        let target_addr = match self.resolved.get(&destination) {
            Some(addr) => *addr,
            None => {
                let addr = destination.resolve().await?;
                if self.resolved.len() >= MAX_CACHED_LOCATIONS {
                    self.resolved.clear();
                    self.sources.clear();
                }
                self.resolved.insert(destination.clone(), addr);
                self.sources.insert(addr, destination);
                addr
            }
        };
        let target_addr = match target_addr {
            SocketAddr::V4(v4) if self.dual_stack => {
                SocketAddr::V6(SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0))
            }
            SocketAddr::V6(v6) if !self.dual_stack => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    format!("no ipv6 socket to reach {v6}"),
                ));
            }
            addr => addr,
        };
        self.socket.send_to(data, target_addr).await?;
        Ok(())
    }

    fn source_location(&self, source: SocketAddr) -> NetLocation {
        let source = match source {
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(ip) => SocketAddr::new(ip.into(), v6.port()),
                None => source,
            },
            source => source,
        };
        self.sources
            .get(&source)
            .cloned()
            .unwrap_or_else(|| NetLocation::from_socket_addr(source))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    use super::*;
    use crate::congestion::CongestionControlKind;
    use crate::test_util::{localhost, test_tls};
    use crate::tuic::{
        DEFAULT_HEARTBEAT, TuicClient, TuicClientSettings, TuicServer, TuicServerSettings,
        TuicUser, UdpRelayMode,
    };
    use crate::uuid_util::parse_uuid;

    const WAIT: Duration = Duration::from_secs(10);

    fn start_tuic() -> (Arc<TuicServer>, TuicClient) {
        let tls = test_tls(&["h3"], false);
        let uuid = parse_uuid("b831381d-6324-4d53-ad4f-8cda48b30811").unwrap();
        let settings = TuicServerSettings::new(vec![TuicUser {
            name: None,
            uuid,
            password: "pass".to_string(),
        }]);
        let server = Arc::new(
            TuicServer::bind(
                "127.0.0.1:0".parse().unwrap(),
                tls.server,
                settings,
                Arc::new(DirectHandler),
            )
            .unwrap(),
        );
        let server_address = server.local_addr().unwrap();
        let running = server.clone();
        tokio::spawn(async move { running.run().await });

        let client = TuicClient::new(
            TuicClientSettings {
                server_address: localhost(server_address),
                sni_hostname: Some("localhost".to_string()),
                uuid,
                password: "pass".to_string(),
                congestion_control: CongestionControlKind::Cubic,
                udp_relay_mode: UdpRelayMode::Native,
                heartbeat: DEFAULT_HEARTBEAT,
                zero_rtt_handshake: false,
                max_packet_size: None,
            },
            tls.client,
        )
        .unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn test_tcp_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = localhost(listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4];
            socket.read_exact(&mut request).await.unwrap();
            assert_eq!(&request, b"ping");
            socket.write_all(b"pong").await.unwrap();
        });

        let (server, client) = start_tuic();
        let mut stream = client.dial_tcp(&target).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();
        let mut response = [0u8; 4];
        timeout(WAIT, stream.read_exact(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&response, b"pong");
        client.close().await;
        server.close();
    }

    #[tokio::test]
    async fn test_relay_socket_reaches_both_families() {
        let v4 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let v4_target = localhost(v4.local_addr().unwrap());
        let (socket, dual_stack) = bind_relay_socket().await.unwrap();
        let mut relay = UdpRelay {
            socket,
            dual_stack,
            resolved: FxHashMap::default(),
            sources: FxHashMap::default(),
        };
        let relay_port = relay.socket.local_addr().unwrap().port();

        relay
            .send(&Bytes::from_static(b"v4"), v4_target.clone())
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let (len, _) = timeout(WAIT, v4.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..len], b"v4");
        v4.send_to(b"back", ("127.0.0.1", relay_port)).await.unwrap();
        let (len, source) = timeout(WAIT, relay.socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"back");
        assert_eq!(relay.source_location(source), v4_target);

        if !dual_stack {
            return;
        }
        let Ok(v6) = UdpSocket::bind("[::1]:0").await else {
            return;
        };
        let v6_target = NetLocation::from_socket_addr(v6.local_addr().unwrap());
        relay
            .send(&Bytes::from_static(b"v6"), v6_target)
            .await
            .unwrap();
        let (len, _) = timeout(WAIT, v6.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..len], b"v6");
    }

    #[tokio::test]
    async fn test_udp_relay() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = localhost(echo.local_addr().unwrap());
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            let (len, source) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..len], source).await.unwrap();
        });

        let (server, client) = start_tuic();
        let session = client.listen_packet().await.unwrap();
        session
            .write_packet(Bytes::from_static(b"query"), &target)
            .await
            .unwrap();
        let (reply, source) = timeout(WAIT, session.read_packet()).await.unwrap().unwrap();
        assert_eq!(&reply[..], b"query");
        assert_eq!(source, target);
        client.close().await;
        server.close();
    }
}
