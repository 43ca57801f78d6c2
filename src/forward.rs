//! Local port forwards relayed through a TUIC or Hysteria2 client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, error, info};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;

use crate::address::NetLocation;
use crate::hysteria2::Hysteria2Client;
use crate::quic_stream::QuicStream;
use crate::tuic::TuicClient;
use crate::udp_session::UdpSession;
use crate::util::is_closed_error;

const UDP_FORWARD_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_UDP_PACKET_SIZE: usize = 65535;

#[async_trait]
pub trait ProxyClient: Send + Sync {
    async fn dial_tcp(&self, destination: &NetLocation) -> std::io::Result<QuicStream>;

    async fn listen_packet(&self) -> std::io::Result<UdpSession>;
}

#[async_trait]
impl ProxyClient for TuicClient {
    async fn dial_tcp(&self, destination: &NetLocation) -> std::io::Result<QuicStream> {
        TuicClient::dial_tcp(self, destination).await
    }

    async fn listen_packet(&self) -> std::io::Result<UdpSession> {
        TuicClient::listen_packet(self).await
    }
}

#[async_trait]
impl ProxyClient for Hysteria2Client {
    async fn dial_tcp(&self, destination: &NetLocation) -> std::io::Result<QuicStream> {
        Hysteria2Client::dial_tcp(self, destination).await
    }

    async fn listen_packet(&self) -> std::io::Result<UdpSession> {
        Hysteria2Client::listen_packet(self).await
    }
}

/// Accepts local TCP connections and relays each one to `target`.
pub async fn start_tcp_forward(
    bind_address: SocketAddr,
    target: NetLocation,
    client: Arc<dyn ProxyClient>,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(bind_address).await?;
    let local_addr = listener.local_addr()?;
    info!("Forwarding tcp {local_addr} to {target}");

    let handle = tokio::spawn(async move {
        loop {
            let (mut local_stream, source) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept failed on {local_addr}: {e}");
                    continue;
                }
            };
            if let Err(e) = local_stream.set_nodelay(true) {
                error!("Failed to set TCP no-delay: {e}");
            }
            let client = client.clone();
            let target = target.clone();
            tokio::spawn(async move {
                let mut remote_stream = match client.dial_tcp(&target).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!("{source} failed to connect to {target}: {e}");
                        return;
                    }
                };
                match tokio::io::copy_bidirectional(&mut local_stream, &mut remote_stream).await {
                    Ok((sent, received)) => {
                        debug!("{source} -> {target} done, {sent} bytes up, {received} bytes down")
                    }
                    Err(e) if is_closed_error(&e) => {}
                    Err(e) => debug!("{source} -> {target} failed: {e}"),
                }
            });
        }
    });
    Ok((local_addr, handle))
}

/// Relays datagrams from each local source through its own proxy session.
pub async fn start_udp_forward(
    bind_address: SocketAddr,
    target: NetLocation,
    client: Arc<dyn ProxyClient>,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let socket = Arc::new(UdpSocket::bind(bind_address).await?);
    let local_addr = socket.local_addr()?;
    info!("Forwarding udp {local_addr} to {target}");

    let handle = tokio::spawn(async move {
        let sessions: Arc<DashMap<SocketAddr, Arc<UdpSession>>> = Arc::new(DashMap::new());
        let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];
        loop {
            let (len, source) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    // Linux reports ICMP unreachable on the next recv.
                    debug!("udp forward recv on {local_addr} failed: {e}");
                    continue;
                }
            };
            let data = Bytes::copy_from_slice(&buf[..len]);

            let existing = sessions
                .get(&source)
                .map(|entry| entry.value().clone())
                .filter(|session| !session.is_closed());
            let session = match existing {
                Some(session) => session,
                None => match client.listen_packet().await {
                    Ok(session) => {
                        let session = Arc::new(session);
                        sessions.insert(source, session.clone());
                        spawn_udp_replies(
                            socket.clone(),
                            source,
                            session.clone(),
                            sessions.clone(),
                        );
                        session
                    }
                    Err(e) => {
                        error!("{source} failed to open udp session: {e}");
                        continue;
                    }
                },
            };

            if let Err(e) = session.write_packet(data, &target).await {
                debug!("{source} udp write to {target} failed: {e}");
                session.close().await;
                sessions.remove_if(&source, |_, current| Arc::ptr_eq(current, &session));
            }
        }
    });
    Ok((local_addr, handle))
}

fn spawn_udp_replies(
    socket: Arc<UdpSocket>,
    source: SocketAddr,
    session: Arc<UdpSession>,
    sessions: Arc<DashMap<SocketAddr, Arc<UdpSession>>>,
) {
    tokio::spawn(async move {
        loop {
            let (data, _) =
                match tokio::time::timeout(UDP_FORWARD_IDLE_TIMEOUT, session.read_packet()).await {
                    Ok(Ok(packet)) => packet,
                    Ok(Err(e)) => {
                        debug!("{source} udp session ended: {e}");
                        break;
                    }
                    Err(_) => {
                        debug!("{source} udp session idle, closing");
                        break;
                    }
                };
            if let Err(e) = socket.send_to(&data, source).await {
                debug!("{source} udp reply failed: {e}");
                break;
            }
        }
        session.close().await;
        sessions.remove_if(&source, |_, current| Arc::ptr_eq(current, &session));
    });
}
