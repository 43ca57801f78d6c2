use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::io::AsyncWriteExt;

use super::UdpRelayMode;
use super::protocol::{Command, MAX_PACKET_DATA_LEN, MAX_SESSION_ID, TuicCodec, auth_token};
use crate::address::NetLocation;
use crate::congestion::{CongestionControlKind, QuinnControllerFactory};
use crate::quic_stream::QuicStream;
use crate::quic_util::{CLIENT_IDLE_TIMEOUT, client_config, client_endpoint, transport_config};
use crate::tunnel::Tunnel;
use crate::udp_session::{DatagramChannel, Dispatch, PacketOutbound, SessionTable, UdpMessage, UdpSession};
use crate::util::connection_error;
use crate::uuid_util::Uuid;

#[derive(Debug, Clone)]
pub struct TuicClientSettings {
    pub server_address: NetLocation,
    pub sni_hostname: Option<String>,
    pub uuid: Uuid,
    pub password: String,
    pub congestion_control: CongestionControlKind,
    pub udp_relay_mode: UdpRelayMode,
    pub heartbeat: Duration,
    pub zero_rtt_handshake: bool,
    pub max_packet_size: Option<usize>,
}

/// Sends a session's packets as datagrams or one uni stream per packet.
#[derive(Debug)]
pub(crate) struct TuicPacketOutbound {
    connection: quinn::Connection,
    relay_mode: UdpRelayMode,
    datagrams: DatagramChannel<TuicCodec>,
    send_dissociate: bool,
}

impl TuicPacketOutbound {
    pub(crate) fn new(
        connection: quinn::Connection,
        relay_mode: UdpRelayMode,
        max_packet_size: Option<usize>,
        send_dissociate: bool,
    ) -> Self {
        Self {
            datagrams: DatagramChannel::new(connection.clone(), TuicCodec, max_packet_size),
            connection,
            relay_mode,
            send_dissociate,
        }
    }

    async fn send_on_stream(&self, command: Command) -> std::io::Result<()> {
        let mut send_stream = self.connection.open_uni().await.map_err(connection_error)?;
        send_stream.write_all(&command.to_bytes()?).await?;
        send_stream.finish().map_err(std::io::Error::other)?;
        Ok(())
    }
}

#[async_trait]
impl PacketOutbound for TuicPacketOutbound {
    async fn send_message(&self, message: UdpMessage) -> std::io::Result<()> {
        if message.data.len() > MAX_PACKET_DATA_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("udp packet of {} bytes is too large", message.data.len()),
            ));
        }
        match self.relay_mode {
            UdpRelayMode::Native => self.datagrams.send(message),
            UdpRelayMode::Quic => self.send_on_stream(Command::Packet(message)).await,
        }
    }

    async fn dissociate(&self, session_id: u32) -> std::io::Result<()> {
        if !self.send_dissociate {
            return Ok(());
        }
        self.send_on_stream(Command::Dissociate {
            session_id: session_id as u16,
        })
        .await
    }
}

/// Routes packets the server sent back to their sessions.
pub(crate) fn dispatch_to_client(tunnel: &Tunnel, command: Command) {
    match command {
        Command::Packet(message) => {
            if let Dispatch::Unknown(message) = tunnel.sessions().dispatch(message) {
                debug!("dropping packet for unknown session {}", message.session_id);
            }
        }
        Command::Dissociate { session_id } => {
            tunnel.sessions().remove(session_id as u32);
        }
        Command::Heartbeat => {}
        other => debug!("ignoring unexpected {} command from server", other.name()),
    }
}

#[derive(Debug)]
struct TuicClientConnection {
    tunnel: Arc<Tunnel>,
    outbound: Arc<TuicPacketOutbound>,
    // Keeps the socket alive for as long as the connection.
    _endpoint: quinn::Endpoint,
}

/// Keeps one authenticated connection to a TUIC server and opens TCP streams
/// and UDP sessions on it, reconnecting once it closes.
#[derive(Debug)]
pub struct TuicClient {
    settings: Arc<TuicClientSettings>,
    quic_config: quinn::ClientConfig,
    connection: tokio::sync::Mutex<Option<Arc<TuicClientConnection>>>,
}

impl TuicClient {
    pub fn new(
        settings: TuicClientSettings,
        tls_config: rustls::ClientConfig,
    ) -> std::io::Result<Self> {
        let transport = transport_config(
            QuinnControllerFactory::new(settings.congestion_control).into_arc(),
            CLIENT_IDLE_TIMEOUT,
        )?;
        let quic_config = client_config(tls_config, transport)?;
        Ok(Self {
            settings: Arc::new(settings),
            quic_config,
            connection: tokio::sync::Mutex::new(None),
        })
    }

    async fn connection(&self) -> std::io::Result<Arc<TuicClientConnection>> {
        let mut current = self.connection.lock().await;
        if let Some(connection) = current.as_ref()
            && !connection.tunnel.is_closed()
        {
            return Ok(connection.clone());
        }
        let connection = Arc::new(self.connect().await?);
        *current = Some(connection.clone());
        Ok(connection)
    }

    async fn connect(&self) -> std::io::Result<TuicClientConnection> {
        let server_address: SocketAddr = self.settings.server_address.resolve().await?;
        let server_host = self.settings.server_address.address().to_string();
        let server_name = self.settings.sni_hostname.as_deref().unwrap_or(&server_host);

        let endpoint = client_endpoint(server_address)?;
        let connecting = endpoint
            .connect_with(self.quic_config.clone(), server_address, server_name)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        let (connection, handshake) = if self.settings.zero_rtt_handshake {
            match connecting.into_0rtt() {
                Ok((connection, accepted)) => (connection, Some(accepted)),
                Err(connecting) => (connecting.await.map_err(connection_error)?, None),
            }
        } else {
            (connecting.await.map_err(connection_error)?, None)
        };
        debug!("tuic connection established to {server_address}");

        let sessions = SessionTable::new(MAX_SESSION_ID);
        let tunnel = Tunnel::new("tuic", connection.clone(), sessions);
        tunnel.watch_connection();

        let settings = self.settings.clone();
        match handshake {
            Some(accepted) => {
                // The auth token comes from the finished handshake.
                let auth_connection = connection.clone();
                tunnel.spawn(async move {
                    accepted.await;
                    authenticate(&auth_connection, &settings).await
                });
            }
            None => {
                if let Err(e) = authenticate(&connection, &settings).await {
                    tunnel.close_with_error(std::io::Error::new(e.kind(), e.to_string()));
                    return Err(e);
                }
            }
        }

        let outbound = Arc::new(TuicPacketOutbound::new(
            connection.clone(),
            self.settings.udp_relay_mode,
            self.settings.max_packet_size,
            true,
        ));

        spawn_heartbeat(&tunnel, self.settings.heartbeat);
        spawn_datagram_loop(&tunnel);
        spawn_uni_stream_loop(&tunnel);

        Ok(TuicClientConnection {
            tunnel,
            outbound,
            _endpoint: endpoint,
        })
    }

    /// Opens a TCP stream to `destination` through the server.
    pub async fn dial_tcp(&self, destination: &NetLocation) -> std::io::Result<QuicStream> {
        let connection = self.connection().await?;
        let tunnel = &connection.tunnel;
        let (mut send_stream, recv_stream) = match tunnel.connection().open_bi().await {
            Ok(streams) => streams,
            Err(e) => {
                let error = connection_error(e);
                tunnel.close_with_error(std::io::Error::new(error.kind(), error.to_string()));
                return Err(error);
            }
        };
        let request = Command::Connect {
            destination: destination.clone(),
        }
        .to_bytes()?;
        send_stream.write_all(&request).await?;
        Ok(QuicStream::from(send_stream, recv_stream))
    }

    /// Starts a UDP session relayed through the server.
    pub async fn listen_packet(&self) -> std::io::Result<UdpSession> {
        let connection = self.connection().await?;
        let sessions = connection.tunnel.sessions();
        let session_id = sessions.allocate_id()?;
        Ok(sessions.register(session_id, connection.outbound.clone()))
    }

    pub async fn close(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            connection.tunnel.close();
        }
    }
}

async fn authenticate(
    connection: &quinn::Connection,
    settings: &TuicClientSettings,
) -> std::io::Result<()> {
    let token = auth_token(connection, &settings.uuid, settings.password.as_bytes())?;
    let command = Command::Authenticate {
        uuid: settings.uuid,
        token,
    };
    let mut send_stream = connection.open_uni().await.map_err(connection_error)?;
    send_stream.write_all(&command.to_bytes()?).await?;
    send_stream.finish().map_err(std::io::Error::other)?;
    info!("tuic authenticated to {}", connection.remote_address());
    Ok(())
}

pub(crate) fn spawn_heartbeat(tunnel: &Arc<Tunnel>, period: Duration) {
    let connection = tunnel.connection().clone();
    tunnel.spawn(async move {
        let heartbeat = Command::Heartbeat.to_bytes()?;
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            match connection.send_datagram(heartbeat.clone()) {
                Ok(()) => {}
                Err(quinn::SendDatagramError::ConnectionLost(e)) => {
                    return Err(connection_error(e));
                }
                Err(e) => debug!("failed to send heartbeat: {e}"),
            }
        }
    });
}

fn spawn_datagram_loop(tunnel: &Arc<Tunnel>) {
    let task_tunnel = tunnel.clone();
    tunnel.spawn(async move {
        loop {
            let datagram = task_tunnel
                .connection()
                .read_datagram()
                .await
                .map_err(connection_error)?;
            match Command::decode(datagram) {
                Ok(command) => dispatch_to_client(&task_tunnel, command),
                Err(e) => debug!("dropping invalid datagram: {e}"),
            }
        }
    });
}

fn spawn_uni_stream_loop(tunnel: &Arc<Tunnel>) {
    let task_tunnel = tunnel.clone();
    tunnel.spawn(async move {
        loop {
            let mut recv_stream = task_tunnel
                .connection()
                .accept_uni()
                .await
                .map_err(connection_error)?;
            let stream_tunnel = task_tunnel.clone();
            tokio::spawn(async move {
                match Command::read_from(&mut recv_stream).await {
                    Ok(command) => dispatch_to_client(&stream_tunnel, command),
                    Err(e) => debug!("dropping invalid stream: {e}"),
                }
            });
        }
    });
}
