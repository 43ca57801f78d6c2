use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use log::{debug, error, info};
use rustc_hash::FxHashMap;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;

use super::client::{TuicPacketOutbound, spawn_heartbeat};
use super::protocol::{Command, MAX_SESSION_ID, auth_token};
use super::{DEFAULT_AUTH_TIMEOUT, DEFAULT_HEARTBEAT, DEFAULT_UDP_TIMEOUT, UdpRelayMode};
use crate::address::NetLocation;
use crate::congestion::{CongestionControlKind, QuinnControllerFactory};
use crate::quic_stream::QuicStream;
use crate::quic_util::{SERVER_IDLE_TIMEOUT, server_config, server_crypto, transport_config};
use crate::server_handler::{InboundMetadata, ServerHandler};
use crate::tunnel::Tunnel;
use crate::udp_session::{PacketOutbound, SessionTable, UdpMessage};
use crate::util::connection_error;
use crate::uuid_util::{Uuid, format_uuid};

#[derive(Debug, Clone)]
pub struct TuicUser {
    pub name: Option<String>,
    pub uuid: Uuid,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct TuicServerSettings {
    pub users: Vec<TuicUser>,
    pub congestion_control: CongestionControlKind,
    pub auth_timeout: Duration,
    pub heartbeat: Duration,
    pub zero_rtt_handshake: bool,
    pub udp_timeout: Duration,
    pub max_packet_size: Option<usize>,
}

impl TuicServerSettings {
    pub fn new(users: Vec<TuicUser>) -> Self {
        Self {
            users,
            congestion_control: CongestionControlKind::default(),
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            heartbeat: DEFAULT_HEARTBEAT,
            zero_rtt_handshake: false,
            udp_timeout: DEFAULT_UDP_TIMEOUT,
            max_packet_size: None,
        }
    }
}

#[derive(Debug)]
struct ServerState {
    settings: TuicServerSettings,
    users: FxHashMap<Uuid, TuicUser>,
    handler: Arc<dyn ServerHandler>,
}

/// Accepts TUIC connections on one UDP socket.
#[derive(Debug)]
pub struct TuicServer {
    endpoint: quinn::Endpoint,
    state: Arc<ServerState>,
}

impl TuicServer {
    pub fn bind(
        address: SocketAddr,
        tls_config: rustls::ServerConfig,
        settings: TuicServerSettings,
        handler: Arc<dyn ServerHandler>,
    ) -> std::io::Result<Self> {
        if settings.users.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tuic server needs at least one user",
            ));
        }
        let mut users = FxHashMap::default();
        for user in settings.users.iter() {
            if users.insert(user.uuid, user.clone()).is_some() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("duplicate tuic user uuid {}", format_uuid(&user.uuid)),
                ));
            }
        }

        let transport = transport_config(
            QuinnControllerFactory::new(settings.congestion_control).into_arc(),
            SERVER_IDLE_TIMEOUT,
        )?;
        let config = server_config(server_crypto(Arc::new(tls_config))?, transport);
        let endpoint = quinn::Endpoint::server(config, address)?;

        Ok(Self {
            endpoint,
            state: Arc::new(ServerState {
                settings,
                users,
                handler,
            }),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Accepts connections until the endpoint is closed.
    pub async fn run(&self) -> std::io::Result<()> {
        info!("tuic server listening on {}", self.local_addr()?);
        while let Some(incoming) = self.endpoint.accept().await {
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = process_connection(state, incoming).await {
                    debug!("tuic connection failed: {e}");
                }
            });
        }
        Ok(())
    }

    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"server closed");
    }
}

#[derive(Debug)]
struct ServerConnection {
    tunnel: Arc<Tunnel>,
    state: Arc<ServerState>,
    handshake_done: CancellationToken,
    auth_done: CancellationToken,
    user: OnceLock<Option<String>>,
}

impl ServerConnection {
    fn remote_address(&self) -> SocketAddr {
        self.tunnel.connection().remote_address()
    }

    /// Waits for authentication, failing if the connection closes first.
    async fn authenticated(&self) -> std::io::Result<()> {
        tokio::select! {
            biased;
            _ = self.auth_done.cancelled() => Ok(()),
            _ = self.tunnel.cancel_token().cancelled() => Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "connection closed before authentication",
            )),
        }
    }

    async fn authenticate(&self, uuid: Uuid, token: [u8; 32]) -> std::io::Result<()> {
        self.handshake_done.cancelled().await;
        if self.auth_done.is_cancelled() {
            debug!(
                "ignoring repeated authentication from {}",
                self.remote_address()
            );
            return Ok(());
        }
        let Some(user) = self.state.users.get(&uuid) else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("unknown user {}", format_uuid(&uuid)),
            ));
        };
        let expected = auth_token(self.tunnel.connection(), &uuid, user.password.as_bytes())?;
        if !bool::from(expected.ct_eq(&token)) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("invalid token for user {}", format_uuid(&uuid)),
            ));
        }
        if self.user.set(user.name.clone()).is_ok() {
            info!(
                "tuic user {} authenticated from {}",
                user.name.as_deref().unwrap_or("<unnamed>"),
                self.remote_address()
            );
            self.auth_done.cancel();
        }
        Ok(())
    }

    fn metadata(&self, destination: NetLocation) -> InboundMetadata {
        InboundMetadata {
            protocol: "tuic",
            source: self.remote_address(),
            destination,
            user: self.user.get().cloned().flatten(),
        }
    }

    fn handle_packet(&self, message: UdpMessage, relay_mode: UdpRelayMode) {
        let connection = self.tunnel.connection().clone();
        let max_packet_size = self.state.settings.max_packet_size;
        let created = self.tunnel.dispatch_or_create(message, move || -> Arc<dyn PacketOutbound> {
            Arc::new(TuicPacketOutbound::new(
                connection,
                relay_mode,
                max_packet_size,
                false,
            ))
        });
        let Some((session, destination)) = created else {
            return;
        };
        debug!(
            "new udp session {} from {} ({relay_mode:?})",
            session.session_id(),
            self.remote_address()
        );
        let handler = self.state.handler.clone();
        let metadata = self.metadata(destination);
        tokio::spawn(async move {
            if let Err(e) = handler.new_packet_connection(session, metadata).await {
                debug!("udp session handler ended: {e}");
            }
        });
    }

    /// Handles a command that arrived on a uni stream or as a datagram.
    async fn handle_command(
        &self,
        command: Command,
        relay_mode: UdpRelayMode,
    ) -> std::io::Result<()> {
        match command {
            Command::Authenticate { uuid, token } => {
                if let Err(e) = self.authenticate(uuid, token).await {
                    self.tunnel.close_with_error(e);
                }
                Ok(())
            }
            Command::Packet(message) => {
                self.authenticated().await?;
                self.handle_packet(message, relay_mode);
                Ok(())
            }
            Command::Dissociate { session_id } => {
                self.authenticated().await?;
                if self.tunnel.sessions().remove(session_id as u32) {
                    debug!("udp session {session_id} dissociated");
                }
                Ok(())
            }
            Command::Heartbeat => Ok(()),
            Command::Connect { .. } => {
                debug!("ignoring connect outside a bidirectional stream");
                Ok(())
            }
        }
    }
}

async fn process_connection(
    state: Arc<ServerState>,
    incoming: quinn::Incoming,
) -> std::io::Result<()> {
    let connecting = incoming.accept().map_err(connection_error)?;
    let handshake_done = CancellationToken::new();
    let connection = if state.settings.zero_rtt_handshake {
        match connecting.into_0rtt() {
            Ok((connection, accepted)) => {
                let handshake_done = handshake_done.clone();
                tokio::spawn(async move {
                    accepted.await;
                    handshake_done.cancel();
                });
                connection
            }
            Err(connecting) => {
                let connection = connecting.await.map_err(connection_error)?;
                handshake_done.cancel();
                connection
            }
        }
    } else {
        let connection = connecting.await.map_err(connection_error)?;
        handshake_done.cancel();
        connection
    };
    debug!("tuic connection from {}", connection.remote_address());

    let tunnel = Tunnel::new("tuic", connection, SessionTable::new(MAX_SESSION_ID));
    tunnel.watch_connection();
    tunnel
        .sessions()
        .spawn_idle_sweeper(state.settings.udp_timeout, tunnel.cancel_token().clone());

    let server_connection = Arc::new(ServerConnection {
        tunnel: tunnel.clone(),
        state: state.clone(),
        handshake_done,
        auth_done: CancellationToken::new(),
        user: OnceLock::new(),
    });

    spawn_auth_timeout(&server_connection, state.settings.auth_timeout);
    spawn_heartbeat(&tunnel, state.settings.heartbeat);
    spawn_uni_stream_loop(&server_connection);
    spawn_bi_stream_loop(&server_connection);
    spawn_datagram_loop(&server_connection);
    Ok(())
}

fn spawn_auth_timeout(connection: &Arc<ServerConnection>, auth_timeout: Duration) {
    let auth_done = connection.auth_done.clone();
    connection.tunnel.spawn(async move {
        tokio::select! {
            _ = auth_done.cancelled() => Ok(()),
            _ = tokio::time::sleep(auth_timeout) => Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "authentication timed out",
            )),
        }
    });
}

fn spawn_uni_stream_loop(connection: &Arc<ServerConnection>) {
    let server_connection = connection.clone();
    connection.tunnel.spawn(async move {
        loop {
            let mut recv_stream = server_connection
                .tunnel
                .connection()
                .accept_uni()
                .await
                .map_err(connection_error)?;
            let stream_connection = server_connection.clone();
            tokio::spawn(async move {
                let command = match Command::read_from(&mut recv_stream).await {
                    Ok(command) => command,
                    Err(e) => {
                        debug!("dropping invalid stream: {e}");
                        return;
                    }
                };
                if let Err(e) = stream_connection
                    .handle_command(command, UdpRelayMode::Quic)
                    .await
                {
                    debug!("dropping stream command: {e}");
                }
            });
        }
    });
}

fn spawn_bi_stream_loop(connection: &Arc<ServerConnection>) {
    let server_connection = connection.clone();
    connection.tunnel.spawn(async move {
        loop {
            let (send_stream, mut recv_stream) = server_connection
                .tunnel
                .connection()
                .accept_bi()
                .await
                .map_err(connection_error)?;
            let stream_connection = server_connection.clone();
            tokio::spawn(async move {
                if let Err(e) = stream_connection.authenticated().await {
                    debug!("dropping tcp stream: {e}");
                    return;
                }
                let destination = match Command::read_from(&mut recv_stream).await {
                    Ok(Command::Connect { destination }) => destination,
                    Ok(other) => {
                        error!(
                            "unexpected {} command on bidirectional stream from {}",
                            other.name(),
                            stream_connection.remote_address()
                        );
                        return;
                    }
                    Err(e) => {
                        debug!("failed to read connect command: {e}");
                        return;
                    }
                };
                let metadata = stream_connection.metadata(destination);
                let stream = QuicStream::from(send_stream, recv_stream);
                if let Err(e) = stream_connection
                    .state
                    .handler
                    .new_connection(stream, metadata)
                    .await
                {
                    debug!("tcp stream handler ended: {e}");
                }
            });
        }
    });
}

fn spawn_datagram_loop(connection: &Arc<ServerConnection>) {
    let server_connection = connection.clone();
    connection.tunnel.spawn(async move {
        loop {
            let datagram = server_connection
                .tunnel
                .connection()
                .read_datagram()
                .await
                .map_err(connection_error)?;
            let command = match Command::decode(datagram) {
                Ok(command) => command,
                Err(e) => {
                    debug!("dropping invalid datagram: {e}");
                    continue;
                }
            };
            if let Err(e) = server_connection
                .handle_command(command, UdpRelayMode::Native)
                .await
            {
                debug!("dropping datagram command: {e}");
            }
        }
    });
}
