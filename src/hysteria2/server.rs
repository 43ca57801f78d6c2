use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use subtle::ConstantTimeEq;

use super::client::Hysteria2PacketOutbound;
use super::protocol::{
    AUTH_HOST, AUTH_PADDING, AUTH_PATH, FRAME_TYPE_TCP_REQUEST, ReceiveRate, STATUS_AUTH_OK,
    decode_udp_message, encode_tcp_response, header, read_tcp_request, server_send_rate,
    tcp_error_response,
};
use super::{DEFAULT_AUTH_TIMEOUT, DEFAULT_UDP_TIMEOUT};
use crate::address::NetLocation;
use crate::congestion::{Bandwidth, CongestionControlKind, CongestionSwitch, QuinnControllerFactory};
use crate::quic_stream::QuicStream;
use crate::quic_util::{SERVER_IDLE_TIMEOUT, server_config, server_crypto, transport_config};
use crate::server_handler::{InboundMetadata, ServerHandler};
use crate::tunnel::Tunnel;
use crate::udp_session::{PacketOutbound, SessionTable};
use crate::util::{connection_error, random_padding};
use crate::varint::read_varint;

type H3Connection = h3::server::Connection<h3_quinn::Connection, Bytes>;
type H3RequestStream = h3::server::RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>;

#[derive(Debug, Clone)]
pub struct Hysteria2User {
    pub name: Option<String>,
    pub password: String,
}

/// The response unauthenticated HTTP/3 requests get.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Masquerade {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub content: String,
}

impl Default for Masquerade {
    fn default() -> Self {
        Self {
            status_code: 404,
            headers: vec![],
            content: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Hysteria2ServerSettings {
    pub users: Vec<Hysteria2User>,
    /// Highest send rate in bytes per second, 0 for no limit.
    pub up_bps: Bandwidth,
    /// Receive rate in bytes per second advertised to clients, 0 when
    /// unknown.
    pub down_bps: Bandwidth,
    pub ignore_client_bandwidth: bool,
    pub udp_enabled: bool,
    pub udp_timeout: Duration,
    pub auth_timeout: Duration,
    pub masquerade: Masquerade,
    pub max_packet_size: Option<usize>,
}

impl Hysteria2ServerSettings {
    pub fn new(users: Vec<Hysteria2User>) -> Self {
        Self {
            users,
            up_bps: 0,
            down_bps: 0,
            ignore_client_bandwidth: false,
            udp_enabled: true,
            udp_timeout: DEFAULT_UDP_TIMEOUT,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            masquerade: Masquerade::default(),
            max_packet_size: None,
        }
    }
}

struct ServerState {
    settings: Hysteria2ServerSettings,
    crypto: Arc<quinn::crypto::rustls::QuicServerConfig>,
    handler: Arc<dyn ServerHandler>,
}

// `QuicServerConfig` does not implement `Debug`, so it is omitted here.
impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState")
            .field("settings", &self.settings)
            .field("handler", &self.handler)
            .finish_non_exhaustive()
    }
}

impl ServerState {
    fn find_user(&self, password: &[u8]) -> Option<&Hysteria2User> {
        let mut found = None;
        // Compare against every user so timing does not reveal which matched.
        for user in self.settings.users.iter() {
            if bool::from(user.password.as_bytes().ct_eq(password)) && found.is_none() {
                found = Some(user);
            }
        }
        found
    }
}

/// Accepts Hysteria2 connections on one UDP socket.
#[derive(Debug)]
pub struct Hysteria2Server {
    endpoint: quinn::Endpoint,
    state: Arc<ServerState>,
}

impl Hysteria2Server {
    pub fn bind(
        address: SocketAddr,
        tls_config: rustls::ServerConfig,
        settings: Hysteria2ServerSettings,
        handler: Arc<dyn ServerHandler>,
    ) -> std::io::Result<Self> {
        if settings.users.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "hysteria2 server needs at least one user",
            ));
        }
        let crypto = server_crypto(Arc::new(tls_config))?;
        // Connections get their own config on accept, this one is a fallback.
        let transport = transport_config(
            QuinnControllerFactory::new(CongestionControlKind::Bbr).into_arc(),
            SERVER_IDLE_TIMEOUT,
        )?;
        let endpoint =
            quinn::Endpoint::server(server_config(crypto.clone(), transport), address)?;
        Ok(Self {
            endpoint,
            state: Arc::new(ServerState {
                settings,
                crypto,
                handler,
            }),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    pub async fn run(&self) -> std::io::Result<()> {
        info!("hysteria2 server listening on {}", self.local_addr()?);
        while let Some(incoming) = self.endpoint.accept().await {
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = process_connection(state, incoming).await {
                    debug!("hysteria2 connection failed: {e}");
                }
            });
        }
        Ok(())
    }

    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"server closed");
    }
}

async fn process_connection(
    state: Arc<ServerState>,
    incoming: quinn::Incoming,
) -> std::io::Result<()> {
    let switch = CongestionSwitch::new();
    let transport = transport_config(
        QuinnControllerFactory::switchable(CongestionControlKind::Bbr, switch.clone()).into_arc(),
        SERVER_IDLE_TIMEOUT,
    )?;
    let config = Arc::new(server_config(state.crypto.clone(), transport));
    let connection = incoming
        .accept_with(config)
        .map_err(connection_error)?
        .await
        .map_err(connection_error)?;
    debug!("hysteria2 connection from {}", connection.remote_address());

    let tunnel = Tunnel::new("hysteria2", connection.clone(), SessionTable::new(u32::MAX));
    tunnel.watch_connection();

    let mut h3_connection: H3Connection =
        match H3Connection::new(h3_quinn::Connection::new(connection)).await {
            Ok(h3_connection) => h3_connection,
            Err(e) => {
                tunnel.close_with_error(std::io::Error::other(e));
                return Ok(());
            }
        };

    let auth = tokio::time::timeout(
        state.settings.auth_timeout,
        authenticate(&state, &mut h3_connection, &switch),
    )
    .await;
    let user = match auth {
        Ok(Ok(user)) => user,
        Ok(Err(e)) => {
            tunnel.close_with_error(e);
            return Ok(());
        }
        Err(_) => {
            tunnel.close_with_error(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "authentication timed out",
            ));
            return Ok(());
        }
    };

    // Dropping the HTTP/3 connection closes the QUIC connection.
    tunnel.spawn(async move {
        let _h3_connection = h3_connection;
        std::future::pending::<()>().await;
        Ok(())
    });

    let connection = Arc::new(AuthenticatedConnection {
        tunnel: tunnel.clone(),
        state: state.clone(),
        user: user.name.clone(),
    });
    spawn_tcp_loop(&connection);
    if state.settings.udp_enabled {
        tunnel
            .sessions()
            .spawn_idle_sweeper(state.settings.udp_timeout, tunnel.cancel_token().clone());
        spawn_datagram_loop(&connection);
    }
    Ok(())
}

/// Serves HTTP/3 requests until one carries a valid password, answering the
/// rest with the masquerade response.
async fn authenticate(
    state: &ServerState,
    h3_connection: &mut H3Connection,
    switch: &CongestionSwitch,
) -> std::io::Result<Hysteria2User> {
    loop {
        let Some((request, mut stream)) = h3_connection
            .accept()
            .await
            .map_err(std::io::Error::other)?
        else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "connection closed before authentication",
            ));
        };

        let user = if is_auth_request(&request) {
            request
                .headers()
                .get(header::AUTH)
                .and_then(|password| state.find_user(password.as_bytes()))
        } else {
            None
        };
        let Some(user) = user else {
            debug!(
                "masquerading {} {}",
                request.method(),
                request.uri().path()
            );
            if let Err(e) = send_masquerade(&state.settings.masquerade, &mut stream).await {
                debug!("failed to send masquerade response: {e}");
            }
            continue;
        };

        let client_rx = match ReceiveRate::parse(
            request
                .headers()
                .get(header::CC_RX)
                .and_then(|value| value.to_str().ok()),
        ) {
            ReceiveRate::Bps(bps) => bps,
            ReceiveRate::Auto => 0,
        };
        let settings = &state.settings;
        let server_rx = if settings.ignore_client_bandwidth {
            ReceiveRate::Auto
        } else {
            ReceiveRate::Bps(settings.down_bps)
        };

        let response = http::Response::builder()
            .status(STATUS_AUTH_OK)
            .header(header::UDP, settings.udp_enabled.to_string())
            .header(header::CC_RX, server_rx.header_value())
            .header(
                header::PADDING,
                random_padding(AUTH_PADDING.0, AUTH_PADDING.1),
            )
            .body(())
            .map_err(std::io::Error::other)?;
        stream
            .send_response(response)
            .await
            .map_err(std::io::Error::other)?;
        stream.finish().await.map_err(std::io::Error::other)?;

        if let Some(bps) =
            server_send_rate(settings.ignore_client_bandwidth, client_rx, settings.up_bps)
        {
            switch.set_brutal(bps);
        }
        info!(
            "hysteria2 user {} authenticated",
            user.name.as_deref().unwrap_or("<unnamed>")
        );
        return Ok(user.clone());
    }
}

fn is_auth_request<T>(request: &http::Request<T>) -> bool {
    request.method() == http::Method::POST
        && request.uri().host() == Some(AUTH_HOST)
        && request.uri().path() == AUTH_PATH
}

async fn send_masquerade(
    masquerade: &Masquerade,
    stream: &mut H3RequestStream,
) -> std::io::Result<()> {
    let mut builder = http::Response::builder().status(masquerade.status_code);
    for (name, value) in masquerade.headers.iter() {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let response = builder.body(()).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid masquerade response: {e}"),
        )
    })?;
    stream
        .send_response(response)
        .await
        .map_err(std::io::Error::other)?;
    if !masquerade.content.is_empty() {
        stream
            .send_data(Bytes::from(masquerade.content.clone()))
            .await
            .map_err(std::io::Error::other)?;
    }
    stream.finish().await.map_err(std::io::Error::other)
}

#[derive(Debug)]
struct AuthenticatedConnection {
    tunnel: Arc<Tunnel>,
    state: Arc<ServerState>,
    user: Option<String>,
}

impl AuthenticatedConnection {
    fn metadata(&self, destination: NetLocation) -> InboundMetadata {
        InboundMetadata {
            protocol: "hysteria2",
            source: self.tunnel.connection().remote_address(),
            destination,
            user: self.user.clone(),
        }
    }
}

fn spawn_tcp_loop(connection: &Arc<AuthenticatedConnection>) {
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
                let frame_type = match read_varint(&mut recv_stream).await {
                    Ok(frame_type) => frame_type,
                    Err(e) => {
                        debug!("failed to read frame type: {e}");
                        return;
                    }
                };
                if frame_type != FRAME_TYPE_TCP_REQUEST {
                    warn!("unexpected frame type {frame_type:#x}");
                    return;
                }
                let destination = match read_tcp_request(&mut recv_stream).await {
                    Ok(destination) => destination,
                    Err(e) => {
                        debug!("invalid tcp request: {e}");
                        return;
                    }
                };
                let response = match encode_tcp_response(true, "") {
                    Ok(response) => response,
                    Err(e) => {
                        debug!("failed to encode tcp response: {e}");
                        return;
                    }
                };
                let metadata = stream_connection.metadata(destination);
                let stream = QuicStream::with_response(
                    send_stream,
                    recv_stream,
                    response,
                    tcp_error_response,
                );
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

fn spawn_datagram_loop(connection: &Arc<AuthenticatedConnection>) {
    let server_connection = connection.clone();
    connection.tunnel.spawn(async move {
        let max_packet_size = server_connection.state.settings.max_packet_size;
        loop {
            let datagram = server_connection
                .tunnel
                .connection()
                .read_datagram()
                .await
                .map_err(connection_error)?;
            let message = match decode_udp_message(datagram) {
                Ok(message) => message,
                Err(e) => {
                    debug!("dropping invalid datagram: {e}");
                    continue;
                }
            };
            let quic_connection = server_connection.tunnel.connection().clone();
            let created = server_connection.tunnel.dispatch_or_create(
                message,
                move || -> Arc<dyn PacketOutbound> {
                    Arc::new(Hysteria2PacketOutbound::new(quic_connection, max_packet_size))
                },
            );
            let Some((session, destination)) = created else {
                continue;
            };
            debug!("new udp session {}", session.session_id());
            let handler = server_connection.state.handler.clone();
            let metadata = server_connection.metadata(destination);
            tokio::spawn(async move {
                if let Err(e) = handler.new_packet_connection(session, metadata).await {
                    debug!("udp session handler ended: {e}");
                }
            });
        }
    });
}
