use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use log::{debug, info};
use tokio::io::AsyncWriteExt;

use super::protocol::{
    AUTH_PADDING, AUTH_URI, Hysteria2Codec, ReceiveRate, STATUS_AUTH_OK, client_send_rate,
    decode_udp_message, encode_tcp_request, header, read_tcp_response,
};
use crate::address::NetLocation;
use crate::congestion::{Bandwidth, CongestionControlKind, CongestionSwitch, QuinnControllerFactory};
use crate::quic_stream::QuicStream;
use crate::quic_util::{CLIENT_IDLE_TIMEOUT, client_config, client_endpoint, transport_config};
use crate::tunnel::Tunnel;
use crate::udp_session::{
    DatagramChannel, Dispatch, PacketOutbound, SessionTable, UdpMessage, UdpSession,
};
use crate::util::{connection_error, random_padding};

#[derive(Debug, Clone)]
pub struct Hysteria2ClientSettings {
    pub server_address: NetLocation,
    pub sni_hostname: Option<String>,
    pub password: String,
    /// Send rate in bytes per second, 0 when unknown.
    pub up_bps: Bandwidth,
    /// Receive rate in bytes per second advertised to the server, 0 when
    /// unknown.
    pub down_bps: Bandwidth,
    pub max_packet_size: Option<usize>,
}

#[derive(Debug)]
pub(crate) struct Hysteria2PacketOutbound {
    datagrams: DatagramChannel<Hysteria2Codec>,
}

impl Hysteria2PacketOutbound {
    pub(crate) fn new(connection: quinn::Connection, max_packet_size: Option<usize>) -> Self {
        Self {
            datagrams: DatagramChannel::new(connection, Hysteria2Codec, max_packet_size),
        }
    }
}

#[async_trait]
impl PacketOutbound for Hysteria2PacketOutbound {
    async fn send_message(&self, message: UdpMessage) -> std::io::Result<()> {
        self.datagrams.send(message)
    }
}

#[derive(Debug)]
struct Hysteria2ClientConnection {
    tunnel: Arc<Tunnel>,
    outbound: Arc<Hysteria2PacketOutbound>,
    udp_enabled: bool,
    _endpoint: quinn::Endpoint,
}

/// Keeps one authenticated connection to a Hysteria2 server, reconnecting
/// once it closes.
#[derive(Debug)]
pub struct Hysteria2Client {
    settings: Arc<Hysteria2ClientSettings>,
    tls_config: rustls::ClientConfig,
    connection: tokio::sync::Mutex<Option<Arc<Hysteria2ClientConnection>>>,
}

impl Hysteria2Client {
    pub fn new(settings: Hysteria2ClientSettings, tls_config: rustls::ClientConfig) -> Self {
        Self {
            settings: Arc::new(settings),
            tls_config,
            connection: tokio::sync::Mutex::new(None),
        }
    }

    async fn connection(&self) -> std::io::Result<Arc<Hysteria2ClientConnection>> {
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

    async fn connect(&self) -> std::io::Result<Hysteria2ClientConnection> {
        let server_address: SocketAddr = self.settings.server_address.resolve().await?;
        let server_host = self.settings.server_address.address().to_string();
        let server_name = self.settings.sni_hostname.as_deref().unwrap_or(&server_host);

        // Every connection starts on BBR until the server answers with a rate.
        let switch = CongestionSwitch::new();
        let transport = transport_config(
            QuinnControllerFactory::switchable(CongestionControlKind::Bbr, switch.clone())
                .into_arc(),
            CLIENT_IDLE_TIMEOUT,
        )?;
        let quic_config = client_config(self.tls_config.clone(), transport)?;

        let endpoint = client_endpoint(server_address)?;
        let connection = endpoint
            .connect_with(quic_config, server_address, server_name)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?
            .await
            .map_err(connection_error)?;
        debug!("hysteria2 connection established to {server_address}");

        let tunnel = Tunnel::new("hysteria2", connection.clone(), SessionTable::new(u32::MAX));
        tunnel.watch_connection();

        let udp_enabled = match self.authenticate(&tunnel, &switch).await {
            Ok(udp_enabled) => udp_enabled,
            Err(e) => {
                tunnel.close_with_error(std::io::Error::new(e.kind(), e.to_string()));
                return Err(e);
            }
        };

        if udp_enabled {
            spawn_datagram_loop(&tunnel);
        }

        Ok(Hysteria2ClientConnection {
            outbound: Arc::new(Hysteria2PacketOutbound::new(
                connection,
                self.settings.max_packet_size,
            )),
            tunnel,
            udp_enabled,
            _endpoint: endpoint,
        })
    }

    /// Runs the HTTP/3 auth exchange and settles the send rate. Returns
    /// whether the server relays UDP.
    async fn authenticate(
        &self,
        tunnel: &Arc<Tunnel>,
        switch: &CongestionSwitch,
    ) -> std::io::Result<bool> {
        let (mut driver, mut send_request) =
            h3::client::new(h3_quinn::Connection::new(tunnel.connection().clone()))
                .await
                .map_err(std::io::Error::other)?;

        // Dropping either half ends the HTTP/3 session, which closes the
        // QUIC connection with it.
        let keep_alive = send_request.clone();
        tunnel.spawn(async move {
            let _keep_alive = keep_alive;
            if let Err(e) = futures::future::poll_fn(|cx| driver.poll_close(cx)).await {
                debug!("http/3 driver ended: {e}");
            }
            std::future::pending::<()>().await;
            Ok(())
        });

        let request = http::Request::post(AUTH_URI)
            .header(header::AUTH, self.settings.password.as_str())
            .header(header::CC_RX, self.settings.down_bps.to_string())
            .header(
                header::PADDING,
                random_padding(AUTH_PADDING.0, AUTH_PADDING.1),
            )
            .body(())
            .map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("invalid auth request: {e}"),
                )
            })?;

        let mut stream = send_request
            .send_request(request)
            .await
            .map_err(std::io::Error::other)?;
        stream.finish().await.map_err(std::io::Error::other)?;
        let response = stream.recv_response().await.map_err(std::io::Error::other)?;

        if response.status().as_u16() != STATUS_AUTH_OK {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("authentication failed with status {}", response.status()),
            ));
        }

        let header_str = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
        };
        let udp_enabled = header_str(header::UDP)
            .map(|value| value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let server_rx = ReceiveRate::parse(header_str(header::CC_RX));
        match client_send_rate(server_rx, self.settings.up_bps) {
            Some(bps) => {
                info!("hysteria2 authenticated, sending at {bps} bytes/s");
                switch.set_brutal(bps);
            }
            None => info!("hysteria2 authenticated, sending with bbr"),
        }
        Ok(udp_enabled)
    }

    /// Opens a TCP stream to `destination` through the server. The request
    /// is sent right away; the server's answer is read before the first read
    /// returns.
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
        send_stream.write_all(&encode_tcp_request(destination)?).await?;

        let handshake = async move {
            let mut recv_stream = recv_stream;
            read_tcp_response(&mut recv_stream).await?;
            Ok(recv_stream)
        }
        .boxed();
        Ok(QuicStream::with_read_handshake(send_stream, handshake))
    }

    /// Starts a UDP session relayed through the server.
    pub async fn listen_packet(&self) -> std::io::Result<UdpSession> {
        let connection = self.connection().await?;
        if !connection.udp_enabled {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "server does not relay udp",
            ));
        }
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

fn spawn_datagram_loop(tunnel: &Arc<Tunnel>) {
    let task_tunnel = tunnel.clone();
    tunnel.spawn(async move {
        loop {
            let datagram = task_tunnel
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
            if let Dispatch::Unknown(message) = task_tunnel.sessions().dispatch(message) {
                debug!("dropping packet for unknown session {}", message.session_id);
            }
        }
    });
}
