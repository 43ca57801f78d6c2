use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::congestion::ControllerFactory;

pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
pub const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const SERVER_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
pub const MAX_CONCURRENT_STREAMS: u32 = 4096;

pub fn transport_config(
    congestion: Arc<dyn ControllerFactory + Send + Sync>,
    idle_timeout: Duration,
) -> std::io::Result<quinn::TransportConfig> {
    let idle_timeout = quinn::IdleTimeout::try_from(idle_timeout).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid idle timeout: {e}"),
        )
    })?;
    let mut transport = quinn::TransportConfig::default();
    transport
        .max_concurrent_bidi_streams(MAX_CONCURRENT_STREAMS.into())
        .max_concurrent_uni_streams(MAX_CONCURRENT_STREAMS.into())
        .keep_alive_interval(Some(KEEP_ALIVE_INTERVAL))
        .max_idle_timeout(Some(idle_timeout))
        .congestion_controller_factory(congestion);
    Ok(transport)
}

pub fn client_config(
    tls_config: rustls::ClientConfig,
    transport: quinn::TransportConfig,
) -> std::io::Result<quinn::ClientConfig> {
    let initial_suite = match rustls::crypto::aws_lc_rs::cipher_suite::TLS13_AES_128_GCM_SHA256 {
        rustls::SupportedCipherSuite::Tls13(suite) => suite.quic_suite(),
        _ => None,
    }
    .ok_or_else(|| std::io::Error::other("no initial quic cipher suite"))?;

    let quic_client_config =
        quinn::crypto::rustls::QuicClientConfig::with_initial(Arc::new(tls_config), initial_suite)
            .map_err(std::io::Error::other)?;
    let mut config = quinn::ClientConfig::new(Arc::new(quic_client_config));
    config.transport_config(Arc::new(transport));
    Ok(config)
}

pub fn server_crypto(
    tls_config: Arc<rustls::ServerConfig>,
) -> std::io::Result<Arc<quinn::crypto::rustls::QuicServerConfig>> {
    let quic_server_config = quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
        .map_err(std::io::Error::other)?;
    Ok(Arc::new(quic_server_config))
}

pub fn server_config(
    crypto: Arc<quinn::crypto::rustls::QuicServerConfig>,
    transport: quinn::TransportConfig,
) -> quinn::ServerConfig {
    let mut config = quinn::ServerConfig::with_crypto(crypto);
    config.transport_config(Arc::new(transport));
    config
}

/// A client-only endpoint on an ephemeral port of the server's address family.
pub fn client_endpoint(server_address: SocketAddr) -> std::io::Result<quinn::Endpoint> {
    let bind_address: SocketAddr = if server_address.is_ipv6() {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    };
    let udp_socket = std::net::UdpSocket::bind(bind_address)?;
    quinn::Endpoint::new(
        quinn::EndpointConfig::default(),
        None,
        udp_socket,
        Arc::new(quinn::TokioRuntime),
    )
}
