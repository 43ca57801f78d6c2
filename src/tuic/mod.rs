//! TUIC v5 over QUIC.
//!
//! TCP requests travel on bidirectional streams prefixed by a `Connect`
//! command. UDP packets travel as datagrams or, in `quic` relay mode, one
//! unidirectional stream per packet. Authentication is a single
//! unidirectional stream carrying the user's UUID and a token exported from
//! the TLS session.

mod client;
pub mod protocol;
mod server;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use client::{TuicClient, TuicClientSettings};
pub use server::{TuicServer, TuicServerSettings, TuicUser};

pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(10);
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UdpRelayMode {
    #[default]
    Native,
    Quic,
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::address::NetLocation;
    use crate::congestion::CongestionControlKind;
    use crate::test_util::{EchoHandler, Event, localhost, test_tls};
    use crate::uuid_util::parse_uuid;

    const UUID: &str = "a3482e88-686a-4a58-8126-99c9df64b7bf";
    const WAIT: Duration = Duration::from_secs(10);

    struct Setup {
        server: Arc<TuicServer>,
        client: TuicClient,
        events: mpsc::UnboundedReceiver<Event>,
    }

    fn start(client_password: &str, configure: impl FnOnce(&mut TuicClientSettings)) -> Setup {
        let tls = test_tls(&["h3"], false);
        let uuid = parse_uuid(UUID).unwrap();
        let (handler, events) = EchoHandler::new();
        let mut settings = TuicServerSettings::new(vec![TuicUser {
            name: Some("alice".to_string()),
            uuid,
            password: "secret".to_string(),
        }]);
        settings.congestion_control = CongestionControlKind::Bbr;
        let bind_address: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server =
            Arc::new(TuicServer::bind(bind_address, tls.server, settings, Arc::new(handler)).unwrap());
        let server_address = server.local_addr().unwrap();
        let running = server.clone();
        tokio::spawn(async move { running.run().await });

        let mut client_settings = TuicClientSettings {
            server_address: localhost(server_address),
            sni_hostname: Some("localhost".to_string()),
            uuid,
            password: client_password.to_string(),
            congestion_control: CongestionControlKind::Cubic,
            udp_relay_mode: UdpRelayMode::Native,
            heartbeat: DEFAULT_HEARTBEAT,
            zero_rtt_handshake: false,
            max_packet_size: None,
        };
        configure(&mut client_settings);
        let client = TuicClient::new(client_settings, tls.client).unwrap();
        Setup {
            server,
            client,
            events,
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        timeout(WAIT, events.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_tcp_stream_round_trip() {
        let mut setup = start("secret", |_| {});
        let destination = NetLocation::from_str("example.com:443", None).unwrap();
        let request = b"GET / HTTP/1.0\r\n\r\n";

        let mut stream = setup.client.dial_tcp(&destination).await.unwrap();
        stream.write_all(request).await.unwrap();
        stream.flush().await.unwrap();

        let mut response = vec![0u8; request.len()];
        timeout(WAIT, stream.read_exact(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&response, request);

        match next_event(&mut setup.events).await {
            Event::Stream(metadata) => {
                assert_eq!(metadata.protocol, "tuic");
                assert_eq!(metadata.destination, destination);
                assert_eq!(metadata.user.as_deref(), Some("alice"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        setup.client.close().await;
        setup.server.close();
    }

    #[tokio::test]
    async fn test_fragmented_udp_round_trip() {
        let mut setup = start("secret", |settings| settings.max_packet_size = Some(1200));
        let destination = NetLocation::from_str("1.2.3.4:53", None).unwrap();
        let payload: Bytes = (0..5000u32).map(|i| i as u8).collect::<Vec<_>>().into();

        let session = setup.client.listen_packet().await.unwrap();
        session.write_packet(payload.clone(), &destination).await.unwrap();

        match next_event(&mut setup.events).await {
            Event::Packet(metadata, data, packet_destination) => {
                assert_eq!(metadata.destination, destination);
                assert_eq!(packet_destination, destination);
                assert_eq!(data, payload);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let (echoed, source) = timeout(WAIT, session.read_packet()).await.unwrap().unwrap();
        assert_eq!(echoed, payload);
        assert_eq!(source, destination);
        setup.client.close().await;
        setup.server.close();
    }

    #[tokio::test]
    async fn test_udp_over_streams() {
        let mut setup = start("secret", |settings| {
            settings.udp_relay_mode = UdpRelayMode::Quic
        });
        let destination = NetLocation::from_str("[::1]:5353", None).unwrap();

        let session = setup.client.listen_packet().await.unwrap();
        session
            .write_packet(Bytes::from_static(b"ping"), &destination)
            .await
            .unwrap();

        match next_event(&mut setup.events).await {
            Event::Packet(_, data, packet_destination) => {
                assert_eq!(&data[..], b"ping");
                assert_eq!(packet_destination, destination);
            }
            other => panic!("unexpected event {other:?}"),
        }
        let (echoed, _) = timeout(WAIT, session.read_packet()).await.unwrap().unwrap();
        assert_eq!(&echoed[..], b"ping");

        let oversized = Bytes::from(vec![0u8; protocol::MAX_PACKET_DATA_LEN + 1]);
        let error = session.write_packet(oversized, &destination).await.unwrap_err();
        assert_eq!(error.kind(), std::io::ErrorKind::InvalidInput);
        setup.client.close().await;
        setup.server.close();
    }

    #[tokio::test]
    async fn test_session_ids_increase() {
        let setup = start("secret", |_| {});
        let first = setup.client.listen_packet().await.unwrap();
        let second = setup.client.listen_packet().await.unwrap();
        assert!(second.session_id() > first.session_id());
        setup.client.close().await;
        setup.server.close();
    }

    #[tokio::test]
    async fn test_wrong_password_closes_connection() {
        let mut setup = start("wrong", |_| {});
        let destination = NetLocation::from_str("example.com:80", None).unwrap();

        // The server may already have closed the connection.
        if let Ok(mut stream) = setup.client.dial_tcp(&destination).await {
            let _ = stream.write_all(b"hello").await;
            let _ = stream.flush().await;
            let mut buf = [0u8; 16];
            let result = timeout(WAIT, stream.read(&mut buf)).await.unwrap();
            assert!(!matches!(result, Ok(n) if n > 0));
        }
        assert!(setup.events.try_recv().is_err());
        setup.server.close();
    }
}
