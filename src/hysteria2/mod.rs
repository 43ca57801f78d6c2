//! Hysteria2 over QUIC.
//!
//! Clients authenticate with an HTTP/3 `POST https://hysteria/auth`; after
//! that the HTTP/3 layer goes quiet and TCP requests use raw bidirectional
//! streams while UDP uses datagrams.

mod client;
pub mod protocol;
mod server;

use std::time::Duration;

pub use client::{Hysteria2Client, Hysteria2ClientSettings};
pub use server::{Hysteria2Server, Hysteria2ServerSettings, Hysteria2User, Masquerade};

pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(300);

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use bytes::{Buf, Bytes};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::address::NetLocation;
    use crate::quic_util::{CLIENT_IDLE_TIMEOUT, client_config, client_endpoint, transport_config};
    use crate::congestion::{CongestionControlKind, QuinnControllerFactory};
    use crate::test_util::{EchoHandler, Event, localhost, test_tls};

    const WAIT: Duration = Duration::from_secs(10);

    struct Setup {
        server: Arc<Hysteria2Server>,
        server_address: SocketAddr,
        client: Hysteria2Client,
        client_tls: rustls::ClientConfig,
        events: mpsc::UnboundedReceiver<Event>,
    }

    fn start(
        client_password: &str,
        configure_server: impl FnOnce(&mut Hysteria2ServerSettings),
        configure_client: impl FnOnce(&mut Hysteria2ClientSettings),
    ) -> Setup {
        let tls = test_tls(&["h3"], false);
        let (handler, events) = EchoHandler::new();
        let mut settings = Hysteria2ServerSettings::new(vec![
            Hysteria2User {
                name: Some("alice".to_string()),
                password: "secret".to_string(),
            },
            Hysteria2User {
                name: Some("bob".to_string()),
                password: "hunter2".to_string(),
            },
        ]);
        settings.up_bps = protocol::mbps_to_bps(100);
        settings.down_bps = protocol::mbps_to_bps(100);
        configure_server(&mut settings);
        let bind_address: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = Arc::new(
            Hysteria2Server::bind(bind_address, tls.server, settings, Arc::new(handler)).unwrap(),
        );
        let server_address = server.local_addr().unwrap();
        let running = server.clone();
        tokio::spawn(async move { running.run().await });

        let mut client_settings = Hysteria2ClientSettings {
            server_address: localhost(server_address),
            sni_hostname: Some("localhost".to_string()),
            password: client_password.to_string(),
            up_bps: protocol::mbps_to_bps(50),
            down_bps: protocol::mbps_to_bps(200),
            max_packet_size: None,
        };
        configure_client(&mut client_settings);
        let client = Hysteria2Client::new(client_settings, tls.client.clone());
        Setup {
            server,
            server_address,
            client,
            client_tls: tls.client,
            events,
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        timeout(WAIT, events.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_tcp_stream_round_trip() {
        let mut setup = start("hunter2", |_| {}, |_| {});
        let destination = NetLocation::from_str("example.com:443", None).unwrap();
        let request = b"GET / HTTP/1.0\r\n\r\n";

        let mut stream = setup.client.dial_tcp(&destination).await.unwrap();
        stream.write_all(request).await.unwrap();
        stream.flush().await.unwrap();

        // The response frame is stripped before the echoed bytes.
        let mut response = vec![0u8; request.len()];
        timeout(WAIT, stream.read_exact(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&response, request);

        match next_event(&mut setup.events).await {
            Event::Stream(metadata) => {
                assert_eq!(metadata.protocol, "hysteria2");
                assert_eq!(metadata.destination, destination);
                assert_eq!(metadata.user.as_deref(), Some("bob"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        setup.client.close().await;
        setup.server.close();
    }

    #[tokio::test]
    async fn test_fragmented_udp_round_trip() {
        let mut setup = start(
            "secret",
            |_| {},
            |settings| settings.max_packet_size = Some(1200),
        );
        let destination = NetLocation::from_str("1.2.3.4:53", None).unwrap();
        let payload: Bytes = (0..5000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();

        let session = setup.client.listen_packet().await.unwrap();
        session.write_packet(payload.clone(), &destination).await.unwrap();

        match next_event(&mut setup.events).await {
            Event::Packet(metadata, data, packet_destination) => {
                assert_eq!(metadata.destination, destination);
                assert_eq!(metadata.user.as_deref(), Some("alice"));
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
    async fn test_wrong_password_rejected() {
        let setup = start("wrong", |_| {}, |_| {});
        let destination = NetLocation::from_str("example.com:443", None).unwrap();
        let error = setup.client.dial_tcp(&destination).await.unwrap_err();
        assert_eq!(error.kind(), std::io::ErrorKind::PermissionDenied);
        setup.server.close();
    }

    #[tokio::test]
    async fn test_udp_disabled() {
        let setup = start("secret", |settings| settings.udp_enabled = false, |_| {});
        let error = setup.client.listen_packet().await.unwrap_err();
        assert_eq!(error.kind(), std::io::ErrorKind::Unsupported);
        setup.client.close().await;
        setup.server.close();
    }

    #[tokio::test]
    async fn test_masquerade_response() {
        let setup = start(
            "secret",
            |settings| {
                settings.masquerade = Masquerade {
                    status_code: 403,
                    headers: vec![("server".to_string(), "nginx".to_string())],
                    content: "forbidden".to_string(),
                }
            },
            |_| {},
        );

        let transport = transport_config(
            QuinnControllerFactory::new(CongestionControlKind::Cubic).into_arc(),
            CLIENT_IDLE_TIMEOUT,
        )
        .unwrap();
        let config = client_config(setup.client_tls.clone(), transport).unwrap();
        let endpoint = client_endpoint(setup.server_address).unwrap();
        let connection = endpoint
            .connect_with(config, setup.server_address, "localhost")
            .unwrap()
            .await
            .unwrap();
        let (mut driver, mut send_request) =
            h3::client::new(h3_quinn::Connection::new(connection)).await.unwrap();
        tokio::spawn(async move {
            let _ = futures::future::poll_fn(|cx| driver.poll_close(cx)).await;
        });

        let request = http::Request::get("https://localhost/index.html")
            .body(())
            .unwrap();
        let mut stream = send_request.send_request(request).await.unwrap();
        stream.finish().await.unwrap();
        let response = timeout(WAIT, stream.recv_response()).await.unwrap().unwrap();
        assert_eq!(response.status().as_u16(), 403);
        assert_eq!(response.headers().get("server").unwrap(), "nginx");

        let mut body = Vec::new();
        while let Some(mut chunk) = stream.recv_data().await.unwrap() {
            while chunk.has_remaining() {
                let part = chunk.chunk();
                body.extend_from_slice(part);
                let len = part.len();
                chunk.advance(len);
            }
        }
        assert_eq!(body, b"forbidden");
        setup.server.close();
    }
}
