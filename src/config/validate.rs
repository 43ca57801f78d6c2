//! Config validation and conversion into runnable server and client settings.

use std::time::Duration;

use log::debug;

use super::types::{
    ClientConfig, ClientProxyConfig, Config, ForwardConfig, MasqueradeConfig, ServerConfig,
    ServerProxyConfig,
};
use crate::address::NetLocation;
use crate::hysteria2::protocol::mbps_to_bps;
use crate::hysteria2::{
    Hysteria2ClientSettings, Hysteria2ServerSettings, Hysteria2User, Masquerade,
};
use crate::rustls_util::{create_client_config, create_server_config, parse_fingerprints};
use crate::tuic::{TuicClientSettings, TuicServerSettings, TuicUser};
use crate::uuid_util::parse_uuid;

const DEFAULT_ALPN_PROTOCOL: &str = "h3";

pub enum ValidatedConfig {
    TuicServer {
        bind: NetLocation,
        tls: rustls::ServerConfig,
        settings: TuicServerSettings,
    },
    Hysteria2Server {
        bind: NetLocation,
        tls: rustls::ServerConfig,
        settings: Hysteria2ServerSettings,
    },
    TuicClient {
        tls: rustls::ClientConfig,
        settings: TuicClientSettings,
        forwards: Vec<ForwardConfig>,
    },
    Hysteria2Client {
        tls: rustls::ClientConfig,
        settings: Hysteria2ClientSettings,
        forwards: Vec<ForwardConfig>,
    },
}

impl std::fmt::Display for ValidatedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TuicServer { bind, .. } => write!(f, "TuicV5 server on {bind}"),
            Self::Hysteria2Server { bind, .. } => write!(f, "Hysteria2 server on {bind}"),
            Self::TuicClient { settings, .. } => {
                write!(f, "TuicV5 client to {}", settings.server_address)
            }
            Self::Hysteria2Client { settings, .. } => {
                write!(f, "Hysteria2 client to {}", settings.server_address)
            }
        }
    }
}

/// Validates all loaded configs and builds their TLS and protocol settings.
pub async fn create_server_configs(
    all_configs: Vec<Config>,
) -> std::io::Result<Vec<ValidatedConfig>> {
    let mut validated = Vec::with_capacity(all_configs.len());
    for config in all_configs {
        let result = match config {
            Config::Server(server_config) => validate_server_config(server_config).await?,
            Config::Client(client_config) => validate_client_config(client_config)?,
        };
        debug!("Validated {result}");
        validated.push(result);
    }
    Ok(validated)
}

fn invalid_input(message: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, message)
}

/// Returns inline PEM text as-is, otherwise reads it from the named file.
async fn load_pem(pem: &str) -> std::io::Result<Vec<u8>> {
    if pem.contains("-----BEGIN") {
        return Ok(pem.as_bytes().to_vec());
    }
    debug!("Reading PEM file: {pem}");
    tokio::fs::read(pem).await.map_err(|e| {
        std::io::Error::new(e.kind(), format!("Failed to read PEM file '{pem}': {e}"))
    })
}

fn alpn_or_default(alpn_protocols: Vec<String>) -> Vec<String> {
    if alpn_protocols.is_empty() {
        vec![DEFAULT_ALPN_PROTOCOL.to_string()]
    } else {
        alpn_protocols
    }
}

async fn validate_server_config(config: ServerConfig) -> std::io::Result<ValidatedConfig> {
    let ServerConfig {
        address,
        protocol,
        quic_settings,
    } = config;

    let cert = load_pem(&quic_settings.cert).await?;
    let key = load_pem(&quic_settings.key).await?;
    let alpn_protocols = alpn_or_default(quic_settings.alpn_protocols.into_vec());

    match protocol {
        ServerProxyConfig::Tuic {
            users,
            congestion_control,
            auth_timeout_secs,
            heartbeat_secs,
            zero_rtt_handshake,
            udp_timeout_secs,
        } => {
            if users.is_empty() {
                return Err(invalid_input(format!("no TUIC users for {address}")));
            }
            let users = users
                .into_vec()
                .into_iter()
                .map(|user| {
                    Ok(TuicUser {
                        name: user.name,
                        uuid: parse_uuid(&user.uuid)?,
                        password: user.password,
                    })
                })
                .collect::<std::io::Result<Vec<_>>>()?;

            let mut settings = TuicServerSettings::new(users);
            settings.congestion_control = congestion_control;
            settings.auth_timeout = Duration::from_secs(auth_timeout_secs);
            settings.heartbeat = Duration::from_secs(heartbeat_secs);
            settings.zero_rtt_handshake = zero_rtt_handshake;
            settings.udp_timeout = Duration::from_secs(udp_timeout_secs);

            let tls = create_server_config(&cert, &key, &alpn_protocols, zero_rtt_handshake)?;
            Ok(ValidatedConfig::TuicServer {
                bind: address,
                tls,
                settings,
            })
        }
        ServerProxyConfig::Hysteria2 {
            users,
            up_mbps,
            down_mbps,
            ignore_client_bandwidth,
            udp_enabled,
            udp_timeout_secs,
            auth_timeout_secs,
            masquerade,
        } => {
            if users.is_empty() {
                return Err(invalid_input(format!("no Hysteria2 users for {address}")));
            }
            let users = users
                .into_vec()
                .into_iter()
                .map(|user| Hysteria2User {
                    name: user.name,
                    password: user.password,
                })
                .collect();

            let mut settings = Hysteria2ServerSettings::new(users);
            settings.up_bps = mbps_to_bps(up_mbps);
            settings.down_bps = mbps_to_bps(down_mbps);
            settings.ignore_client_bandwidth = ignore_client_bandwidth;
            settings.udp_enabled = udp_enabled;
            settings.udp_timeout = Duration::from_secs(udp_timeout_secs);
            settings.auth_timeout = Duration::from_secs(auth_timeout_secs);
            if let Some(masquerade) = masquerade {
                settings.masquerade = convert_masquerade(masquerade)?;
            }

            let tls = create_server_config(&cert, &key, &alpn_protocols, false)?;
            Ok(ValidatedConfig::Hysteria2Server {
                bind: address,
                tls,
                settings,
            })
        }
    }
}

fn convert_masquerade(config: MasqueradeConfig) -> std::io::Result<Masquerade> {
    if http::StatusCode::from_u16(config.status_code).is_err() {
        return Err(invalid_input(format!(
            "invalid masquerade status code: {}",
            config.status_code
        )));
    }
    for (name, value) in config.headers.iter() {
        if http::HeaderName::from_bytes(name.as_bytes()).is_err()
            || http::HeaderValue::from_str(value).is_err()
        {
            return Err(invalid_input(format!(
                "invalid masquerade header: {name}: {value}"
            )));
        }
    }
    Ok(Masquerade {
        status_code: config.status_code,
        headers: config.headers.into_iter().collect(),
        content: config.content,
    })
}

fn validate_client_config(config: ClientConfig) -> std::io::Result<ValidatedConfig> {
    let ClientConfig {
        server,
        sni_hostname,
        verify,
        server_fingerprints,
        alpn_protocols,
        protocol,
        forward,
    } = config;

    if forward.is_empty() {
        return Err(invalid_input(format!("no forwards for client of {server}")));
    }
    let forwards = forward.into_vec();

    let server_fingerprints = server_fingerprints.into_vec();
    if server_fingerprints.iter().any(|fp| fp == "any") {
        return Err(invalid_input(
            "use verify: false instead of an 'any' fingerprint".to_string(),
        ));
    }
    parse_fingerprints(&server_fingerprints)?;
    let alpn_protocols = alpn_or_default(alpn_protocols.into_vec());

    match protocol {
        ClientProxyConfig::Tuic {
            uuid,
            password,
            congestion_control,
            udp_relay_mode,
            heartbeat_secs,
            zero_rtt_handshake,
            max_packet_size,
        } => {
            let tls = create_client_config(
                verify,
                &server_fingerprints,
                &alpn_protocols,
                zero_rtt_handshake,
            )?;
            let settings = TuicClientSettings {
                server_address: server,
                sni_hostname,
                uuid: parse_uuid(&uuid)?,
                password,
                congestion_control,
                udp_relay_mode,
                heartbeat: Duration::from_secs(heartbeat_secs),
                zero_rtt_handshake,
                max_packet_size,
            };
            Ok(ValidatedConfig::TuicClient {
                tls,
                settings,
                forwards,
            })
        }
        ClientProxyConfig::Hysteria2 {
            password,
            up_mbps,
            down_mbps,
            max_packet_size,
        } => {
            let tls = create_client_config(
                verify,
                &server_fingerprints,
                &alpn_protocols,
                false,
            )?;
            let settings = Hysteria2ClientSettings {
                server_address: server,
                sni_hostname,
                password,
                up_bps: mbps_to_bps(up_mbps),
                down_bps: mbps_to_bps(down_mbps),
                max_packet_size,
            };
            Ok(ValidatedConfig::Hysteria2Client {
                tls,
                settings,
                forwards,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed() -> (String, String) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        (cert.cert.pem(), cert.key_pair.serialize_pem())
    }

    fn parse(yaml: &str) -> Vec<Config> {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn indent(pem: &str) -> String {
        pem.lines()
            .map(|line| format!("      {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn server_yaml(protocol: &str) -> String {
        let (cert, key) = self_signed();
        format!(
            "- address: 127.0.0.1:4433\n  protocol:\n{protocol}\n  quic_settings:\n    cert: |\n{}\n    key: |\n{}\n",
            indent(&cert),
            indent(&key)
        )
    }

    #[tokio::test]
    async fn test_tuic_server_with_inline_pem() {
        let yaml = server_yaml(
            "    type: tuic\n    users:\n      - name: alice\n        uuid: a3482e88-686a-4a58-8126-99c9df64b7bf\n        password: secret\n    congestion_control: bbr\n    heartbeat_secs: 5",
        );
        let configs = create_server_configs(parse(&yaml)).await.unwrap();
        assert_eq!(configs.len(), 1);
        match &configs[0] {
            ValidatedConfig::TuicServer {
                bind,
                tls,
                settings,
            } => {
                assert_eq!(bind.port(), 4433);
                assert_eq!(tls.alpn_protocols, vec![b"h3".to_vec()]);
                assert_eq!(settings.users[0].name.as_deref(), Some("alice"));
                assert_eq!(settings.heartbeat, Duration::from_secs(5));
                assert_eq!(
                    settings.congestion_control,
                    crate::congestion::CongestionControlKind::Bbr
                );
            }
            _ => panic!("expected a TUIC server"),
        }
    }

    #[tokio::test]
    async fn test_hysteria2_server_bandwidth() {
        let yaml = server_yaml(
            "    type: hysteria2\n    users: {password: secret}\n    up_mbps: 8\n    down_mbps: 16\n    masquerade:\n      status_code: 502\n      headers: {server: caddy}",
        );
        let configs = create_server_configs(parse(&yaml)).await.unwrap();
        match &configs[0] {
            ValidatedConfig::Hysteria2Server { settings, .. } => {
                assert_eq!(settings.up_bps, 1_000_000);
                assert_eq!(settings.down_bps, 2_000_000);
                assert!(settings.udp_enabled);
                assert_eq!(settings.masquerade.status_code, 502);
                assert_eq!(
                    settings.masquerade.headers,
                    vec![("server".to_string(), "caddy".to_string())]
                );
            }
            _ => panic!("expected a Hysteria2 server"),
        }
    }

    #[tokio::test]
    async fn test_invalid_uuid_rejected() {
        let yaml = server_yaml(
            "    type: tuic\n    users: {uuid: not-a-uuid, password: secret}",
        );
        let error = create_server_configs(parse(&yaml)).await.err().unwrap();
        assert_eq!(error.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_empty_users_rejected() {
        let yaml = server_yaml("    type: hysteria2\n    users: []");
        let error = create_server_configs(parse(&yaml)).await.err().unwrap();
        assert_eq!(error.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_missing_pem_file() {
        let yaml = r#"
- address: 127.0.0.1:4433
  protocol:
    type: hysteria2
    users: {password: secret}
  quic_settings:
    cert: /nonexistent/cert.pem
    key: /nonexistent/key.pem
"#;
        let error = create_server_configs(parse(yaml)).await.err().unwrap();
        assert_eq!(error.kind(), std::io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_client_config() {
        let yaml = r#"
- server: 127.0.0.1:4433
  verify: false
  protocol:
    type: hysteria2
    password: secret
    up_mbps: 10
  forward:
    bind: 127.0.0.1:8080
    target: example.com:80
"#;
        let configs = create_server_configs(parse(yaml)).await.unwrap();
        match &configs[0] {
            ValidatedConfig::Hysteria2Client {
                tls,
                settings,
                forwards,
            } => {
                assert_eq!(tls.alpn_protocols, vec![b"h3".to_vec()]);
                assert_eq!(settings.up_bps, 1_250_000);
                assert_eq!(settings.down_bps, 0);
                assert_eq!(forwards.len(), 1);
            }
            _ => panic!("expected a Hysteria2 client"),
        }
    }

    #[tokio::test]
    async fn test_bad_fingerprint_rejected() {
        let yaml = r#"
- server: 127.0.0.1:4433
  server_fingerprints: [abcd]
  protocol:
    type: tuic
    uuid: a3482e88-686a-4a58-8126-99c9df64b7bf
    password: secret
  forward:
    bind: 127.0.0.1:8080
    target: example.com:80
"#;
        let error = create_server_configs(parse(yaml)).await.err().unwrap();
        assert_eq!(error.kind(), std::io::ErrorKind::InvalidInput);
    }
}
