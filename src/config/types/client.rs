//! Client-side configurations: an upstream proxy plus local port forwards.

use serde::{Deserialize, Serialize};

use super::common::{NoneOrSome, OneOrSome, default_heartbeat_secs, default_true, is_false};
use crate::address::NetLocation;
use crate::congestion::CongestionControlKind;
use crate::tuic::UdpRelayMode;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    #[serde(alias = "address")]
    pub server: NetLocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni_hostname: Option<String>,
    #[serde(default = "default_true")]
    pub verify: bool,
    /// SHA-256 certificate fingerprints, hex with optional colons.
    #[serde(alias = "server_fingerprint", default)]
    pub server_fingerprints: NoneOrSome<String>,
    #[serde(alias = "alpn_protocol", default)]
    pub alpn_protocols: NoneOrSome<String>,
    pub protocol: ClientProxyConfig,
    #[serde(alias = "forwards")]
    pub forward: OneOrSome<ForwardConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum ClientProxyConfig {
    #[serde(alias = "tuicv5")]
    Tuic {
        uuid: String,
        password: String,
        #[serde(default)]
        congestion_control: CongestionControlKind,
        #[serde(default)]
        udp_relay_mode: UdpRelayMode,
        #[serde(default = "default_heartbeat_secs")]
        heartbeat_secs: u64,
        #[serde(default, skip_serializing_if = "is_false")]
        zero_rtt_handshake: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_packet_size: Option<usize>,
    },
    Hysteria2 {
        password: String,
        /// Zero lets the server pick the rate.
        #[serde(default)]
        up_mbps: u64,
        #[serde(default)]
        down_mbps: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_packet_size: Option<usize>,
    },
}

impl std::fmt::Display for ClientProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tuic { .. } => write!(f, "TuicV5"),
            Self::Hysteria2 { .. } => write!(f, "Hysteria2"),
        }
    }
}

/// Local listener whose traffic is relayed to `target` through the proxy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardConfig {
    pub bind: NetLocation,
    pub target: NetLocation,
    #[serde(default, skip_serializing_if = "is_false")]
    pub udp: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuic_client() {
        let yaml = r#"
server: proxy.example.com:443
protocol:
  type: tuic
  uuid: a3482e88-686a-4a58-8126-99c9df64b7bf
  password: secret
  congestion_control: bbr
  udp_relay_mode: quic
forward:
  bind: 127.0.0.1:5353
  target: 8.8.8.8:53
  udp: true
"#;
        let config: ClientConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.verify);
        assert_eq!(config.server.port(), 443);
        match config.protocol {
            ClientProxyConfig::Tuic {
                congestion_control,
                udp_relay_mode,
                heartbeat_secs,
                ..
            } => {
                assert_eq!(congestion_control, CongestionControlKind::Bbr);
                assert_eq!(udp_relay_mode, UdpRelayMode::Quic);
                assert_eq!(heartbeat_secs, 10);
            }
            other => panic!("unexpected protocol {other}"),
        }
        let forwards = config.forward.into_vec();
        assert_eq!(forwards.len(), 1);
        assert!(forwards[0].udp);
    }

    #[test]
    fn test_hysteria2_client() {
        let yaml = r#"
address: 10.0.0.1:8443
verify: false
server_fingerprint: "AB:CD"
protocol:
  type: hysteria2
  password: secret
  up_mbps: 20
forwards:
  - bind: 127.0.0.1:8080
    target: example.com:80
  - bind: 127.0.0.1:8443
    target: example.com:443
"#;
        let config: ClientConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(!config.verify);
        assert_eq!(config.server_fingerprints.into_vec(), vec!["AB:CD"]);
        match config.protocol {
            ClientProxyConfig::Hysteria2 {
                up_mbps, down_mbps, ..
            } => {
                assert_eq!(up_mbps, 20);
                assert_eq!(down_mbps, 0);
            }
            other => panic!("unexpected protocol {other}"),
        }
        assert_eq!(config.forward.len(), 2);
    }
}
