//! Server-side protocol configurations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::common::{
    NoneOrSome, OneOrSome, default_auth_timeout_secs, default_heartbeat_secs,
    default_masquerade_status, default_true, default_udp_timeout_secs, is_false,
};
use crate::address::NetLocation;
use crate::congestion::CongestionControlKind;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(alias = "bind_location")]
    pub address: NetLocation,
    pub protocol: ServerProxyConfig,
    pub quic_settings: ServerQuicConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerQuicConfig {
    /// PEM file path, or the PEM text itself.
    pub cert: String,
    /// PEM file path, or the PEM text itself.
    pub key: String,
    #[serde(alias = "alpn_protocol", default)]
    pub alpn_protocols: NoneOrSome<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum ServerProxyConfig {
    #[serde(alias = "tuicv5")]
    Tuic {
        #[serde(alias = "user")]
        users: OneOrSome<TuicUserConfig>,
        #[serde(default)]
        congestion_control: CongestionControlKind,
        #[serde(default = "default_auth_timeout_secs")]
        auth_timeout_secs: u64,
        #[serde(default = "default_heartbeat_secs")]
        heartbeat_secs: u64,
        /// 0.5-RTT data from the server, replayable by an attacker.
        #[serde(default, skip_serializing_if = "is_false")]
        zero_rtt_handshake: bool,
        #[serde(default = "default_udp_timeout_secs")]
        udp_timeout_secs: u64,
    },
    Hysteria2 {
        #[serde(alias = "user")]
        users: OneOrSome<Hysteria2UserConfig>,
        #[serde(default)]
        up_mbps: u64,
        #[serde(default)]
        down_mbps: u64,
        #[serde(default, skip_serializing_if = "is_false")]
        ignore_client_bandwidth: bool,
        #[serde(default = "default_true")]
        udp_enabled: bool,
        #[serde(default = "default_udp_timeout_secs")]
        udp_timeout_secs: u64,
        #[serde(default = "default_auth_timeout_secs")]
        auth_timeout_secs: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        masquerade: Option<MasqueradeConfig>,
    },
}

impl std::fmt::Display for ServerProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tuic { .. } => write!(f, "TuicV5"),
            Self::Hysteria2 { .. } => write!(f, "Hysteria2"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TuicUserConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub uuid: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Hysteria2UserConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MasqueradeConfig {
    #[serde(default = "default_masquerade_status")]
    pub status_code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub content: String,
}
