//! Configuration types, organized by side:
//!
//! - [`common`]: Shared helpers and defaults
//! - [`server`]: Server-side protocol configurations
//! - [`client`]: Client-side protocol configurations and forwards

pub mod client;
pub mod common;
pub mod server;

use serde::{Deserialize, Serialize};

pub use client::{ClientConfig, ClientProxyConfig, ForwardConfig};
pub use common::{NoneOrSome, OneOrSome};
pub use server::{
    Hysteria2UserConfig, MasqueradeConfig, ServerConfig, ServerProxyConfig, ServerQuicConfig,
    TuicUserConfig,
};

/// One entry of a config file: a server to run or a client with its forwards.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Config {
    Server(ServerConfig),
    Client(ClientConfig),
}
