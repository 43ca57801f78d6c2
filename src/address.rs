use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Longest hostname that fits a one-byte length prefix.
pub const MAX_HOSTNAME_LEN: usize = 255;

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Hostname(String),
}

impl Address {
    pub const UNSPECIFIED: Self = Address::Ipv4(Ipv4Addr::UNSPECIFIED);

    /// Parses an IP literal, falling back to a hostname. IPv6 literals may be
    /// wrapped in brackets.
    pub fn from(s: &str) -> std::io::Result<Self> {
        let unbracketed = s
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'));
        if let Some(inner) = unbracketed {
            return inner.parse::<Ipv6Addr>().map(Address::Ipv6).map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("invalid ipv6 address: {s}"),
                )
            });
        }

        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(ip.into());
        }

        if s.is_empty() || s.len() > MAX_HOSTNAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid hostname length: {}", s.len()),
            ));
        }
        if s.bytes().any(|b| b == b':' || b == b'/' || b.is_ascii_whitespace()) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid hostname: {s}"),
            ));
        }
        Ok(Address::Hostname(s.to_string()))
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, Address::Ipv6(_))
    }

    pub fn hostname(&self) -> Option<&str> {
        match self {
            Address::Hostname(hostname) => Some(hostname),
            _ => None,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ipv4(addr) => Some(IpAddr::V4(*addr)),
            Address::Ipv6(addr) => Some(IpAddr::V6(*addr)),
            Address::Hostname(_) => None,
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(addr) => Address::Ipv4(addr),
            IpAddr::V6(addr) => Address::Ipv6(addr),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Address::Ipv4(i) => write!(f, "{i}"),
            Address::Ipv6(i) => write!(f, "{i}"),
            Address::Hostname(h) => write!(f, "{h}"),
        }
    }
}

/// A destination: address plus port.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct NetLocation {
    address: Address,
    port: u16,
}

impl NetLocation {
    pub const UNSPECIFIED: Self = NetLocation::new(Address::UNSPECIFIED, 0);

    pub const fn new(address: Address, port: u16) -> Self {
        Self { address, port }
    }

    /// Parses `host:port`, `ip:port` or `[ipv6]:port`. A bare host is accepted
    /// when `default_port` is given.
    pub fn from_str(s: &str, default_port: Option<u16>) -> std::io::Result<Self> {
        let (address_str, port) = if let Some(rest) = s.strip_prefix('[') {
            let (inner, after) = rest.split_once(']').ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("unterminated ipv6 address: {s}"),
                )
            })?;
            let port = match after.strip_prefix(':') {
                Some(port_str) => Some(parse_port(port_str)?),
                None if after.is_empty() => default_port,
                None => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("invalid location: {s}"),
                    ));
                }
            };
            (inner, port)
        } else if s.parse::<Ipv6Addr>().is_ok() {
            // Bare ipv6 literals can't carry a port.
            (s, default_port)
        } else {
            match s.rsplit_once(':') {
                Some((host, port_str)) => (host, Some(parse_port(port_str)?)),
                None => (s, default_port),
            }
        };

        let address = if s.starts_with('[') {
            address_str.parse::<Ipv6Addr>().map(Address::Ipv6).map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("invalid ipv6 address: {address_str}"),
                )
            })?
        } else {
            Address::from(address_str)?
        };

        let port = port.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("missing port: {s}"),
            )
        })?;

        Ok(Self { address, port })
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::new(addr.ip().into(), addr.port())
    }

    pub fn components(&self) -> (&Address, u16) {
        (&self.address, self.port)
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn to_socket_addr_nonblocking(&self) -> Option<SocketAddr> {
        self.address.ip().map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Resolves to the first socket address, skipping DNS for IP literals.
    pub async fn resolve(&self) -> std::io::Result<SocketAddr> {
        if let Some(addr) = self.to_socket_addr_nonblocking() {
            return Ok(addr);
        }
        tokio::net::lookup_host((self.address.to_string(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no addresses found for {self}"),
                )
            })
    }
}

fn parse_port(s: &str) -> std::io::Result<u16> {
    s.parse::<u16>().map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid port {s}: {e}"),
        )
    })
}

impl std::fmt::Display for NetLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.address {
            Address::Ipv6(ref addr) => write!(f, "[{addr}]:{}", self.port),
            ref address => write!(f, "{address}:{}", self.port),
        }
    }
}

impl Serialize for NetLocation {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NetLocation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        NetLocation::from_str(&value, None).map_err(|e| {
            serde::de::Error::custom(format!("invalid location '{value}': {e}"))
        })
    }
}
