//! TUIC v5 commands.
//!
//! Every command starts with the version byte and a command type. Addresses
//! are a type byte, the address and a big-endian port; `ADDRESS_NONE` has no
//! body at all.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::address::{Address, MAX_HOSTNAME_LEN, NetLocation};
use crate::udp_session::{PacketCodec, UdpMessage};
use crate::uuid_util::Uuid;

pub const VERSION: u8 = 0x05;

pub const COMMAND_AUTHENTICATE: u8 = 0x00;
pub const COMMAND_CONNECT: u8 = 0x01;
pub const COMMAND_PACKET: u8 = 0x02;
pub const COMMAND_DISSOCIATE: u8 = 0x03;
pub const COMMAND_HEARTBEAT: u8 = 0x04;

pub const ADDRESS_FQDN: u8 = 0x00;
pub const ADDRESS_IPV4: u8 = 0x01;
pub const ADDRESS_IPV6: u8 = 0x02;
pub const ADDRESS_NONE: u8 = 0xff;

pub const TOKEN_LEN: usize = 32;

/// Session IDs are 16 bits on the wire.
pub const MAX_SESSION_ID: u32 = u16::MAX as u32;

/// Largest payload a single packet command can describe.
pub const MAX_PACKET_DATA_LEN: usize = u16::MAX as usize;

// version, type, session id, packet id, fragment total, fragment id, size
const PACKET_HEADER_LEN: usize = 2 + 2 + 2 + 1 + 1 + 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Authenticate { uuid: Uuid, token: [u8; TOKEN_LEN] },
    Connect { destination: NetLocation },
    Packet(UdpMessage),
    Dissociate { session_id: u16 },
    Heartbeat,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Authenticate { .. } => "authenticate",
            Command::Connect { .. } => "connect",
            Command::Packet(_) => "packet",
            Command::Dissociate { .. } => "dissociate",
            Command::Heartbeat => "heartbeat",
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> std::io::Result<()> {
        match self {
            Command::Authenticate { uuid, token } => {
                buf.put_slice(&[VERSION, COMMAND_AUTHENTICATE]);
                buf.put_slice(uuid);
                buf.put_slice(token);
            }
            Command::Connect { destination } => {
                buf.put_slice(&[VERSION, COMMAND_CONNECT]);
                put_address(buf, Some(destination))?;
            }
            Command::Packet(message) => encode_packet(message, buf)?,
            Command::Dissociate { session_id } => {
                buf.put_slice(&[VERSION, COMMAND_DISSOCIATE]);
                buf.put_u16(*session_id);
            }
            Command::Heartbeat => buf.put_slice(&[VERSION, COMMAND_HEARTBEAT]),
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> std::io::Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Parses one command filling a whole datagram.
    pub fn decode(mut data: Bytes) -> std::io::Result<Self> {
        ensure(&data, 2)?;
        let version = data.get_u8();
        check_version(version)?;
        let command = match data.get_u8() {
            COMMAND_AUTHENTICATE => {
                ensure(&data, 16 + TOKEN_LEN)?;
                let mut uuid = [0u8; 16];
                data.copy_to_slice(&mut uuid);
                let mut token = [0u8; TOKEN_LEN];
                data.copy_to_slice(&mut token);
                Command::Authenticate { uuid, token }
            }
            COMMAND_CONNECT => {
                let destination = decode_address(&mut data)?.ok_or_else(missing_address)?;
                Command::Connect { destination }
            }
            COMMAND_PACKET => {
                ensure(&data, PACKET_HEADER_LEN - 2)?;
                let session_id = data.get_u16();
                let packet_id = data.get_u16();
                let fragment_total = data.get_u8();
                let fragment_id = data.get_u8();
                let size = data.get_u16() as usize;
                let destination = decode_address(&mut data)?;
                ensure(&data, size)?;
                Command::Packet(UdpMessage {
                    session_id: session_id as u32,
                    packet_id,
                    fragment_id,
                    fragment_total,
                    destination,
                    data: data.split_to(size),
                })
            }
            COMMAND_DISSOCIATE => {
                ensure(&data, 2)?;
                Command::Dissociate {
                    session_id: data.get_u16(),
                }
            }
            COMMAND_HEARTBEAT => Command::Heartbeat,
            unknown => return Err(unknown_command(unknown)),
        };
        Ok(command)
    }

    /// Reads one command from the front of a stream. Connect commands are
    /// followed by payload that is left unread.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Self> {
        let mut header = [0u8; 2];
        reader.read_exact(&mut header).await?;
        check_version(header[0])?;
        let command = match header[1] {
            COMMAND_AUTHENTICATE => {
                let mut uuid = [0u8; 16];
                reader.read_exact(&mut uuid).await?;
                let mut token = [0u8; TOKEN_LEN];
                reader.read_exact(&mut token).await?;
                Command::Authenticate { uuid, token }
            }
            COMMAND_CONNECT => {
                let destination = read_address(reader).await?.ok_or_else(missing_address)?;
                Command::Connect { destination }
            }
            COMMAND_PACKET => {
                let session_id = reader.read_u16().await?;
                let packet_id = reader.read_u16().await?;
                let fragment_total = reader.read_u8().await?;
                let fragment_id = reader.read_u8().await?;
                let size = reader.read_u16().await? as usize;
                let destination = read_address(reader).await?;
                let mut data = vec![0u8; size];
                reader.read_exact(&mut data).await?;
                Command::Packet(UdpMessage {
                    session_id: session_id as u32,
                    packet_id,
                    fragment_id,
                    fragment_total,
                    destination,
                    data: data.into(),
                })
            }
            COMMAND_DISSOCIATE => Command::Dissociate {
                session_id: reader.read_u16().await?,
            },
            COMMAND_HEARTBEAT => Command::Heartbeat,
            unknown => return Err(unknown_command(unknown)),
        };
        Ok(command)
    }
}

fn encode_packet(message: &UdpMessage, buf: &mut BytesMut) -> std::io::Result<()> {
    if message.data.len() > MAX_PACKET_DATA_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("packet of {} bytes is too large", message.data.len()),
        ));
    }
    let session_id = u16::try_from(message.session_id).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("session id {} out of range", message.session_id),
        )
    })?;
    buf.put_slice(&[VERSION, COMMAND_PACKET]);
    buf.put_u16(session_id);
    buf.put_u16(message.packet_id);
    buf.put_u8(message.fragment_total);
    buf.put_u8(message.fragment_id);
    buf.put_u16(message.data.len() as u16);
    put_address(buf, message.destination.as_ref())?;
    buf.put_slice(&message.data);
    Ok(())
}

pub fn address_len(location: Option<&NetLocation>) -> usize {
    match location.map(NetLocation::address) {
        None => 1,
        Some(Address::Hostname(hostname)) => 1 + 1 + hostname.len() + 2,
        Some(Address::Ipv4(_)) => 1 + 4 + 2,
        Some(Address::Ipv6(_)) => 1 + 16 + 2,
    }
}

pub fn put_address(buf: &mut BytesMut, location: Option<&NetLocation>) -> std::io::Result<()> {
    let Some(location) = location else {
        buf.put_u8(ADDRESS_NONE);
        return Ok(());
    };
    match location.address() {
        Address::Hostname(hostname) => {
            if hostname.len() > MAX_HOSTNAME_LEN {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("hostname too long: {hostname}"),
                ));
            }
            buf.put_u8(ADDRESS_FQDN);
            buf.put_u8(hostname.len() as u8);
            buf.put_slice(hostname.as_bytes());
        }
        Address::Ipv4(ip) => {
            buf.put_u8(ADDRESS_IPV4);
            buf.put_slice(&ip.octets());
        }
        Address::Ipv6(ip) => {
            buf.put_u8(ADDRESS_IPV6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(location.port());
    Ok(())
}

fn decode_address(data: &mut Bytes) -> std::io::Result<Option<NetLocation>> {
    ensure(data, 1)?;
    let address = match data.get_u8() {
        ADDRESS_NONE => return Ok(None),
        ADDRESS_FQDN => {
            ensure(data, 1)?;
            let len = data.get_u8() as usize;
            ensure(data, len)?;
            hostname_address(&data.split_to(len))?
        }
        ADDRESS_IPV4 => {
            ensure(data, 4)?;
            let mut octets = [0u8; 4];
            data.copy_to_slice(&mut octets);
            Address::Ipv4(octets.into())
        }
        ADDRESS_IPV6 => {
            ensure(data, 16)?;
            let mut octets = [0u8; 16];
            data.copy_to_slice(&mut octets);
            Address::Ipv6(octets.into())
        }
        unknown => return Err(unknown_address_type(unknown)),
    };
    ensure(data, 2)?;
    Ok(Some(NetLocation::new(address, data.get_u16())))
}

async fn read_address<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<NetLocation>> {
    let address = match reader.read_u8().await? {
        ADDRESS_NONE => return Ok(None),
        ADDRESS_FQDN => {
            let len = reader.read_u8().await? as usize;
            let mut hostname = vec![0u8; len];
            reader.read_exact(&mut hostname).await?;
            hostname_address(&hostname)?
        }
        ADDRESS_IPV4 => {
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await?;
            Address::Ipv4(octets.into())
        }
        ADDRESS_IPV6 => {
            let mut octets = [0u8; 16];
            reader.read_exact(&mut octets).await?;
            Address::Ipv6(octets.into())
        }
        unknown => return Err(unknown_address_type(unknown)),
    };
    let port = reader.read_u16().await?;
    Ok(Some(NetLocation::new(address, port)))
}

fn hostname_address(hostname: &[u8]) -> std::io::Result<Address> {
    let hostname = std::str::from_utf8(hostname).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("hostname is not utf-8: {e}"),
        )
    })?;
    Ok(Address::Hostname(hostname.to_string()))
}

fn check_version(version: u8) -> std::io::Result<()> {
    if version != VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unsupported tuic version: {version}"),
        ));
    }
    Ok(())
}

fn ensure(data: &Bytes, len: usize) -> std::io::Result<()> {
    if data.remaining() < len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("truncated command: need {len} bytes, have {}", data.remaining()),
        ));
    }
    Ok(())
}

fn missing_address() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, "connect without address")
}

fn unknown_command(command: u8) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("unknown tuic command: {command:#04x}"),
    )
}

fn unknown_address_type(address_type: u8) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("unknown address type: {address_type:#04x}"),
    )
}

/// The 32-byte token proving knowledge of `password`, exported from the TLS
/// session so it can't be replayed on another connection.
pub fn auth_token(
    connection: &quinn::Connection,
    uuid: &Uuid,
    password: &[u8],
) -> std::io::Result<[u8; TOKEN_LEN]> {
    let mut token = [0u8; TOKEN_LEN];
    connection
        .export_keying_material(&mut token, uuid, password)
        .map_err(|e| std::io::Error::other(format!("failed to export keying material: {e:?}")))?;
    Ok(token)
}

/// Packet commands as datagrams. Only the first fragment of a packet names
/// the destination.
#[derive(Debug, Clone, Copy, Default)]
pub struct TuicCodec;

impl PacketCodec for TuicCodec {
    fn encode(&self, message: &UdpMessage, buf: &mut BytesMut) -> std::io::Result<()> {
        encode_packet(message, buf)
    }

    fn header_len(&self, destination: Option<&NetLocation>) -> usize {
        PACKET_HEADER_LEN + address_len(destination)
    }

    fn repeats_destination(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::congestion::{CongestionControlKind, QuinnControllerFactory};
    use crate::quic_util::{
        CLIENT_IDLE_TIMEOUT, client_config, client_endpoint, server_config, server_crypto,
        transport_config,
    };
    use crate::test_util::test_tls;
    use crate::udp_session::fragment_message;

    async fn connected_pair() -> (
        [quinn::Endpoint; 2],
        quinn::Connection,
        quinn::Connection,
    ) {
        let tls = test_tls(&["h3"], false);
        let transport = || {
            transport_config(
                QuinnControllerFactory::new(CongestionControlKind::Cubic).into_arc(),
                CLIENT_IDLE_TIMEOUT,
            )
            .unwrap()
        };
        let server = quinn::Endpoint::server(
            server_config(server_crypto(Arc::new(tls.server)).unwrap(), transport()),
            "127.0.0.1:0".parse().unwrap(),
        )
        .unwrap();
        let server_address = server.local_addr().unwrap();
        let accepting = server.clone();
        let accepted = tokio::spawn(async move {
            accepting.accept().await.unwrap().await.unwrap()
        });

        let client = client_endpoint(server_address).unwrap();
        let client_connection = client
            .connect_with(
                client_config(tls.client, transport()).unwrap(),
                server_address,
                "localhost",
            )
            .unwrap()
            .await
            .unwrap();
        let server_connection = accepted.await.unwrap();
        ([client, server], client_connection, server_connection)
    }

    #[tokio::test]
    async fn test_auth_token_binds_connection_and_credentials() {
        let (_endpoints, client_connection, server_connection) = connected_pair().await;
        let uuid: Uuid = *b"0123456789abcdef";
        let password = b"password".to_vec();

        let token = auth_token(&client_connection, &uuid, &password).unwrap();
        assert_eq!(
            auth_token(&client_connection, &uuid, &password).unwrap(),
            token
        );
        assert_eq!(
            auth_token(&server_connection, &uuid, &password).unwrap(),
            token
        );

        for bit in 0..uuid.len() * 8 {
            let mut other = uuid;
            other[bit / 8] ^= 1 << (bit % 8);
            assert_ne!(
                auth_token(&client_connection, &other, &password).unwrap(),
                token,
                "uuid bit {bit}"
            );
        }
        for bit in 0..password.len() * 8 {
            let mut other = password.clone();
            other[bit / 8] ^= 1 << (bit % 8);
            assert_ne!(
                auth_token(&server_connection, &uuid, &other).unwrap(),
                token,
                "password bit {bit}"
            );
        }
        assert_ne!(auth_token(&client_connection, &uuid, b"").unwrap(), token);

        client_connection.close(0u32.into(), b"");
    }

    fn location(s: &str) -> NetLocation {
        NetLocation::from_str(s, None).unwrap()
    }

    #[test]
    fn test_packet_layout() {
        let message = UdpMessage {
            session_id: 0x0102,
            packet_id: 0x0304,
            fragment_id: 0,
            fragment_total: 1,
            destination: Some(location("1.2.3.4:53")),
            data: Bytes::from_static(b"abc"),
        };
        let encoded = Command::Packet(message.clone()).to_bytes().unwrap();
        assert_eq!(
            &encoded[..],
            &[
                5, 2, 0x01, 0x02, 0x03, 0x04, 1, 0, 0, 3, ADDRESS_IPV4, 1, 2, 3, 4, 0, 53, b'a',
                b'b', b'c'
            ]
        );
        assert_eq!(
            encoded.len(),
            TuicCodec.header_len(message.destination.as_ref()) + 3
        );
        assert_eq!(Command::decode(encoded).unwrap(), Command::Packet(message));
    }

    #[test]
    fn test_address_forms() {
        for destination in [
            Some(location("example.com:443")),
            Some(location("[2001:db8::1]:8443")),
            Some(location("127.0.0.1:1")),
            None,
        ] {
            let mut buf = BytesMut::new();
            put_address(&mut buf, destination.as_ref()).unwrap();
            assert_eq!(buf.len(), address_len(destination.as_ref()));
            let mut bytes = buf.freeze();
            assert_eq!(decode_address(&mut bytes).unwrap(), destination);
            assert!(bytes.is_empty());
        }
    }

    #[test]
    fn test_fqdn_bytes() {
        let mut buf = BytesMut::new();
        put_address(&mut buf, Some(&location("a.io:80"))).unwrap();
        assert_eq!(&buf[..], &[ADDRESS_FQDN, 4, b'a', b'.', b'i', b'o', 0, 80]);
    }

    #[test]
    fn test_control_commands() {
        let heartbeat = Command::Heartbeat.to_bytes().unwrap();
        assert_eq!(&heartbeat[..], &[5, 4]);
        let dissociate = Command::Dissociate { session_id: 258 }.to_bytes().unwrap();
        assert_eq!(&dissociate[..], &[5, 3, 1, 2]);
        assert_eq!(
            Command::decode(dissociate).unwrap(),
            Command::Dissociate { session_id: 258 }
        );

        let authenticate = Command::Authenticate {
            uuid: [7; 16],
            token: [9; 32],
        };
        let encoded = authenticate.to_bytes().unwrap();
        assert_eq!(encoded.len(), 2 + 16 + 32);
        assert_eq!(Command::decode(encoded).unwrap(), authenticate);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(Command::decode(Bytes::from_static(&[4, 4])).is_err());
        assert!(Command::decode(Bytes::from_static(&[5, 9])).is_err());
        assert!(Command::decode(Bytes::from_static(&[5])).is_err());
        assert!(Command::decode(Bytes::from_static(&[5, 2, 0, 1, 0, 1, 1, 0, 0, 5, 0xff, 1])).is_err());
        assert!(Command::decode(Bytes::from_static(&[5, 1, 0x07, 0, 0])).is_err());
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let message = UdpMessage::new(
            1,
            1,
            location("1.1.1.1:53"),
            vec![0u8; MAX_PACKET_DATA_LEN + 1].into(),
        );
        assert!(Command::Packet(message).to_bytes().is_err());
        let long_host = NetLocation::new(Address::Hostname("a".repeat(256)), 1);
        assert!(Command::Connect { destination: long_host }.to_bytes().is_err());
    }

    #[test]
    fn test_only_first_fragment_has_address() {
        let message = UdpMessage::new(1, 1, location("example.com:53"), vec![1u8; 3000].into());
        let fragments = fragment_message(message, 1200, &TuicCodec).unwrap();
        assert_eq!(fragments.len(), 3);
        for fragment in fragments.iter() {
            let encoded = Command::Packet(fragment.clone()).to_bytes().unwrap();
            assert!(encoded.len() <= 1200);
            let Command::Packet(decoded) = Command::decode(encoded).unwrap() else {
                panic!("not a packet");
            };
            assert_eq!(decoded.destination.is_some(), decoded.fragment_id == 0);
        }
    }

    #[tokio::test]
    async fn test_read_connect_leaves_payload() {
        let mut buf = BytesMut::new();
        Command::Connect {
            destination: location("example.com:80"),
        }
        .encode(&mut buf)
        .unwrap();
        buf.put_slice(b"GET /");
        let data = buf.freeze();
        let mut reader = &data[..];
        let command = Command::read_from(&mut reader).await.unwrap();
        assert_eq!(
            command,
            Command::Connect {
                destination: location("example.com:80")
            }
        );
        assert_eq!(reader, b"GET /");
    }

    #[tokio::test]
    async fn test_read_packet_from_stream() {
        let message = UdpMessage::new(3, 4, location("[::1]:5353"), Bytes::from_static(b"dns"));
        let data = Command::Packet(message.clone()).to_bytes().unwrap();
        let mut reader = &data[..];
        assert_eq!(
            Command::read_from(&mut reader).await.unwrap(),
            Command::Packet(message)
        );
        let truncated = &data[..data.len() - 1];
        let mut reader = truncated;
        assert!(Command::read_from(&mut reader).await.is_err());
    }
}
