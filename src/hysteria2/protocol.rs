//! Hysteria2 framing: the HTTP/3 auth exchange, TCP request and response
//! frames, and UDP messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::address::NetLocation;
use crate::congestion::Bandwidth;
use crate::udp_session::{PacketCodec, UdpMessage};
use crate::util::random_padding;
use crate::varint::{decode_varint, put_varint, read_varint, varint_len};

pub const AUTH_HOST: &str = "hysteria";
pub const AUTH_PATH: &str = "/auth";
pub const AUTH_URI: &str = "https://hysteria/auth";

/// Status code of a successful auth response.
pub const STATUS_AUTH_OK: u16 = 233;

pub mod header {
    pub const AUTH: &str = "Hysteria-Auth";
    pub const UDP: &str = "Hysteria-UDP";
    pub const CC_RX: &str = "Hysteria-CC-RX";
    pub const PADDING: &str = "Hysteria-Padding";
}

/// The server tells the client to pick its own rate with this CC-RX value.
pub const CC_RX_AUTO: &str = "auto";

pub const FRAME_TYPE_TCP_REQUEST: u64 = 0x401;

pub const TCP_STATUS_OK: u8 = 0x00;
pub const TCP_STATUS_ERROR: u8 = 0x01;

pub const MAX_ADDRESS_LENGTH: usize = 2048;
pub const MAX_MESSAGE_LENGTH: usize = 2048;
pub const MAX_PADDING_LENGTH: usize = 4096;

pub const AUTH_PADDING: (usize, usize) = (256, 2048);
pub const TCP_REQUEST_PADDING: (usize, usize) = (64, 512);
pub const TCP_RESPONSE_PADDING: (usize, usize) = (128, 1024);

pub const BYTES_PER_MBPS: Bandwidth = 125_000;

pub fn mbps_to_bps(mbps: u64) -> Bandwidth {
    mbps.saturating_mul(BYTES_PER_MBPS)
}

/// A `Hysteria-CC-RX` value: a rate in bytes per second or `auto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveRate {
    Auto,
    Bps(Bandwidth),
}

impl ReceiveRate {
    /// Unparseable values count as 0, meaning unknown.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(CC_RX_AUTO) => ReceiveRate::Auto,
            Some(value) => ReceiveRate::Bps(value.parse().unwrap_or(0)),
            None => ReceiveRate::Bps(0),
        }
    }

    pub fn header_value(&self) -> String {
        match self {
            ReceiveRate::Auto => CC_RX_AUTO.to_string(),
            ReceiveRate::Bps(bps) => bps.to_string(),
        }
    }
}

/// How a server picks its send rate for a client: Brutal at the lower of the
/// two rates when the client reported one and the server honors it, BBR
/// otherwise.
pub fn server_send_rate(
    ignore_client_bandwidth: bool,
    client_rx: Bandwidth,
    server_tx: Bandwidth,
) -> Option<Bandwidth> {
    if ignore_client_bandwidth || client_rx == 0 {
        return None;
    }
    if server_tx > 0 && server_tx < client_rx {
        Some(server_tx)
    } else {
        Some(client_rx)
    }
}

/// How a client picks its send rate from the server's answer. `None` means
/// BBR.
pub fn client_send_rate(server_rx: ReceiveRate, client_tx: Bandwidth) -> Option<Bandwidth> {
    let server_rx = match server_rx {
        ReceiveRate::Auto => return None,
        ReceiveRate::Bps(bps) => bps,
    };
    let actual_tx = if server_rx == 0 || server_rx > client_tx {
        client_tx
    } else {
        server_rx
    };
    (actual_tx > 0).then_some(actual_tx)
}

pub fn encode_tcp_request(destination: &NetLocation) -> std::io::Result<Bytes> {
    let address = destination.to_string();
    let padding = random_padding(TCP_REQUEST_PADDING.0, TCP_REQUEST_PADDING.1);
    let mut buf = BytesMut::with_capacity(
        varint_len(FRAME_TYPE_TCP_REQUEST)
            + varint_len(address.len() as u64)
            + address.len()
            + varint_len(padding.len() as u64)
            + padding.len(),
    );
    put_varint(&mut buf, FRAME_TYPE_TCP_REQUEST)?;
    put_varint(&mut buf, address.len() as u64)?;
    buf.put_slice(address.as_bytes());
    put_varint(&mut buf, padding.len() as u64)?;
    buf.put_slice(padding.as_bytes());
    Ok(buf.freeze())
}

/// Reads a TCP request after its frame type.
pub async fn read_tcp_request<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<NetLocation> {
    let address_len = read_varint(reader).await? as usize;
    if address_len == 0 || address_len > MAX_ADDRESS_LENGTH {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid address length: {address_len}"),
        ));
    }
    let mut address = vec![0u8; address_len];
    reader.read_exact(&mut address).await?;
    skip_padding(reader).await?;
    parse_address(&address)
}

pub fn encode_tcp_response(ok: bool, message: &str) -> std::io::Result<Bytes> {
    let padding = random_padding(TCP_RESPONSE_PADDING.0, TCP_RESPONSE_PADDING.1);
    let message = &message.as_bytes()[..message.len().min(MAX_MESSAGE_LENGTH)];
    let mut buf = BytesMut::with_capacity(1 + 2 + message.len() + 2 + padding.len());
    buf.put_u8(if ok { TCP_STATUS_OK } else { TCP_STATUS_ERROR });
    put_varint(&mut buf, message.len() as u64)?;
    buf.put_slice(message);
    put_varint(&mut buf, padding.len() as u64)?;
    buf.put_slice(padding.as_bytes());
    Ok(buf.freeze())
}

pub fn tcp_error_response(message: &str) -> std::io::Result<Bytes> {
    encode_tcp_response(false, message)
}

/// Reads a TCP response; a rejection becomes a `ConnectionRefused` error
/// carrying the server's message.
pub async fn read_tcp_response<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<()> {
    let status = reader.read_u8().await?;
    let message_len = read_varint(reader).await? as usize;
    if message_len > MAX_MESSAGE_LENGTH {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid message length: {message_len}"),
        ));
    }
    let mut message = vec![0u8; message_len];
    reader.read_exact(&mut message).await?;
    skip_padding(reader).await?;
    if status != TCP_STATUS_OK {
        return Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            format!(
                "server rejected connection: {}",
                String::from_utf8_lossy(&message)
            ),
        ));
    }
    Ok(())
}

async fn skip_padding<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<()> {
    let padding_len = read_varint(reader).await?;
    if padding_len as usize > MAX_PADDING_LENGTH {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid padding length: {padding_len}"),
        ));
    }
    let mut padding = AsyncReadExt::take(&mut *reader, padding_len);
    let skipped = tokio::io::copy(&mut padding, &mut tokio::io::sink()).await?;
    if skipped != padding_len {
        return Err(std::io::ErrorKind::UnexpectedEof.into());
    }
    Ok(())
}

fn parse_address(address: &[u8]) -> std::io::Result<NetLocation> {
    let address = std::str::from_utf8(address).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("address is not utf-8: {e}"),
        )
    })?;
    NetLocation::from_str(address, None)
}

// session id, packet id, fragment id, fragment count
const UDP_HEADER_LEN: usize = 4 + 2 + 1 + 1;

pub fn decode_udp_message(mut data: Bytes) -> std::io::Result<UdpMessage> {
    if data.len() < UDP_HEADER_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "truncated udp message",
        ));
    }
    let session_id = data.get_u32();
    let packet_id = data.get_u16();
    let fragment_id = data.get_u8();
    let fragment_total = data.get_u8();
    let (address_len, consumed) = decode_varint(&data)?;
    data.advance(consumed);
    let address_len = address_len as usize;
    if address_len == 0 || address_len > MAX_MESSAGE_LENGTH || address_len > data.len() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid address length: {address_len}"),
        ));
    }
    let destination = parse_address(&data.split_to(address_len))?;
    Ok(UdpMessage {
        session_id,
        packet_id,
        fragment_id,
        fragment_total,
        destination: Some(destination),
        data,
    })
}

/// UDP messages as datagrams. Every fragment repeats the address.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hysteria2Codec;

impl PacketCodec for Hysteria2Codec {
    fn encode(&self, message: &UdpMessage, buf: &mut BytesMut) -> std::io::Result<()> {
        let address = message
            .destination
            .as_ref()
            .map(ToString::to_string)
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "udp message without address")
            })?;
        buf.put_u32(message.session_id);
        buf.put_u16(message.packet_id);
        buf.put_u8(message.fragment_id);
        buf.put_u8(message.fragment_total);
        put_varint(buf, address.len() as u64)?;
        buf.put_slice(address.as_bytes());
        buf.put_slice(&message.data);
        Ok(())
    }

    fn header_len(&self, destination: Option<&NetLocation>) -> usize {
        let address_len = destination.map(|d| d.to_string().len()).unwrap_or(0);
        UDP_HEADER_LEN + varint_len(address_len as u64) + address_len
    }

    fn repeats_destination(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::udp_session::fragment_message;

    fn location(s: &str) -> NetLocation {
        NetLocation::from_str(s, None).unwrap()
    }

    #[test]
    fn test_udp_message_layout() {
        let message = UdpMessage {
            session_id: 0x01020304,
            packet_id: 0x0506,
            fragment_id: 1,
            fragment_total: 2,
            destination: Some(location("a.io:53")),
            data: Bytes::from_static(b"xyz"),
        };
        let mut buf = BytesMut::new();
        Hysteria2Codec.encode(&message, &mut buf).unwrap();
        let mut expected = vec![1, 2, 3, 4, 5, 6, 1, 2, 7];
        expected.extend_from_slice(b"a.io:53xyz");
        assert_eq!(&buf[..], &expected[..]);
        assert_eq!(buf.len(), Hysteria2Codec.header_len(message.destination.as_ref()) + 3);
        assert_eq!(decode_udp_message(buf.freeze()).unwrap(), message);
    }

    #[test]
    fn test_udp_message_ipv6_address() {
        let message = UdpMessage::new(1, 2, location("[::1]:443"), Bytes::from_static(b"q"));
        let mut buf = BytesMut::new();
        Hysteria2Codec.encode(&message, &mut buf).unwrap();
        assert!(buf.windows(9).any(|w| w == b"[::1]:443"));
        assert_eq!(decode_udp_message(buf.freeze()).unwrap(), message);
    }

    #[test]
    fn test_rejects_bad_udp_messages() {
        assert!(decode_udp_message(Bytes::from_static(&[0, 0, 0, 1, 0, 1, 0])).is_err());
        // zero address length
        assert!(decode_udp_message(Bytes::from_static(&[0, 0, 0, 1, 0, 1, 0, 1, 0])).is_err());
        // address longer than the message
        assert!(decode_udp_message(Bytes::from_static(&[0, 0, 0, 1, 0, 1, 0, 1, 5, b'a'])).is_err());
        // 2049 bytes
        let mut data = vec![0, 0, 0, 1, 0, 1, 0, 1, 0x48, 0x01];
        data.extend(std::iter::repeat_n(b'a', 2049));
        assert!(decode_udp_message(data.into()).is_err());
    }

    #[test]
    fn test_every_fragment_has_address() {
        let message = UdpMessage::new(9, 1, location("example.com:53"), vec![7u8; 5000].into());
        let fragments = fragment_message(message, 1200, &Hysteria2Codec).unwrap();
        assert_eq!(fragments.len(), 5);
        for fragment in fragments {
            let mut buf = BytesMut::new();
            Hysteria2Codec.encode(&fragment, &mut buf).unwrap();
            assert!(buf.len() <= 1200);
            assert!(decode_udp_message(buf.freeze()).unwrap().destination.is_some());
        }
    }

    #[tokio::test]
    async fn test_tcp_request() {
        let request = encode_tcp_request(&location("example.com:443")).unwrap();
        let mut reader = &request[..];
        assert_eq!(read_varint(&mut reader).await.unwrap(), FRAME_TYPE_TCP_REQUEST);
        assert_eq!(
            read_tcp_request(&mut reader).await.unwrap(),
            location("example.com:443")
        );
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_tcp_request_limits() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 0).unwrap();
        assert!(read_tcp_request(&mut &buf[..]).await.is_err());

        let mut buf = BytesMut::new();
        put_varint(&mut buf, 7).unwrap();
        buf.put_slice(b"a.io:80");
        put_varint(&mut buf, 4097).unwrap();
        assert!(read_tcp_request(&mut &buf[..]).await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_response() {
        let ok = encode_tcp_response(true, "").unwrap();
        let mut with_payload = ok.to_vec();
        with_payload.extend_from_slice(b"payload");
        let mut reader = &with_payload[..];
        read_tcp_response(&mut reader).await.unwrap();
        assert_eq!(reader, b"payload");

        let rejected = tcp_error_response("no route").unwrap();
        let error = read_tcp_response(&mut &rejected[..]).await.unwrap_err();
        assert_eq!(error.kind(), std::io::ErrorKind::ConnectionRefused);
        assert!(error.to_string().contains("no route"));
    }

    #[tokio::test]
    async fn test_tcp_response_truncates_long_message() {
        let message = "x".repeat(MAX_MESSAGE_LENGTH * 2);
        let rejected = tcp_error_response(&message).unwrap();
        let mut reader = &rejected[..];
        assert_eq!(reader.read_u8().await.unwrap(), TCP_STATUS_ERROR);
        assert_eq!(
            read_varint(&mut reader).await.unwrap() as usize,
            MAX_MESSAGE_LENGTH
        );

        let error = read_tcp_response(&mut &rejected[..]).await.unwrap_err();
        assert_eq!(error.kind(), std::io::ErrorKind::ConnectionRefused);
        assert!(error.to_string().contains(&message[..MAX_MESSAGE_LENGTH]));
    }

    #[test]
    fn test_receive_rate_header() {
        assert_eq!(ReceiveRate::parse(Some("auto")), ReceiveRate::Auto);
        assert_eq!(ReceiveRate::parse(Some("125000")), ReceiveRate::Bps(125_000));
        assert_eq!(ReceiveRate::parse(Some("fast")), ReceiveRate::Bps(0));
        assert_eq!(ReceiveRate::parse(None), ReceiveRate::Bps(0));
        assert_eq!(ReceiveRate::Bps(42).header_value(), "42");
        assert_eq!(ReceiveRate::Auto.header_value(), "auto");
    }

    #[test]
    fn test_server_send_rate() {
        assert_eq!(server_send_rate(true, 1000, 0), None);
        assert_eq!(server_send_rate(false, 0, 500), None);
        assert_eq!(server_send_rate(false, 1000, 500), Some(500));
        assert_eq!(server_send_rate(false, 1000, 0), Some(1000));
        assert_eq!(server_send_rate(false, 1000, 2000), Some(1000));
    }

    #[test]
    fn test_client_send_rate() {
        assert_eq!(client_send_rate(ReceiveRate::Auto, 1000), None);
        assert_eq!(client_send_rate(ReceiveRate::Bps(0), 1000), Some(1000));
        assert_eq!(client_send_rate(ReceiveRate::Bps(500), 1000), Some(500));
        assert_eq!(client_send_rate(ReceiveRate::Bps(2000), 1000), Some(1000));
        assert_eq!(client_send_rate(ReceiveRate::Bps(0), 0), None);
        assert_eq!(mbps_to_bps(100), 12_500_000);
    }
}
