//! QUIC variable-length integers (RFC 9000 section 16).

use bytes::BufMut;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const MAX_VARINT: u64 = (1 << 62) - 1;

/// Number of bytes `value` takes on the wire.
pub fn varint_len(value: u64) -> usize {
    if value < (1 << 6) {
        1
    } else if value < (1 << 14) {
        2
    } else if value < (1 << 30) {
        4
    } else {
        8
    }
}

pub fn put_varint<B: BufMut>(buf: &mut B, value: u64) -> std::io::Result<()> {
    if value < (1 << 6) {
        buf.put_u8(value as u8);
    } else if value < (1 << 14) {
        buf.put_u16(value as u16 | 0x4000);
    } else if value < (1 << 30) {
        buf.put_u32(value as u32 | 0x8000_0000);
    } else if value <= MAX_VARINT {
        buf.put_u64(value | 0xc000_0000_0000_0000);
    } else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("value too large to encode as varint: {value}"),
        ));
    }
    Ok(())
}

/// Decodes a varint from the front of `data`, returning the value and the
/// number of bytes consumed.
pub fn decode_varint(data: &[u8]) -> std::io::Result<(u64, usize)> {
    let first = *data.first().ok_or_else(truncated)?;
    let len = 1usize << (first >> 6);
    if data.len() < len {
        return Err(truncated());
    }
    let mut value = (first & 0b0011_1111) as u64;
    for byte in &data[1..len] {
        value = (value << 8) | *byte as u64;
    }
    Ok((value, len))
}

pub async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<u64> {
    let first = reader.read_u8().await?;
    let len = 1usize << (first >> 6);
    let mut value = (first & 0b0011_1111) as u64;
    if len > 1 {
        let mut rest = [0u8; 7];
        reader.read_exact(&mut rest[..len - 1]).await?;
        for byte in &rest[..len - 1] {
            value = (value << 8) | *byte as u64;
        }
    }
    Ok(value)
}

fn truncated() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated varint")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_boundaries() {
        let cases: [(u64, &[u8]); 8] = [
            (0, &[0x00]),
            (63, &[0x3f]),
            (64, &[0x40, 0x40]),
            (16383, &[0x7f, 0xff]),
            (16384, &[0x80, 0x00, 0x40, 0x00]),
            ((1 << 30) - 1, &[0xbf, 0xff, 0xff, 0xff]),
            (1 << 30, &[0xc0, 0, 0, 0, 0x40, 0, 0, 0]),
            (MAX_VARINT, &[0xff; 8]),
        ];
        for (value, expected) in cases {
            let mut buf = BytesMut::new();
            put_varint(&mut buf, value).unwrap();
            assert_eq!(&buf[..], expected, "encoding {value}");
            assert_eq!(varint_len(value), expected.len());
            assert_eq!(decode_varint(expected).unwrap(), (value, expected.len()));
        }
    }

    #[test]
    fn test_rfc_example() {
        let data = [0x9d, 0x7f, 0x3e, 0x7d, 0xff];
        assert_eq!(decode_varint(&data).unwrap(), (494_878_333, 4));
    }

    #[test]
    fn test_too_large() {
        let mut buf = BytesMut::new();
        assert!(put_varint(&mut buf, MAX_VARINT + 1).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_truncated() {
        assert!(decode_varint(&[]).is_err());
        assert!(decode_varint(&[0x40]).is_err());
        assert!(decode_varint(&[0xc0, 0, 0]).is_err());
    }

    #[tokio::test]
    async fn test_read_varint() {
        let data: &[u8] = &[0x44, 0x01, 0x25, 0x7f];
        let mut reader = data;
        assert_eq!(read_varint(&mut reader).await.unwrap(), 0x401);
        assert_eq!(read_varint(&mut reader).await.unwrap(), 0x25);
        assert!(read_varint(&mut reader).await.is_err());
    }
}
