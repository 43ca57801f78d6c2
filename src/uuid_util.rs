use std::fmt::Write;

use rand::RngCore;

pub type Uuid = [u8; 16];

/// Parses a UUID of any version, with or without dashes.
pub fn parse_uuid(uuid_str: &str) -> std::io::Result<Uuid> {
    let invalid = || {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid uuid: {uuid_str}"),
        )
    };

    let hex: Vec<u8> = uuid_str.bytes().filter(|&b| b != b'-').collect();
    if hex.len() != 32 {
        return Err(invalid());
    }
    let mut uuid = [0u8; 16];
    for (byte, pair) in uuid.iter_mut().zip(hex.chunks_exact(2)) {
        let high = (pair[0] as char).to_digit(16).ok_or_else(invalid)?;
        let low = (pair[1] as char).to_digit(16).ok_or_else(invalid)?;
        *byte = (high << 4 | low) as u8;
    }
    Ok(uuid)
}

/// Formats as lowercase 8-4-4-4-12.
pub fn format_uuid(uuid: &Uuid) -> String {
    let mut s = String::with_capacity(36);
    for (i, b) in uuid.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            s.push('-');
        }
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// A random version 4 UUID.
pub fn generate_uuid() -> String {
    let mut uuid = [0u8; 16];
    rand::rng().fill_bytes(&mut uuid);
    uuid[6] = (uuid[6] & 0x0f) | 0x40;
    uuid[8] = (uuid[8] & 0x3f) | 0x80;
    format_uuid(&uuid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_and_without_dashes() {
        let dashed = parse_uuid("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let plain = parse_uuid("550E8400E29B41D4A716446655440000").unwrap();
        assert_eq!(dashed, plain);
        assert_eq!(dashed[0], 0x55);
        assert_eq!(dashed[15], 0x00);
    }

    #[test]
    fn test_parse_accepts_any_version() {
        assert!(parse_uuid("550e8400-e29b-11d4-c716-446655440000").is_ok());
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_uuid("550e8400-e29b-41d4-a716-44665544000").is_err());
        assert!(parse_uuid("550e8400-e29b-41d4-a716-4466554400000").is_err());
        assert!(parse_uuid("zz0e8400-e29b-41d4-a716-446655440000").is_err());
    }

    #[test]
    fn test_generate_round_trip() {
        let generated = generate_uuid();
        assert_eq!(generated.len(), 36);
        let uuid = parse_uuid(&generated).unwrap();
        assert_eq!(uuid[6] >> 4, 4);
        assert_eq!(uuid[8] >> 6, 2);
        assert_eq!(format_uuid(&uuid), generated);
    }
}
