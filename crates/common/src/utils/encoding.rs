use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;

/// Encode one body chunk or socket message for the wire
pub fn encode_chunk(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode a base64 chunk from the wire
pub fn decode_chunk(encoded: &str) -> Result<Bytes, base64::DecodeError> {
    STANDARD.decode(encoded).map(Bytes::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_known_values() {
        assert_eq!(encode_chunk(b""), "");
        assert_eq!(encode_chunk(b"hello"), "aGVsbG8=");
        assert_eq!(encode_chunk(&[0x00, 0x01, 0xFF]), "AAH/");
    }

    #[test]
    fn test_decode_known_values() {
        assert_eq!(decode_chunk("").unwrap(), Bytes::new());
        assert_eq!(decode_chunk("aGVsbG8=").unwrap(), Bytes::from("hello"));
    }

    #[test]
    fn test_binary_roundtrip() {
        let data: Vec<u8> = (0..=255).collect();
        assert_eq!(decode_chunk(&encode_chunk(&data)).unwrap(), Bytes::from(data));
    }

    #[test]
    fn test_decode_rejects_invalid_input() {
        assert!(decode_chunk("not valid base64!!!").is_err());
        assert!(decode_chunk("aGVsbG8").is_err()); // missing padding
    }
}
