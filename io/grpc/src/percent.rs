//! Percent encoding for the `grpc-message` trailer.
//!
//! Printable ASCII other than `%` passes through unchanged. Every other byte
//! of the UTF-8 message is written as `%XX`.

/// Error returned when a `grpc-message` value cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PercentDecodeError {
    #[error("invalid percent escape at offset {0}")]
    InvalidEscape(usize),
    #[error("decoded message is not valid UTF-8")]
    InvalidUtf8,
}

fn needs_escape(byte: u8) -> bool {
    !(0x20..=0x7e).contains(&byte) || byte == b'%'
}

/// Percent-encode a status message for the wire.
pub fn encode(message: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";

    if !message.bytes().any(needs_escape) {
        return message.to_string();
    }

    let mut out = String::with_capacity(message.len() * 3);
    for byte in message.bytes() {
        if needs_escape(byte) {
            out.push('%');
            out.push(HEX[(byte >> 4) as usize] as char);
            out.push(HEX[(byte & 0x0f) as usize] as char);
        } else {
            out.push(byte as char);
        }
    }
    out
}

/// Decode a percent-encoded status message.
pub fn decode(value: &str) -> Result<String, PercentDecodeError> {
    if !value.contains('%') {
        return Ok(value.to_string());
    }

    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = bytes.get(i + 1).and_then(|b| hex_value(*b));
            let lo = bytes.get(i + 2).and_then(|b| hex_value(*b));
            match (hi, lo) {
                (Some(hi), Some(lo)) => out.push((hi << 4) | lo),
                _ => return Err(PercentDecodeError::InvalidEscape(i)),
            }
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8(out).map_err(|_| PercentDecodeError::InvalidUtf8)
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
