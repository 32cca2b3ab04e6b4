//! gRPC metadata (headers and trailers).

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;

pub const CONTENT_TYPE: &str = "content-type";
pub const TE: &str = "te";
pub const USER_AGENT: &str = "user-agent";
pub const GRPC_STATUS: &str = "grpc-status";
pub const GRPC_MESSAGE: &str = "grpc-message";
pub const GRPC_STATUS_DETAILS: &str = "grpc-status-details-bin";
pub const GRPC_TIMEOUT: &str = "grpc-timeout";
pub const GRPC_ENCODING: &str = "grpc-encoding";
pub const GRPC_ACCEPT_ENCODING: &str = "grpc-accept-encoding";

/// Content type for gRPC requests and responses.
pub const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// Suffix marking a binary-valued key.
pub const BINARY_SUFFIX: &str = "-bin";

/// Returns true for keys the call machinery owns. User supplied values for
/// these are never forwarded on the wire.
pub fn is_reserved(key: &str) -> bool {
    key.starts_with(':')
        || matches!(
            key,
            CONTENT_TYPE | TE | USER_AGENT | GRPC_TIMEOUT | GRPC_ENCODING | GRPC_ACCEPT_ENCODING
        )
}

/// Returns true when `key` names a binary (`-bin`) entry.
pub fn is_binary_key(key: &str) -> bool {
    key.len() > BINARY_SUFFIX.len() && key.to_ascii_lowercase().ends_with(BINARY_SUFFIX)
}

/// Check if the content type belongs to the `application/grpc` family.
pub fn is_grpc_content_type(value: &str) -> bool {
    let value = value.trim().as_bytes();
    let prefix = GRPC_CONTENT_TYPE.as_bytes();
    if !value
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    {
        return false;
    }
    matches!(value.get(prefix.len()), None | Some(b'+' | b';'))
}

/// gRPC metadata key-value pairs.
///
/// Metadata is used for headers (sent before the message) and
/// trailers (sent after the message with status). Binary values are
/// stored base64 encoded, which is also their wire representation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    /// Key-value pairs. Keys are lowercase ASCII.
    entries: HashMap<String, Vec<String>>,
}

impl Metadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key-value pair.
    ///
    /// Keys are normalized to lowercase. Multiple values for the same
    /// key are allowed.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into().to_ascii_lowercase();
        let value = value.into();

        self.entries.entry(key).or_default().push(value);
    }

    /// Insert a binary value. The key must end in `-bin`.
    pub fn insert_bin(&mut self, key: impl Into<String>, value: impl AsRef<[u8]>) {
        let key = key.into();
        debug_assert!(is_binary_key(&key), "binary metadata key must end in -bin");
        self.insert(key, STANDARD_NO_PAD.encode(value));
    }

    /// Get the first value for a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .and_then(|v| v.first())
            .map(|s| s.as_str())
    }

    /// Get all values for a key.
    pub fn get_all(&self, key: &str) -> Option<&[String]> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(|v| v.as_slice())
    }

    /// Get and decode the first binary value for a key.
    ///
    /// Returns `Some(Err(_))` when the stored value is not valid base64.
    pub fn get_bin(&self, key: &str) -> Option<Result<Bytes, base64::DecodeError>> {
        self.get(key).map(decode_binary)
    }

    /// Check if a key exists.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_ascii_lowercase())
    }

    /// Remove all values for a key.
    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.entries.remove(&key.to_ascii_lowercase())
    }

    /// Append every entry of `other`.
    pub fn extend(&mut self, other: Metadata) {
        for (key, values) in other.entries {
            self.entries.entry(key).or_default().extend(values);
        }
    }

    /// Iterate over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(k, values)| values.iter().map(move |v| (k.as_str(), v.as_str())))
    }

    /// Check if metadata is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get the number of entries (including duplicates).
    pub fn len(&self) -> usize {
        self.entries.values().map(|v| v.len()).sum()
    }
}

impl FromIterator<(String, String)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut metadata = Metadata::new();
        for (key, value) in iter {
            metadata.insert(key, value);
        }
        metadata
    }
}

/// Decode a base64 binary value. Peers may or may not pad.
fn decode_binary(value: &str) -> Result<Bytes, base64::DecodeError> {
    let trimmed = value.trim_end_matches('=');
    STANDARD_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD.decode(value))
        .map(Bytes::from)
}

/// Largest value representable in a `grpc-timeout` header.
const MAX_TIMEOUT_VALUE: u128 = 99_999_999;

const NANOS_PER_MICRO: u128 = 1_000;
const NANOS_PER_MILLI: u128 = 1_000_000;
const NANOS_PER_SEC: u128 = 1_000_000_000;
const NANOS_PER_MIN: u128 = 60 * NANOS_PER_SEC;
const NANOS_PER_HOUR: u128 = 60 * NANOS_PER_MIN;

/// Standard gRPC timeout format.
///
/// Format: `<value><unit>` where value has at most 8 digits and unit is:
/// - `n`: nanoseconds
/// - `u`: microseconds
/// - `m`: milliseconds
/// - `S`: seconds
/// - `M`: minutes
/// - `H`: hours
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    /// Timeout in nanoseconds.
    nanos: u128,
}

impl Timeout {
    /// Create a timeout from seconds.
    pub fn from_secs(secs: u64) -> Self {
        Self {
            nanos: secs as u128 * NANOS_PER_SEC,
        }
    }

    /// Create a timeout from milliseconds.
    pub fn from_millis(millis: u64) -> Self {
        Self {
            nanos: millis as u128 * NANOS_PER_MILLI,
        }
    }

    /// Create a timeout from a duration.
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            nanos: duration.as_nanos(),
        }
    }

    /// Get the timeout as a duration.
    pub fn as_duration(&self) -> Duration {
        let secs = u64::try_from(self.nanos / NANOS_PER_SEC).unwrap_or(u64::MAX);
        Duration::new(secs, (self.nanos % NANOS_PER_SEC) as u32)
    }

    /// Format as gRPC timeout header value.
    ///
    /// The largest unit that represents the value exactly is preferred.
    /// Otherwise the value is rounded up in the finest unit that fits in 8
    /// digits. Returns `None` when the timeout is too large to encode, in
    /// which case the header is omitted.
    pub fn to_grpc_format(self) -> Option<String> {
        const UNITS: [(u128, char); 6] = [
            (NANOS_PER_HOUR, 'H'),
            (NANOS_PER_MIN, 'M'),
            (NANOS_PER_SEC, 'S'),
            (NANOS_PER_MILLI, 'm'),
            (NANOS_PER_MICRO, 'u'),
            (1, 'n'),
        ];

        for (scale, unit) in UNITS {
            if self.nanos >= scale
                && self.nanos.is_multiple_of(scale)
                && self.nanos / scale <= MAX_TIMEOUT_VALUE
            {
                return Some(format!("{}{}", self.nanos / scale, unit));
            }
        }

        if self.nanos == 0 {
            return Some("0n".to_string());
        }

        for (scale, unit) in UNITS.iter().rev() {
            let value = self.nanos.div_ceil(*scale);
            if value <= MAX_TIMEOUT_VALUE {
                return Some(format!("{}{}", value, unit));
            }
        }

        None
    }

    /// Parse from gRPC timeout header value.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() < 2 || !s.is_ascii() {
            return None;
        }

        let (value_str, unit) = s.split_at(s.len() - 1);
        if value_str.len() > 8 || !value_str.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let value: u128 = value_str.parse().ok()?;

        let scale = match unit {
            "n" => 1,
            "u" => NANOS_PER_MICRO,
            "m" => NANOS_PER_MILLI,
            "S" => NANOS_PER_SEC,
            "M" => NANOS_PER_MIN,
            "H" => NANOS_PER_HOUR,
            _ => return None,
        };

        Some(Self {
            nanos: value * scale,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_insert_get() {
        let mut md = Metadata::new();
        md.insert("Content-Type", "application/grpc");

        assert_eq!(md.get("content-type"), Some("application/grpc"));
        assert_eq!(md.get("Content-Type"), Some("application/grpc"));
    }

    #[test]
    fn test_metadata_multiple_values() {
        let mut md = Metadata::new();
        md.insert("key", "value1");
        md.insert("key", "value2");

        assert_eq!(md.get("key"), Some("value1"));
        assert_eq!(
            md.get_all("key"),
            Some(&["value1".to_string(), "value2".to_string()][..])
        );
        assert_eq!(md.len(), 2);
    }

    #[test]
    fn test_metadata_remove() {
        let mut md = Metadata::new();
        md.insert("key", "value1");
        md.insert("KEY", "value2");

        assert_eq!(
            md.remove("key"),
            Some(vec!["value1".to_string(), "value2".to_string()])
        );
        assert!(md.is_empty());
        assert!(md.remove("key").is_none());
    }

    #[test]
    fn test_metadata_extend() {
        let mut a = Metadata::new();
        a.insert("x", "1");
        let mut b = Metadata::new();
        b.insert("x", "2");
        b.insert("y", "3");

        a.extend(b);
        assert_eq!(a.get_all("x").unwrap().len(), 2);
        assert_eq!(a.get("y"), Some("3"));
    }

    #[test]
    fn test_binary_values() {
        let mut md = Metadata::new();
        md.insert_bin("trace-bin", [0u8, 1, 2, 254, 255]);

        assert_eq!(md.get("trace-bin"), Some("AAEC/v8"));
        assert_eq!(
            md.get_bin("trace-bin").unwrap().unwrap(),
            Bytes::from_static(&[0, 1, 2, 254, 255])
        );
    }

    #[test]
    fn test_binary_values_padded() {
        let mut md = Metadata::new();
        md.insert("trace-bin", "AAEC/v8=");
        assert_eq!(md.get_bin("trace-bin").unwrap().unwrap().len(), 5);

        md.insert("bad-bin", "!!!");
        assert!(md.get_bin("bad-bin").unwrap().is_err());
        assert!(md.get_bin("absent-bin").is_none());
    }

    #[test]
    fn test_reserved_and_binary_keys() {
        assert!(is_reserved(":path"));
        assert!(is_reserved("te"));
        assert!(is_reserved("grpc-timeout"));
        assert!(!is_reserved("authorization"));

        assert!(is_binary_key("x-bin"));
        assert!(is_binary_key("X-BIN"));
        assert!(!is_binary_key("-bin"));
        assert!(!is_binary_key("binary"));
    }

    #[test]
    fn test_grpc_content_type() {
        assert!(is_grpc_content_type("application/grpc"));
        assert!(is_grpc_content_type("application/grpc+proto"));
        assert!(is_grpc_content_type("application/grpc; charset=utf-8"));
        assert!(is_grpc_content_type("Application/GRPC"));
        assert!(!is_grpc_content_type("application/grpcx"));
        assert!(!is_grpc_content_type("text/html"));
        assert!(!is_grpc_content_type(""));
        assert!(!is_grpc_content_type("application/grp\u{e9}"));
        assert!(!is_grpc_content_type("\u{e9}\u{e9}\u{e9}\u{e9}\u{e9}\u{e9}\u{e9}\u{e9}\u{e9}"));
    }

    #[test]
    fn test_timeout_exact_units() {
        assert_eq!(Timeout::from_secs(7200).to_grpc_format().unwrap(), "2H");
        assert_eq!(Timeout::from_secs(120).to_grpc_format().unwrap(), "2M");
        assert_eq!(Timeout::from_secs(5).to_grpc_format().unwrap(), "5S");
        assert_eq!(Timeout::from_millis(1500).to_grpc_format().unwrap(), "1500m");
        assert_eq!(
            Timeout::from_duration(Duration::from_micros(3)).to_grpc_format().unwrap(),
            "3u"
        );
        assert_eq!(
            Timeout::from_duration(Duration::from_nanos(42)).to_grpc_format().unwrap(),
            "42n"
        );
        assert_eq!(Timeout::from_millis(0).to_grpc_format().unwrap(), "0n");
    }

    #[test]
    fn test_timeout_rounds_up_to_fit_eight_digits() {
        // 123456789ns does not fit in 8 digits as nanoseconds.
        let timeout = Timeout::from_duration(Duration::from_nanos(123_456_789));
        assert_eq!(timeout.to_grpc_format().unwrap(), "123457u");
    }

    #[test]
    fn test_timeout_too_large_is_omitted() {
        let timeout = Timeout::from_duration(Duration::from_secs(100_000_000 * 3600));
        assert!(timeout.to_grpc_format().is_none());
        assert!(Timeout::from_duration(Duration::MAX).to_grpc_format().is_none());
    }

    #[test]
    fn test_timeout_parse() {
        assert_eq!(Timeout::parse("1H").unwrap().as_duration(), Duration::from_secs(3600));
        assert_eq!(Timeout::parse("2M").unwrap().as_duration(), Duration::from_secs(120));
        assert_eq!(Timeout::parse("30S").unwrap().as_duration(), Duration::from_secs(30));
        assert_eq!(Timeout::parse("100m").unwrap().as_duration(), Duration::from_millis(100));
        assert_eq!(Timeout::parse("7u").unwrap().as_duration(), Duration::from_micros(7));
        assert_eq!(Timeout::parse("9n").unwrap().as_duration(), Duration::from_nanos(9));
        assert_eq!(
            Timeout::parse("99999999H").unwrap().as_duration(),
            Duration::from_secs(99_999_999 * 3600)
        );
    }

    #[test]
    fn test_timeout_parse_invalid() {
        assert!(Timeout::parse("").is_none());
        assert!(Timeout::parse("S").is_none());
        assert!(Timeout::parse("123456789S").is_none());
        assert!(Timeout::parse("10x").is_none());
        assert!(Timeout::parse("-1S").is_none());
        assert!(Timeout::parse("+1S").is_none());
    }
}
