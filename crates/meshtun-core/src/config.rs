//! Tunnel configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunnel session configuration
///
/// Owned by the session it configures; there is no process-wide copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// How long the manager has to complete the header exchange
    #[serde(rename = "handshake_timeout_ms", with = "duration_ms")]
    pub handshake_timeout: Duration,

    /// Largest framed message accepted from or sent to the manager
    pub max_message_size: usize,

    /// Forwarded log records kept while the send queue is busy
    pub log_queue_capacity: usize,

    /// Outbound messages buffered before senders wait
    pub send_queue_capacity: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            max_message_size: 1024 * 1024, // 1 MiB
            log_queue_capacity: 1024,
            send_queue_capacity: 64,
        }
    }
}

/// Serialize a [`Duration`] as integer milliseconds.
///
/// Used with `#[serde(with = "duration_ms")]` so configuration files can
/// say `keepalive_interval_ms = 30000`.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize as milliseconds
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    /// Deserialize from milliseconds
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TunnelConfig::default();
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.max_message_size, 1 << 20);
        assert_eq!(config.log_queue_capacity, 1024);
    }

    #[test]
    fn test_json_uses_milliseconds() {
        let config = TunnelConfig {
            handshake_timeout: Duration::from_millis(1500),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"handshake_timeout_ms\":1500"));

        let parsed: TunnelConfig =
            serde_json::from_str(r#"{"handshake_timeout_ms": 200}"#).unwrap();
        assert_eq!(parsed.handshake_timeout, Duration::from_millis(200));
        assert_eq!(parsed.max_message_size, TunnelConfig::default().max_message_size);
    }

    #[test]
    fn test_bincode_roundtrip_keeps_durations() {
        let config = TunnelConfig {
            handshake_timeout: Duration::from_millis(250),
            send_queue_capacity: 8,
            ..Default::default()
        };
        let bytes = bincode::serialize(&config).unwrap();
        let decoded: TunnelConfig = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, config);
    }
}
