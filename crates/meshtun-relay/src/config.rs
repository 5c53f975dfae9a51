//! Mesh configuration

use meshtun_core::config::duration_ms;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backoff::BackoffConfig;

/// Configuration for relay links.
///
/// Owned by the [`crate::AddressMesh`]; replaced through
/// [`crate::AddressMesh::update_config`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// TCP connect timeout
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,

    /// Relay handshake timeout
    #[serde(rename = "handshake_timeout_ms", with = "duration_ms")]
    pub handshake_timeout: Duration,

    /// Keepalive send interval
    #[serde(rename = "keepalive_interval_ms", with = "duration_ms")]
    pub keepalive_interval: Duration,

    /// Silence after which a connection is considered dead
    #[serde(rename = "liveness_timeout_ms", with = "duration_ms")]
    pub liveness_timeout: Duration,

    /// Reconnect backoff
    pub backoff: BackoffConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        let keepalive_interval = Duration::from_secs(30);
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            keepalive_interval,
            liveness_timeout: keepalive_interval * 3,
            backoff: BackoffConfig::default(),
        }
    }
}
