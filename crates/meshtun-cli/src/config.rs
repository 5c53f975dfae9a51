//! Configuration file for the meshtun CLI.

use meshtun_core::config::duration_ms;
use meshtun_relay::{MeshConfig, RelayAddress, RelayServerConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// meshtun configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Node identity
    pub identity: IdentityConfig,
    /// Relay mesh client
    pub mesh: MeshSection,
    /// Reference relay server
    pub relay: RelaySection,
    /// Logging
    pub logging: LoggingConfig,
}

/// Identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// File holding the hex-encoded secret key
    pub secret_key_file: PathBuf,
    /// Shared mesh key presented to relays
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mesh_key: Option<String>,
}

/// `[mesh]` section
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MeshSection {
    /// Relay addresses to maintain links to
    pub relays: Vec<String>,
    /// Link timeouts and backoff
    #[serde(flatten)]
    pub settings: MeshConfig,
}

/// `[relay]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    /// Listen address
    pub bind: String,
    /// Maximum concurrent clients
    pub max_clients: usize,
    /// Keepalive interval
    #[serde(rename = "keepalive_interval_ms", with = "duration_ms")]
    pub keepalive_interval: Duration,
    /// Handshake timeout
    #[serde(rename = "handshake_timeout_ms", with = "duration_ms")]
    pub handshake_timeout: Duration,
    /// Idle client timeout
    #[serde(rename = "client_timeout_ms", with = "duration_ms")]
    pub client_timeout: Duration,
    /// Mesh key required from watching clients
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mesh_key: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

fn default_secret_key_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("meshtun/secret_key")
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            secret_key_file: default_secret_key_path(),
            mesh_key: None,
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        let defaults = RelayServerConfig::default();
        Self {
            bind: "0.0.0.0:7400".to_string(),
            max_clients: defaults.max_clients,
            keepalive_interval: defaults.keepalive_interval,
            handshake_timeout: defaults.handshake_timeout,
            client_timeout: defaults.client_timeout,
            mesh_key: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl RelaySection {
    /// Server configuration for this section
    pub fn server_config(&self) -> RelayServerConfig {
        RelayServerConfig {
            max_clients: self.max_clients,
            keepalive_interval: self.keepalive_interval,
            handshake_timeout: self.handshake_timeout,
            client_timeout: self.client_timeout,
            mesh_key: self.mesh_key.clone(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("meshtun/config.toml")
    }

    /// Load `path`, or defaults if `path` is the default location and absent
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly named file is missing or any file
    /// fails to parse.
    pub fn resolve(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    Self::load(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Parse the relay listen address
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn relay_bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.relay
            .bind
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid relay bind address '{}': {e}", self.relay.bind))
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.relay_bind_addr()?;

        for relay in &self.mesh.relays {
            RelayAddress::parse(relay)
                .map_err(|e| anyhow::anyhow!("invalid relay '{relay}' in [mesh]: {e}"))?;
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.relay.max_clients == 0 {
            anyhow::bail!("relay max_clients must be at least 1");
        }

        let settings = &self.mesh.settings;
        if settings.liveness_timeout <= settings.keepalive_interval {
            anyhow::bail!("mesh liveness_timeout_ms must exceed keepalive_interval_ms");
        }
        if settings.backoff.multiplier < 1.0 {
            anyhow::bail!("mesh backoff multiplier must be at least 1.0");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.relay.bind, "0.0.0.0:7400");
        assert_eq!(config.relay.max_clients, 10_000);
        assert!(config.mesh.relays.is_empty());
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[mesh]
relays = ["relay-eu.example.com:7400", "tcp://relay-us.example.com:7400"]
keepalive_interval_ms = 5000
liveness_timeout_ms = 15000

[mesh.backoff]
max_ms = 2000

[relay]
bind = "127.0.0.1:9000"
mesh_key = "shared"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.mesh.relays.len(), 2);
        assert_eq!(config.mesh.settings.keepalive_interval, Duration::from_secs(5));
        assert_eq!(config.mesh.settings.backoff.max, Duration::from_secs(2));
        assert_eq!(
            config.mesh.settings.connect_timeout,
            MeshConfig::default().connect_timeout
        );
        assert_eq!(config.relay_bind_addr().unwrap().port(), 9000);
        assert_eq!(config.relay.server_config().mesh_key.as_deref(), Some("shared"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.mesh.relays.push("relay.example.com:7400".into());
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.mesh.relays, config.mesh.relays);
        assert_eq!(loaded.mesh.settings, config.mesh.settings);
        assert_eq!(loaded.relay.client_timeout, config.relay.client_timeout);
    }

    #[test]
    fn test_resolve_missing_explicit_path_fails() {
        let dir = TempDir::new().unwrap();
        assert!(Config::resolve(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.mesh.relays.push("no-port".into());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.relay.bind = "nowhere".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.mesh.settings.liveness_timeout = config.mesh.settings.keepalive_interval;
        assert!(config.validate().is_err());
    }
}
