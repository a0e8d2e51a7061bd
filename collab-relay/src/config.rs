//! Configuration loading for collab-relay.
//!
//! Configuration is loaded from a TOML file (default: `relay.toml`).
//! Every section and field is optional.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Root configuration for collab-relay.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Identity provider configuration.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Session store configuration.
    #[serde(default)]
    pub store: StoreConfig,
    /// Broker configuration.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Connection limits.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Snapshot persistence configuration.
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP/WebSocket listener (default: 0.0.0.0:8000).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

/// Identity provider configuration.
///
/// When `jwt_secret` is set, credentials are HS256 JWTs whose `sub` claim is
/// the user id. Otherwise credentials are looked up in `tokens`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Shared HMAC secret for JWT validation.
    pub jwt_secret: Option<String>,
    /// Static credential -> user id table.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

/// Session store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
    /// Keep session content in memory only (default: false).
    #[serde(default)]
    pub in_memory: bool,
}

/// Broker configuration.
///
/// With `url` set, sessions are fanned out through Redis pub/sub and any
/// number of relay processes can serve the same session. Without it the
/// broker lives in this process only.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Redis URL, e.g. `redis://127.0.0.1:6379`.
    pub url: Option<String>,
    /// In-process broker: per-topic buffer before slow subscribers start skipping messages (default: 1024).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Connection limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Timeout in seconds for resolving a credential (default: 10).
    /// A provider that does not answer in time is treated as unreachable.
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
    /// Maximum WebSocket frame size in bytes (default: 16MB, the transport's own limit).
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Frames queued per connection before it counts as stalled and is evicted (default: 256).
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// Interval between WebSocket pings (default: 30).
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// A connection that sends nothing, not even a pong, for this long is dropped (default: 90).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// A single socket write that takes longer than this drops the connection (default: 10).
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
}

/// Snapshot persistence configuration.
///
/// The relay does not merge edits. A snapshot is the payload of the most
/// recent edit relayed in the session, so enable this only when clients send
/// their whole buffer with every edit. Incremental edits would overwrite the
/// stored document with a fragment.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    /// Persist the latest relayed content per session (default: false).
    #[serde(default)]
    pub enabled: bool,
    /// Snapshot interval in seconds (default: 30).
    #[serde(default = "default_snapshot_interval")]
    pub interval_secs: u64,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("sessions.db")
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_auth_timeout_secs() -> u64 {
    10
}

fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024 // 16MB
}

fn default_outbound_queue() -> usize {
    256
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    90
}

fn default_write_timeout_secs() -> u64 {
    10
}

fn default_snapshot_interval() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            in_memory: false,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: None,
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            auth_timeout_secs: default_auth_timeout_secs(),
            max_frame_bytes: default_max_frame_bytes(),
            outbound_queue: default_outbound_queue(),
            ping_interval_secs: default_ping_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_snapshot_interval(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.server.bind_address, "0.0.0.0:8000");
        assert_eq!(config.broker.channel_capacity, 1024);
        assert_eq!(config.limits.auth_timeout_secs, 10);
        assert_eq!(config.limits.outbound_queue, 256);
        assert!(config.broker.url.is_none());
        assert!(!config.snapshot.enabled);
        assert!(config.auth.jwt_secret.is_none());
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[server]
bind_address = "127.0.0.1:5000"

[auth]
jwt_secret = "s3cret"

[auth.tokens]
dev-token = "alice"

[store]
database = "/data/sessions.db"

[broker]
url = "redis://cache:6379"
channel_capacity = 64

[snapshot]
enabled = true
interval_secs = 5
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:5000");
        assert_eq!(config.auth.jwt_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.auth.tokens.get("dev-token").map(String::as_str), Some("alice"));
        assert_eq!(config.store.database, PathBuf::from("/data/sessions.db"));
        assert_eq!(config.broker.url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.broker.channel_capacity, 64);
        assert!(config.snapshot.enabled);
        assert_eq!(config.snapshot.interval_secs, 5);
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.bind_address, "0.0.0.0:8000");
        assert_eq!(config.limits.max_frame_bytes, 16 * 1024 * 1024);
        assert_eq!(config.snapshot.interval_secs, 30);
    }

    #[test]
    fn auth_timeout_configurable_from_toml() {
        let config: Config = toml::from_str("[limits]\nauth_timeout_secs = 3\n").unwrap();
        assert_eq!(config.limits.auth_timeout_secs, 3);
    }

    #[test]
    fn connection_limits_configurable_from_toml() {
        let toml = "[limits]\noutbound_queue = 8\nping_interval_secs = 5\nidle_timeout_secs = 15\n";
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.limits.outbound_queue, 8);
        assert_eq!(config.limits.ping_interval_secs, 5);
        assert_eq!(config.limits.idle_timeout_secs, 15);
        assert_eq!(config.limits.write_timeout_secs, 10);
    }

    #[test]
    fn from_file_reads_and_parses() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nbind_address = \"127.0.0.1:9999\"").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:9999");
    }

    #[test]
    fn from_file_reports_missing_file() {
        let err = Config::from_file(std::path::Path::new("/nonexistent/relay.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn from_file_reports_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nbind_address = ").unwrap();

        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }
}
