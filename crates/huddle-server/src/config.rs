//! Server configuration.
//!
//! Configuration is layered, lowest precedence first:
//! - Built-in defaults (`HUDDLE_HOST` / `HUDDLE_PORT` feed the defaults)
//! - TOML configuration file (`HUDDLE_CONFIG`, or the first of the default paths)
//! - Environment variables (`HUDDLE__SECTION__KEY`)

use anyhow::{Context, Result};
use huddle_core::HubConfig;
use huddle_protocol::WireFormat;
use huddle_transport::WebSocketConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file locations, searched in order.
const CONFIG_PATHS: [&str; 3] = [
    "huddle.toml",
    "/etc/huddle/huddle.toml",
    "~/.config/huddle/huddle.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Hub behavior.
    #[serde(default)]
    pub hub: HubSection,

    /// Message persistence.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Encoding of outbound frames.
    #[serde(default)]
    pub wire_format: WireFormat,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum number of channels.
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,
}

/// Hub configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSection {
    /// Channel seeded at startup.
    #[serde(default = "default_channel")]
    pub default_channel: String,

    /// Display name of the seeded channel.
    #[serde(default = "default_channel_name")]
    pub default_channel_name: String,

    /// History rows replayed on join.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Capacity of the chat queue.
    #[serde(default = "default_chat_queue_capacity")]
    pub chat_queue_capacity: usize,

    /// Outbound write timeout in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

/// Storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Bounded in-memory log, lost on restart.
    #[default]
    Memory,
    /// SQLite database.
    Sqlite,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend to use.
    #[serde(default)]
    pub backend: StorageBackend,

    /// Database URL for the SQLite backend.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Pool size for the SQLite backend.
    #[serde(default = "default_db_connections")]
    pub max_connections: u32,

    /// Messages kept per channel by the memory backend.
    #[serde(default = "default_memory_retention")]
    pub memory_retention: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("HUDDLE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("HUDDLE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_channels() -> usize {
    10_000
}

fn default_channel() -> String {
    "general".to_string()
}

fn default_channel_name() -> String {
    "General".to_string()
}

fn default_history_limit() -> usize {
    huddle_core::store::DEFAULT_HISTORY_LIMIT
}

fn default_chat_queue_capacity() -> usize {
    1024
}

fn default_write_timeout() -> u64 {
    5_000 // 5 seconds
}

fn default_database_url() -> String {
    "sqlite://huddle.db".to_string()
}

fn default_db_connections() -> u32 {
    5
}

fn default_memory_retention() -> usize {
    huddle_core::store::DEFAULT_MEMORY_RETENTION
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            hub: HubSection::default(),
            storage: StorageConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            wire_format: WireFormat::default(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_channels: default_max_channels(),
        }
    }
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            default_channel: default_channel(),
            default_channel_name: default_channel_name(),
            history_limit: default_history_limit(),
            chat_queue_capacity: default_chat_queue_capacity(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            database_url: default_database_url(),
            max_connections: default_db_connections(),
            memory_retention: default_memory_retention(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file, environment and defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let file = match std::env::var("HUDDLE_CONFIG") {
            Ok(path) => Some(PathBuf::from(shellexpand::tilde(&path).as_ref())),
            Err(_) => Self::find_config_file(),
        };
        Self::layered(file.as_deref())
    }

    /// First existing file among the default locations.
    fn find_config_file() -> Option<PathBuf> {
        CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Build from an optional file plus `HUDDLE__*` environment overrides.
    fn layered(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("HUDDLE")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Hub settings derived from this configuration.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            default_channel: self.hub.default_channel.clone(),
            default_channel_name: self.hub.default_channel_name.clone(),
            history_limit: self.hub.history_limit,
            chat_queue_capacity: self.hub.chat_queue_capacity,
            write_timeout: Duration::from_millis(self.hub.write_timeout_ms),
            max_channels: self.limits.max_channels,
        }
    }

    /// WebSocket transport settings derived from this configuration.
    #[must_use]
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            wire_format: self.transport.wire_format,
            max_message_size: self.transport.max_message_size,
        }
    }
}
