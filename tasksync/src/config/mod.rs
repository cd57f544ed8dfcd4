//! Configuration system for the `TaskSync` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/tasksync/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use crate::net::SyncConfig;
use crate::session::{
    DEFAULT_MAX_NEGOTIATION_ATTEMPTS, DEFAULT_NEGOTIATION_TIMEOUT, SessionSettings,
};
use crate::tasks::merge::DEFAULT_TOMBSTONE_TTL;
use crate::transport::relay::RelayOptions;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// The relay URL is not a usable WebSocket URL.
    #[error("invalid relay url {url}: {reason}")]
    InvalidRelayUrl {
        /// The configured value.
        url: String,
        /// What is wrong with it.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    direct: DirectFileConfig,
    sync: SyncFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    relay_url: Option<String>,
    room: Option<String>,
    connect_timeout_secs: Option<u64>,
    welcome_timeout_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

/// `[direct]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct DirectFileConfig {
    bind_host: Option<String>,
    rendezvous: Option<Vec<String>>,
    negotiation_timeout_secs: Option<u64>,
    max_negotiation_attempts: Option<u32>,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    tombstone_ttl_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Network --
    /// Relay server WebSocket URL.
    pub relay_url: String,
    /// Room to join on startup.
    pub room: Option<String>,
    /// Timeout for connecting to the relay server.
    pub connect_timeout: Duration,
    /// Timeout for the relay's welcome frame.
    pub welcome_timeout: Duration,
    /// Channel capacity for command/event mpsc channels.
    pub channel_capacity: usize,

    // -- Direct links --
    /// Host the TCP provider listens on; also the address peers dial.
    pub bind_host: String,
    /// Rendezvous servers handed to the direct transport.
    pub rendezvous: Vec<String>,
    /// How long a negotiation may take.
    pub negotiation_timeout: Duration,
    /// Offers made to one peer before giving up on a direct link.
    pub max_negotiation_attempts: u32,

    // -- Sync --
    /// How long deleted task ids are remembered.
    pub tombstone_ttl: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let relay = RelayOptions::default();
        Self {
            relay_url: "ws://127.0.0.1:9000/ws".to_string(),
            room: None,
            connect_timeout: relay.connect_timeout,
            welcome_timeout: relay.welcome_timeout,
            channel_capacity: relay.channel_capacity,
            bind_host: "127.0.0.1".to_string(),
            rendezvous: Vec::new(),
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            max_negotiation_attempts: DEFAULT_MAX_NEGOTIATION_ATTEMPTS,
            tombstone_ttl: DEFAULT_TOMBSTONE_TTL,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// CLI args and env vars are parsed via `clap`. If `--config` is given
    /// and the file does not exist, returns an error. If no `--config` is
    /// given, the default path (`~/.config/tasksync/config.toml`) is tried
    /// and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed,
    /// or if the resolved relay URL is not a `ws://` or `wss://` URL.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        validate_relay_url(&config.relay_url)?;
        Ok(config)
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            relay_url: cli
                .relay_url
                .clone()
                .or_else(|| file.network.relay_url.clone())
                .unwrap_or(defaults.relay_url),
            room: cli
                .room
                .clone()
                .or_else(|| file.network.room.clone())
                .filter(|room| !room.is_empty()),
            connect_timeout: file
                .network
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            welcome_timeout: file
                .network
                .welcome_timeout_secs
                .map_or(defaults.welcome_timeout, Duration::from_secs),
            channel_capacity: file
                .network
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            bind_host: cli
                .bind_host
                .clone()
                .or_else(|| file.direct.bind_host.clone())
                .unwrap_or(defaults.bind_host),
            rendezvous: file
                .direct
                .rendezvous
                .clone()
                .unwrap_or(defaults.rendezvous),
            negotiation_timeout: file
                .direct
                .negotiation_timeout_secs
                .map_or(defaults.negotiation_timeout, Duration::from_secs),
            max_negotiation_attempts: file
                .direct
                .max_negotiation_attempts
                .unwrap_or(defaults.max_negotiation_attempts),
            tombstone_ttl: file
                .sync
                .tombstone_ttl_secs
                .map_or(defaults.tombstone_ttl, Duration::from_secs),
        }
    }

    /// Build the [`SyncConfig`] for [`spawn_sync`](crate::net::spawn_sync).
    #[must_use]
    pub fn to_sync_config(&self) -> SyncConfig {
        let mut config = SyncConfig::new(self.relay_url.clone());
        config.relay = RelayOptions {
            connect_timeout: self.connect_timeout,
            welcome_timeout: self.welcome_timeout,
            channel_capacity: self.channel_capacity,
        };
        config.session = SessionSettings {
            negotiation_timeout: self.negotiation_timeout,
            max_negotiation_attempts: self.max_negotiation_attempts,
        };
        config.tombstone_ttl = self.tombstone_ttl;
        config.channel_capacity = self.channel_capacity;
        config
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Shared task list synced in real time")]
pub struct CliArgs {
    /// WebSocket URL of the relay server.
    #[arg(long, env = "RELAY_URL")]
    pub relay_url: Option<String>,

    /// Room to join on startup.
    #[arg(long, env = "TASKSYNC_ROOM")]
    pub room: Option<String>,

    /// Host to listen on for direct links.
    #[arg(long)]
    pub bind_host: Option<String>,

    /// Path to config file (default: `~/.config/tasksync/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "TASKSYNC_LOG")]
    pub log_level: String,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn validate_relay_url(raw: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidRelayUrl {
        url: raw.to_string(),
        reason,
    };
    let parsed = url::Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    match parsed.scheme() {
        "ws" | "wss" => {}
        other => return Err(invalid(format!("unsupported scheme `{other}`"))),
    }
    if parsed.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(())
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("tasksync").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
