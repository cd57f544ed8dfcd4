//! Relay settings: where to listen and how large an envelope may be.
//!
//! Values come from `--bind`/`RELAY_ADDR`, `--max-frame-size`, the
//! `[server]` table of `~/.config/tasksync-relay/config.toml`, and the
//! compiled defaults, in that order. The log filter comes from
//! `--log-level`/`RELAY_LOG`.
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:9000"
//! max_frame_size = 65536
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Why the relay refused to start with the given settings.
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

    /// The bind address is not a `host:port` socket address.
    #[error("invalid bind address {addr:?}: {source}")]
    InvalidBindAddr {
        /// The rejected value.
        addr: String,
        /// Parse failure.
        source: std::net::AddrParseError,
    },

    /// A zero frame limit would drop every envelope.
    #[error("max_frame_size must be greater than zero")]
    ZeroFrameSize,
}

/// The relay config file. Every key is optional.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RelayConfigFile {
    server: ServerFileConfig,
}

/// `[server]` table.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    max_frame_size: Option<usize>,
}

/// Command line of `tasksync-relay`.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "TaskSync signaling relay")]
pub struct RelayCliArgs {
    /// Socket address to accept WebSocket clients on.
    #[arg(short, long, env = "RELAY_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/tasksync-relay/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Largest envelope, in bytes, the relay will decode. Bigger frames
    /// are dropped without a reply.
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "RELAY_LOG")]
    pub log_level: String,
}

/// Settings the relay runs with.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address, `0.0.0.0:9000` unless overridden.
    pub bind_addr: String,
    /// Envelope size limit, 64 KiB unless overridden. A relayed task
    /// larger than this never reaches the room.
    pub max_frame_size: usize,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_string(),
            max_frame_size: crate::relay::DEFAULT_MAX_FRAME_SIZE,
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Reads the config file, applies the command line over it, and checks
    /// the result.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an explicit `--config` file is missing or
    /// unreadable, the TOML is malformed, or [`validate`](Self::validate)
    /// rejects the values.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        config.validate()?;
        Ok(config)
    }

    /// Checks values that parse as TOML but cannot run a relay.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBindAddr`] or
    /// [`ConfigError::ZeroFrameSize`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr
            .parse::<SocketAddr>()
            .map_err(|source| ConfigError::InvalidBindAddr {
                addr: self.bind_addr.clone(),
                source,
            })?;
        if self.max_frame_size == 0 {
            return Err(ConfigError::ZeroFrameSize);
        }
        Ok(())
    }

    /// Command line over file over defaults.
    fn resolve(cli: &RelayCliArgs, file: &RelayConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            max_frame_size: cli
                .max_frame_size
                .or(file.server.max_frame_size)
                .unwrap_or(defaults.max_frame_size),
            log_level: cli.log_level.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Reads the relay config file.
///
/// An explicit path must exist. The default path under the user config
/// directory is optional.
fn load_config_file(explicit_path: Option<&Path>) -> Result<RelayConfigFile, ConfigError> {
    let (path, required) = match explicit_path {
        Some(p) => (p.to_path_buf(), true),
        None => match dirs::config_dir() {
            Some(dir) => (dir.join("tasksync-relay").join("config.toml"), false),
            None => return Ok(RelayConfigFile::default()),
        },
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
            Ok(RelayConfigFile::default())
        }
        Err(source) => Err(ConfigError::ReadFile { path, source }),
    }
}
