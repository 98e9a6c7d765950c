/*!
 * Server Configuration
 *
 * Settings resolve in layers: built-in defaults, then an optional TOML
 * file, then command-line flags (applied by the binary). Every field has a
 * default, so a config file only needs the keys it changes.
 */

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// File name written by `--init-config`.
pub const DEFAULT_CONFIG_FILE: &str = "shardkv.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write config file '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("invalid setting: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
}

/// Network front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Additional consecutive ports to try when `port` is taken
    pub port_scan: u16,
    /// Poller threads; 0 means one per available core
    pub io_threads: usize,
    pub max_clients: usize,
    /// Largest unparsed request a connection may buffer
    pub max_read_buffer: usize,
    /// Close connections idle this long; 0 disables
    pub idle_timeout_ms: u64,
    /// Close connections whose pending output makes no progress this long; 0 disables
    pub write_timeout_ms: u64,
    /// How long a cancelled server waits for connections to drain
    pub shutdown_grace_ms: u64,
    pub requirepass: Option<String>,
    pub log_level: String,
    pub pretty_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: crate::DEFAULT_PORT,
            port_scan: 0,
            io_threads: 0,
            max_clients: 10_000,
            max_read_buffer: 64 * 1024 * 1024,
            idle_timeout_ms: 0,
            write_timeout_ms: 30_000,
            shutdown_grace_ms: 5_000,
            requirepass: None,
            log_level: "info".to_string(),
            pretty_logs: false,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("host '{}' is not an IP address", self.host)))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn io_threads(&self) -> usize {
        if self.io_threads == 0 {
            available_cores()
        } else {
            self.io_threads
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.idle_timeout_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.write_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Shard manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of shards; 0 means one per available core
    pub shards: usize,
    /// Bounded queue depth per shard
    pub queue_capacity: usize,
    /// How long queued commands may still execute after shutdown starts
    pub drain_timeout_ms: u64,
    /// Period of the active expiry sweep
    pub expiry_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shards: 0,
            queue_capacity: 4096,
            drain_timeout_ms: 5_000,
            expiry_interval_ms: 100,
        }
    }
}

impl EngineConfig {
    /// Convenience for embedding and tests.
    pub fn with_shards(shards: usize) -> Self {
        Self {
            shards,
            ..Self::default()
        }
    }

    pub fn shards(&self) -> usize {
        if self.shards == 0 {
            available_cores()
        } else {
            self.shards
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn expiry_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_interval_ms)
    }
}

impl Config {
    /// Load a TOML file on top of the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write this configuration as `shardkv.toml` inside `dir`.
    ///
    /// # Returns
    /// * The path of the written file
    pub fn write_to_dir(&self, dir: &Path) -> Result<PathBuf, ConfigError> {
        let path = dir.join(DEFAULT_CONFIG_FILE);
        let text = self.to_toml()?;
        fs::write(&path, text).map_err(|source| ConfigError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.addr()?;
        if self.engine.queue_capacity == 0 {
            return Err(ConfigError::Invalid("engine.queue_capacity must be at least 1".into()));
        }
        if self.engine.expiry_interval_ms == 0 {
            return Err(ConfigError::Invalid("engine.expiry_interval_ms must be at least 1".into()));
        }
        if self.server.max_clients == 0 {
            return Err(ConfigError::Invalid("server.max_clients must be at least 1".into()));
        }
        if self.server.max_read_buffer < 1024 {
            return Err(ConfigError::Invalid("server.max_read_buffer must be at least 1024".into()));
        }
        if crate::logging::level_filter(&self.server.log_level).is_none() {
            return Err(ConfigError::Invalid(format!(
                "unknown log level '{}'",
                self.server.log_level
            )));
        }
        Ok(())
    }
}

fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg = Config::from_toml("[server]\nport = 6400\n\n[engine]\nshards = 3\n").unwrap();
        assert_eq!(cfg.server.port, 6400);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.engine.shards(), 3);
        assert_eq!(cfg.engine.queue_capacity, 4096);
    }

    #[test]
    fn template_parses_back() {
        let cfg = Config::default();
        let text = cfg.to_toml().unwrap();
        assert_eq!(Config::from_toml(&text).unwrap(), cfg);
    }

    #[test]
    fn unknown_shape_is_parse_error() {
        assert!(matches!(
            Config::from_toml("[server]\nport = \"abc\"\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn validation() {
        let mut cfg = Config::default();
        assert!(cfg.validate().is_ok());
        cfg.server.host = "localhost".into();
        assert!(cfg.validate().is_err());
        cfg.server.host = "127.0.0.1".into();
        cfg.engine.queue_capacity = 0;
        assert!(cfg.validate().is_err());
        cfg.engine.queue_capacity = 1;
        cfg.server.log_level = "loud".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_means_disabled_or_auto() {
        let cfg = Config::default();
        assert_eq!(cfg.server.idle_timeout(), None);
        assert!(cfg.server.io_threads() >= 1);
        assert!(cfg.engine.shards() >= 1);
    }
}
