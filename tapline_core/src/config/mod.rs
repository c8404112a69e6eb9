//! Configuration management for tapline.
//!
//! Settings live in a TOML file with one table per concern:
//!
//! ```toml
//! [adapter]
//! instance_id = "{3F2504E0-4F89-11D3-9A0C-0305E82C3301}"
//!
//! [remote]
//! address = "vpn.example.com:5555"
//!
//! [security]
//! key = "base64 of 32 random bytes"
//!
//! [tunnel]
//! retry_delay_ms = 1000
//!
//! [logging]
//! level = "debug"
//! ```
//!
//! `TAPLINE_*` environment variables override file values. A loaded
//! configuration is validated and turns into the [`SessionConfig`] the
//! engine starts from.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::adapter::{AdapterIdentifier, DEFAULT_FRAME_CAPACITY};
use crate::crypto::TunnelKey;
use crate::engine::{EngineOptions, SessionConfig};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Missing required configuration value
    #[error("Missing required configuration value: {0}")]
    MissingValue(String),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

fn invalid(key: &str, message: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

/// Smallest accepted adapter buffer: one minimal Ethernet frame.
const MIN_FRAME_CAPACITY: usize = 64;
/// Largest accepted adapter buffer.
const MAX_FRAME_CAPACITY: usize = 65_535;

/// Virtual adapter selection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AdapterConfig {
    /// Instance id (GUID, braces optional) of the adapter to use
    pub instance_id: Option<String>,

    /// Hardware id fragments that mark a TAP adapter (empty: built-in list)
    #[serde(default)]
    pub component_ids: Vec<String>,

    /// Description fragments that mark a TAP adapter (empty: built-in list)
    #[serde(default)]
    pub description_markers: Vec<String>,

    /// Upper bound on one adapter read, in milliseconds (default: 250)
    #[serde(default = "default_read_poll_ms")]
    pub read_poll_ms: u64,
}

fn default_read_poll_ms() -> u64 {
    250
}

impl Default for AdapterConfig {
    fn default() -> Self {
        AdapterConfig {
            instance_id: None,
            component_ids: Vec::new(),
            description_markers: Vec::new(),
            read_poll_ms: default_read_poll_ms(),
        }
    }
}

impl AdapterConfig {
    pub fn read_poll(&self) -> Duration {
        Duration::from_millis(self.read_poll_ms)
    }
}

/// The peer end of the tunnel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct RemoteConfig {
    /// Remote endpoint as `host:port`
    pub address: Option<String>,

    /// Local address to bind instead of an ephemeral port
    pub local_bind: Option<String>,
}

/// Key material.
#[derive(Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SecurityConfig {
    /// Base64 of the 32-byte tunnel key
    pub key: Option<String>,
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("key", &self.key.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

/// Pump tuning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TunnelConfig {
    /// Adapter read buffer in bytes (default: 4096)
    #[serde(default = "default_frame_capacity")]
    pub frame_capacity: usize,

    /// Pause after an unexpected pump error, in milliseconds (default: 1000)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Bound on waiting for each pump at shutdown, in milliseconds (default: 5000)
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

fn default_frame_capacity() -> usize {
    DEFAULT_FRAME_CAPACITY
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            frame_capacity: default_frame_capacity(),
            retry_delay_ms: default_retry_delay_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log to stdout (default: true)
    #[serde(default = "default_true")]
    pub log_to_stdout: bool,

    /// Log to a daily rolling file (default: false)
    #[serde(default)]
    pub log_to_file: bool,

    /// Directory for log files (default: "./logs")
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Emit JSON instead of plain text (default: false)
    #[serde(default)]
    pub json_format: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            log_to_stdout: default_true(),
            log_to_file: false,
            log_dir: default_log_dir(),
            json_format: false,
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub adapter: AdapterConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub tunnel: TunnelConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Create a new default configuration
    pub fn new() -> Self {
        Config::default()
    }

    /// Load configuration from a TOML file.
    ///
    /// Environment overrides are applied before validation, so a value
    /// missing from the file may come from the environment.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_unvalidated(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file and apply environment overrides without validating.
    ///
    /// Used by commands that only need part of the configuration.
    pub fn load_partial<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_unvalidated(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_unvalidated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.adapter_id()?;
        self.key()?;

        let address = self
            .remote
            .address
            .as_deref()
            .ok_or_else(|| ConfigError::MissingValue("remote.address".to_string()))?;
        check_host_port(address)?;
        self.local_bind()?;

        if self.adapter.read_poll_ms == 0 {
            return Err(invalid("adapter.read_poll_ms", "must be greater than 0"));
        }
        if !(MIN_FRAME_CAPACITY..=MAX_FRAME_CAPACITY).contains(&self.tunnel.frame_capacity) {
            return Err(invalid(
                "tunnel.frame_capacity",
                format!(
                    "must be between {} and {}",
                    MIN_FRAME_CAPACITY, MAX_FRAME_CAPACITY
                ),
            ));
        }
        if self.tunnel.retry_delay_ms == 0 {
            return Err(invalid("tunnel.retry_delay_ms", "must be greater than 0"));
        }
        if self.tunnel.shutdown_timeout_ms == 0 {
            return Err(invalid("tunnel.shutdown_timeout_ms", "must be greater than 0"));
        }

        match self.logging.level.to_ascii_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "warning" | "error" => {}
            other => {
                return Err(invalid(
                    "logging.level",
                    format!("unknown level {:?}", other),
                ))
            }
        }

        Ok(())
    }

    /// The configured adapter instance id.
    pub fn adapter_id(&self) -> Result<AdapterIdentifier, ConfigError> {
        let text = self
            .adapter
            .instance_id
            .as_deref()
            .ok_or_else(|| ConfigError::MissingValue("adapter.instance_id".to_string()))?;
        AdapterIdentifier::parse(text).map_err(|e| invalid("adapter.instance_id", e))
    }

    /// The configured tunnel key.
    pub fn key(&self) -> Result<TunnelKey, ConfigError> {
        let text = self
            .security
            .key
            .as_deref()
            .ok_or_else(|| ConfigError::MissingValue("security.key".to_string()))?;
        TunnelKey::from_base64(text).map_err(|e| invalid("security.key", e))
    }

    fn local_bind(&self) -> Result<Option<SocketAddr>, ConfigError> {
        self.remote
            .local_bind
            .as_deref()
            .map(|text| {
                text.trim()
                    .parse::<SocketAddr>()
                    .map_err(|e| invalid("remote.local_bind", e))
            })
            .transpose()
    }

    /// Resolve the remote endpoint, preferring an IPv4 result.
    pub fn remote_addr(&self) -> Result<SocketAddr, ConfigError> {
        let address = self
            .remote
            .address
            .as_deref()
            .ok_or_else(|| ConfigError::MissingValue("remote.address".to_string()))?
            .trim();
        let resolved: Vec<SocketAddr> = address
            .to_socket_addrs()
            .map_err(|e| invalid("remote.address", e))?
            .collect();
        resolved
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| resolved.first())
            .copied()
            .ok_or_else(|| invalid("remote.address", format!("{} resolved to no addresses", address)))
    }

    /// The validated record a session starts from.
    pub fn session(&self) -> Result<SessionConfig, ConfigError> {
        self.validate()?;
        Ok(SessionConfig {
            adapter_id: self.adapter_id()?,
            remote: self.remote_addr()?,
            key: self.key()?,
        })
    }

    /// Engine tuning from the `[tunnel]` and `[remote]` sections.
    pub fn engine_options(&self) -> Result<EngineOptions, ConfigError> {
        Ok(EngineOptions {
            frame_capacity: self.tunnel.frame_capacity,
            retry_delay: Duration::from_millis(self.tunnel.retry_delay_ms),
            shutdown_timeout: Duration::from_millis(self.tunnel.shutdown_timeout_ms),
            local_bind: self.local_bind()?,
        })
    }

    /// Apply environment variable overrides (prefix: TAPLINE_)
    ///
    /// - TAPLINE_ADAPTER_INSTANCE_ID, TAPLINE_ADAPTER_COMPONENT_IDS,
    ///   TAPLINE_ADAPTER_DESCRIPTION_MARKERS, TAPLINE_ADAPTER_READ_POLL_MS
    /// - TAPLINE_REMOTE_ADDRESS, TAPLINE_REMOTE_LOCAL_BIND
    /// - TAPLINE_SECURITY_KEY
    /// - TAPLINE_TUNNEL_FRAME_CAPACITY, TAPLINE_TUNNEL_RETRY_DELAY_MS,
    ///   TAPLINE_TUNNEL_SHUTDOWN_TIMEOUT_MS
    /// - TAPLINE_LOG_LEVEL, TAPLINE_LOG_TO_STDOUT, TAPLINE_LOG_TO_FILE,
    ///   TAPLINE_LOG_DIR, TAPLINE_LOG_JSON
    ///
    /// Unparseable numbers and booleans are ignored.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse_bool(s: &str) -> Option<bool> {
            match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            }
        }
        fn split_csv(s: &str) -> Vec<String> {
            s.split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect()
        }

        if let Some(v) = lookup("TAPLINE_ADAPTER_INSTANCE_ID") {
            self.adapter.instance_id = Some(v);
        }
        if let Some(v) = lookup("TAPLINE_ADAPTER_COMPONENT_IDS") {
            self.adapter.component_ids = split_csv(&v);
        }
        if let Some(v) = lookup("TAPLINE_ADAPTER_DESCRIPTION_MARKERS") {
            self.adapter.description_markers = split_csv(&v);
        }
        if let Some(n) = lookup("TAPLINE_ADAPTER_READ_POLL_MS").and_then(|v| v.trim().parse().ok()) {
            self.adapter.read_poll_ms = n;
        }

        if let Some(v) = lookup("TAPLINE_REMOTE_ADDRESS") {
            self.remote.address = Some(v);
        }
        if let Some(v) = lookup("TAPLINE_REMOTE_LOCAL_BIND") {
            self.remote.local_bind = Some(v);
        }

        if let Some(v) = lookup("TAPLINE_SECURITY_KEY") {
            self.security.key = Some(v);
        }

        if let Some(n) = lookup("TAPLINE_TUNNEL_FRAME_CAPACITY").and_then(|v| v.trim().parse().ok()) {
            self.tunnel.frame_capacity = n;
        }
        if let Some(n) = lookup("TAPLINE_TUNNEL_RETRY_DELAY_MS").and_then(|v| v.trim().parse().ok()) {
            self.tunnel.retry_delay_ms = n;
        }
        if let Some(n) =
            lookup("TAPLINE_TUNNEL_SHUTDOWN_TIMEOUT_MS").and_then(|v| v.trim().parse().ok())
        {
            self.tunnel.shutdown_timeout_ms = n;
        }

        if let Some(v) = lookup("TAPLINE_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(b) = lookup("TAPLINE_LOG_TO_STDOUT").and_then(|v| parse_bool(&v)) {
            self.logging.log_to_stdout = b;
        }
        if let Some(b) = lookup("TAPLINE_LOG_TO_FILE").and_then(|v| parse_bool(&v)) {
            self.logging.log_to_file = b;
        }
        if let Some(v) = lookup("TAPLINE_LOG_DIR") {
            self.logging.log_dir = v;
        }
        if let Some(b) = lookup("TAPLINE_LOG_JSON").and_then(|v| parse_bool(&v)) {
            self.logging.json_format = b;
        }
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("tapline").join("config.toml")
        } else {
            PathBuf::from("config.toml")
        }
    }
}

/// Accept `host:port` or `[v6]:port` with a non-zero port, without resolving.
fn check_host_port(address: &str) -> Result<(), ConfigError> {
    let address = address.trim();
    if let Ok(addr) = address.parse::<SocketAddr>() {
        if addr.port() == 0 {
            return Err(invalid("remote.address", "port must be non-zero"));
        }
        return Ok(());
    }
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| invalid("remote.address", "expected host:port"))?;
    if host.is_empty() || host.contains(':') {
        return Err(invalid("remote.address", "expected host:port"));
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(invalid(
            "remote.address",
            format!("invalid port {:?}", port),
        )),
        Ok(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const ID: &str = "{3F2504E0-4F89-11D3-9A0C-0305E82C3301}";
    const KEY: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=";

    fn valid() -> Config {
        Config {
            adapter: AdapterConfig {
                instance_id: Some(ID.to_string()),
                ..Default::default()
            },
            remote: RemoteConfig {
                address: Some("127.0.0.1:5555".to_string()),
                local_bind: None,
            },
            security: SecurityConfig {
                key: Some(KEY.to_string()),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.adapter.read_poll_ms, 250);
        assert_eq!(config.tunnel.frame_capacity, 4096);
        assert_eq!(config.tunnel.retry_delay_ms, 1000);
        assert_eq!(config.tunnel.shutdown_timeout_ms, 5000);
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.log_to_stdout);
    }

    #[test]
    fn test_load_config() {
        let mut file = NamedTempFile::new().unwrap();

        let config_str = format!(
            r#"
            [adapter]
            instance_id = "3f2504e0-4f89-11d3-9a0c-0305e82c3301"
            component_ids = ["tap0901", "wintun"]

            [remote]
            address = "127.0.0.1:7000"

            [security]
            key = "{KEY}"

            [tunnel]
            retry_delay_ms = 250

            [logging]
            level = "debug"
        "#
        );

        file.write_all(config_str.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.adapter.component_ids, vec!["tap0901", "wintun"]);
        assert_eq!(config.tunnel.retry_delay_ms, 250);
        assert_eq!(config.tunnel.shutdown_timeout_ms, 5000);
        assert_eq!(config.logging.level, "debug");

        let session = config.session().unwrap();
        assert_eq!(session.adapter_id.to_string(), ID);
        assert_eq!(session.remote, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(session.key.to_bytes()[31], 31);

        let options = config.engine_options().unwrap();
        assert_eq!(options.retry_delay, Duration::from_millis(250));
        assert_eq!(options.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::load("/definitely/not/here/tapline.toml"),
            Err(ConfigError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_save_config() {
        let config = valid();
        let file = NamedTempFile::new().unwrap();
        config.save(file.path()).unwrap();

        let loaded = Config::load_partial(file.path()).unwrap();
        assert_eq!(loaded.adapter, config.adapter);
        assert_eq!(loaded.remote, config.remote);
        assert_eq!(loaded.security, config.security);
    }

    #[test]
    fn test_validation() {
        assert!(valid().validate().is_ok());

        assert!(matches!(
            Config::default().validate(),
            Err(ConfigError::MissingValue(_))
        ));

        let mut config = valid();
        config.adapter.instance_id = Some("tap0".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "adapter.instance_id"
        ));

        let mut config = valid();
        config.security.key = Some("c2hvcnQ=".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "security.key"
        ));

        let mut config = valid();
        config.security.key = None;
        assert!(matches!(config.validate(), Err(ConfigError::MissingValue(k)) if k == "security.key"));

        for address in ["127.0.0.1", "127.0.0.1:0", ":5555", "host:port", "a:b:c"] {
            let mut config = valid();
            config.remote.address = Some(address.to_string());
            assert!(config.validate().is_err(), "{} should be rejected", address);
        }
        for address in ["vpn.example.com:5555", "[::1]:5555", "10.0.0.1:1"] {
            let mut config = valid();
            config.remote.address = Some(address.to_string());
            assert!(config.validate().is_ok(), "{} should be accepted", address);
        }

        let mut config = valid();
        config.remote.local_bind = Some("0.0.0.0".to_string());
        assert!(config.validate().is_err());

        let mut config = valid();
        config.tunnel.frame_capacity = 10;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.tunnel.retry_delay_ms = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TAPLINE_REMOTE_ADDRESS", "10.1.2.3:9000"),
            ("TAPLINE_ADAPTER_COMPONENT_IDS", "tap0901, custom-tap ,"),
            ("TAPLINE_TUNNEL_RETRY_DELAY_MS", "50"),
            ("TAPLINE_TUNNEL_SHUTDOWN_TIMEOUT_MS", "soon"),
            ("TAPLINE_LOG_TO_FILE", "yes"),
            ("TAPLINE_LOG_JSON", "maybe"),
        ]
        .into_iter()
        .collect();

        let mut config = valid();
        config.apply_overrides_from(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.remote.address.as_deref(), Some("10.1.2.3:9000"));
        assert_eq!(config.adapter.component_ids, vec!["tap0901", "custom-tap"]);
        assert_eq!(config.tunnel.retry_delay_ms, 50);
        assert_eq!(config.tunnel.shutdown_timeout_ms, 5000);
        assert!(config.logging.log_to_file);
        assert!(!config.logging.json_format);
        assert_eq!(config.adapter.instance_id.as_deref(), Some(ID));
    }

    #[test]
    fn test_security_debug_is_redacted() {
        let rendered = format!("{:?}", valid());
        assert!(!rendered.contains(KEY));
    }

    #[test]
    fn test_save_then_load_keeps_edits() {
        let file = NamedTempFile::new().unwrap();
        let mut config = valid();
        config.logging.level = "debug".to_string();
        config.tunnel.retry_delay_ms = 250;
        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.logging.level, "debug");
        assert_eq!(loaded.engine_options().unwrap().retry_delay, Duration::from_millis(250));
    }
}
