//! Configuration file for the `cleanpath` binary.

use cleanpath_relay::{RelayConfig, TlsPolicy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CleanPath configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Relay configuration
    #[serde(default)]
    pub relay: RelaySection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[relay]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    /// Address the TCP adapter listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Fallback destination (`host:port`)
    #[serde(default = "default_destination")]
    pub default_destination: String,
    /// Dial + handshake budget in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Forwarding buffer size in bytes
    #[serde(default = "default_forward_buffer")]
    pub forward_buffer_size: usize,
    /// Largest read of the initial payload answer
    #[serde(default = "default_initial_response_limit")]
    pub initial_response_limit: usize,
    /// TLS mode: `ports`, `always` or `never`
    #[serde(default = "default_tls_mode")]
    pub tls_mode: String,
    /// Ports that imply TLS when `tls_mode = "ports"`
    #[serde(default = "default_tls_ports")]
    pub tls_ports: Vec<u16>,
    /// Base URL of proxy endpoints
    #[serde(default = "default_endpoint_base_url")]
    pub endpoint_base_url: String,
    /// TCP keepalive idle time for dialed sockets, 0 disables
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
}

/// `[logging]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8390".to_string()
}

fn default_destination() -> String {
    RelayConfig::default().default_destination
}

fn default_connect_timeout() -> u64 {
    cleanpath_relay::DEFAULT_CONNECT_TIMEOUT.as_secs()
}

fn default_forward_buffer() -> usize {
    cleanpath_relay::DEFAULT_FORWARD_BUFFER
}

fn default_initial_response_limit() -> usize {
    cleanpath_relay::INITIAL_RESPONSE_LIMIT
}

fn default_tls_mode() -> String {
    "ports".to_string()
}

fn default_tls_ports() -> Vec<u16> {
    vec![3389]
}

fn default_endpoint_base_url() -> String {
    RelayConfig::default().endpoint_base_url
}

fn default_keepalive() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            default_destination: default_destination(),
            connect_timeout_secs: default_connect_timeout(),
            forward_buffer_size: default_forward_buffer(),
            initial_response_limit: default_initial_response_limit(),
            tls_mode: default_tls_mode(),
            tls_ports: default_tls_ports(),
            endpoint_base_url: default_endpoint_base_url(),
            keepalive_secs: default_keepalive(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
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
            .join("cleanpath/config.toml")
    }

    /// Load config from `path`, falling back to defaults when the default
    /// path does not exist yet
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed, or an
    /// explicitly named file is missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else if path == Self::default_path() {
            Ok(Self::default())
        } else {
            anyhow::bail!("Config file not found: {}", path.display());
        }
    }

    /// Parse listen address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.relay.listen_addr.parse()?)
    }

    /// Keepalive for dialed sockets
    #[must_use]
    pub fn keepalive(&self) -> Option<Duration> {
        (self.relay.keepalive_secs > 0).then(|| Duration::from_secs(self.relay.keepalive_secs))
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;

        validate_host_port(&self.relay.default_destination, "Default destination")?;

        if self.relay.connect_timeout_secs == 0 || self.relay.connect_timeout_secs > 600 {
            anyhow::bail!("Connect timeout must be between 1 and 600 seconds");
        }

        if self.relay.forward_buffer_size == 0 || self.relay.forward_buffer_size > 16 * 1024 * 1024
        {
            anyhow::bail!("Forward buffer size must be between 1 and 16MB");
        }

        if self.relay.initial_response_limit == 0 {
            anyhow::bail!("Initial response limit must be greater than zero");
        }

        let valid_tls_modes = ["ports", "always", "never"];
        if !valid_tls_modes.contains(&self.relay.tls_mode.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid TLS mode: {}. Must be one of: {}",
                self.relay.tls_mode,
                valid_tls_modes.join(", ")
            );
        }

        if self.relay.tls_ports.contains(&0) {
            anyhow::bail!("TLS ports must not contain 0");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Build the relay engine configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not validate.
    pub fn relay_config(&self) -> anyhow::Result<RelayConfig> {
        self.validate()?;

        let tls_policy = match self.relay.tls_mode.to_lowercase().as_str() {
            "always" => TlsPolicy::Always,
            "never" => TlsPolicy::Never,
            _ => TlsPolicy::Ports(self.relay.tls_ports.clone()),
        };

        let config = RelayConfig {
            default_destination: self.relay.default_destination.clone(),
            connect_timeout: Duration::from_secs(self.relay.connect_timeout_secs),
            forward_buffer_size: self.relay.forward_buffer_size,
            initial_response_limit: self.relay.initial_response_limit,
            tls_policy,
            endpoint_base_url: self.relay.endpoint_base_url.clone(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Validate host:port format
fn validate_host_port(addr: &str, name: &str) -> anyhow::Result<()> {
    let (host, _) = cleanpath_transport::split_host_port(addr)
        .map_err(|e| anyhow::anyhow!("{} '{}' is not host:port ({})", name, addr, e))?;

    if host.contains('/') || host.contains('\\') || host.chars().any(char::is_whitespace) {
        anyhow::bail!("{} '{}' contains invalid characters", name, addr);
    }

    Ok(())
}
