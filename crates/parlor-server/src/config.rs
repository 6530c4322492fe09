//! Server configuration.
//!
//! Configuration can be loaded from:
//! - An explicit file (`--config` / `PARLOR_CONFIG`)
//! - A TOML file in one of the default locations
//! - Environment variables (PARLOR_*) for fields left unset

use anyhow::{Context, Result};
use parlor_core::{RegistryError, RelayConfig, RoomRegistry, DEFAULT_ROOMS};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

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

    /// Pub/sub backbone configuration.
    #[serde(default)]
    pub backbone: BackboneConfig,

    /// Room configuration.
    #[serde(default)]
    pub rooms: RoomsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Origins allowed to connect. `"*"` allows any.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Pub/sub backbone configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackboneConfig {
    /// `redis://host:port` or `memory://`.
    #[serde(default = "default_backbone_url")]
    pub url: String,
}

/// Room configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomsConfig {
    /// The closed set of room names.
    #[serde(default = "default_room_names")]
    pub names: Vec<String>,

    /// Deliver senders their own messages.
    #[serde(default = "default_true")]
    pub echo_to_sender: bool,
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
    std::env::var("PARLOR_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("PARLOR_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/socket".to_string()
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_backbone_url() -> String {
    std::env::var("PARLOR_BACKBONE_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn default_room_names() -> Vec<String> {
    DEFAULT_ROOMS.iter().map(|r| r.to_string()).collect()
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
            backbone: BackboneConfig::default(),
            rooms: RoomsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            allowed_origins: default_allowed_origins(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            url: default_backbone_url(),
        }
    }
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            names: default_room_names(),
            echo_to_sender: true,
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

impl TransportConfig {
    /// Check an `Origin` header against the allowed origins.
    ///
    /// Requests without an origin (non-browser clients) are allowed.
    #[must_use]
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allows_any_origin() {
            return true;
        }
        match origin {
            Some(origin) => self.allowed_origins.iter().any(|o| o == origin),
            None => true,
        }
    }

    /// Whether the origin list contains the `"*"` wildcard.
    #[must_use]
    pub fn allows_any_origin(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }
}

impl Config {
    /// Load configuration from an explicit file, a default path, or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        let config_paths = [
            "parlor.toml",
            "/etc/parlor/parlor.toml",
            "~/.config/parlor/parlor.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Build the room registry from the configured names.
    ///
    /// # Errors
    ///
    /// Returns an error if the room set is empty or contains bad names.
    pub fn registry(&self) -> Result<RoomRegistry, RegistryError> {
        RoomRegistry::new(&self.rooms.names)
    }

    /// Relay settings derived from this configuration.
    #[must_use]
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            echo_to_sender: self.rooms.echo_to_sender,
        }
    }
}
