//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (BEACON_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Redis endpoint for the presence store and pub/sub bus.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Token verification.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Presence soft state.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Typing indicator soft state.
    #[serde(default)]
    pub typing: TypingConfig,

    /// Heartbeat watchdog.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Allowed origins for the upgrade handshake.
    #[serde(default)]
    pub cors: CorsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Token verification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Signing algorithm: "HS256" or "RS256".
    #[serde(default = "default_auth_algorithm")]
    pub algorithm: String,

    /// Shared secret for HS256.
    #[serde(default = "default_hmac_secret")]
    pub hmac_secret: Option<String>,

    /// Path to a PEM-encoded RSA public key for RS256.
    #[serde(default)]
    pub public_key_path: Option<String>,

    /// Expected `iss` claim, checked when set.
    #[serde(default)]
    pub issuer: Option<String>,
}

/// Presence TTL configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Presence record TTL in seconds.
    #[serde(default = "default_presence_ttl")]
    pub ttl_secs: u64,
}

/// Typing indicator TTL configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingConfig {
    /// Typing indicator TTL in seconds.
    #[serde(default = "default_typing_ttl")]
    pub ttl_secs: u64,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Watchdog check interval in seconds. A connection silent for twice
    /// this long is closed.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
}

/// CORS configuration for the upgrade handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Origins allowed to open connections.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
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
    std::env::var("BEACON_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("BEACON_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8006)
}

fn default_redis_url() -> String {
    std::env::var("BEACON_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string())
}

fn default_auth_algorithm() -> String {
    "HS256".to_string()
}

fn default_hmac_secret() -> Option<String> {
    std::env::var("BEACON_JWT_SECRET").ok()
}

fn default_presence_ttl() -> u64 {
    300 // 5 minutes
}

fn default_typing_ttl() -> u64 {
    5
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_allowed_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".to_string(),
        "http://localhost:5173".to_string(),
    ]
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            redis_url: default_redis_url(),
            auth: AuthConfig::default(),
            presence: PresenceConfig::default(),
            typing: TypingConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            cors: CorsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            algorithm: default_auth_algorithm(),
            hmac_secret: default_hmac_secret(),
            public_key_path: None,
            issuer: None,
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_presence_ttl(),
        }
    }
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_typing_ttl(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_allowed_origins(),
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
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "beacon.toml",
            "/etc/beacon/beacon.toml",
            "~/.config/beacon/beacon.toml",
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
    /// Returns an error if host and port do not form a valid address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Heartbeat watchdog interval.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat.interval_secs)
    }

    /// Presence record TTL.
    #[must_use]
    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence.ttl_secs)
    }

    /// Typing indicator TTL.
    #[must_use]
    pub fn typing_ttl(&self) -> Duration {
        Duration::from_secs(self.typing.ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.presence.ttl_secs, 300);
        assert_eq!(config.typing.ttl_secs, 5);
        assert_eq!(config.heartbeat.interval_secs, 30);
        assert_eq!(config.auth.algorithm, "HS256");
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000
            redis_url = "redis://redis:6379/0"

            [presence]
            ttl_secs = 60

            [cors]
            allowed_origins = ["https://chat.example.com"]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.presence.ttl_secs, 60);
        assert_eq!(config.typing.ttl_secs, 5);
        assert_eq!(
            config.cors.allowed_origins,
            vec!["https://chat.example.com".to_string()]
        );
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8006,
            ..Config::default()
        };
        assert_eq!(config.bind_addr().unwrap().port(), 8006);
    }
}
