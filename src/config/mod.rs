//! Configuration management

use crate::crypto::CipherSuite;
use crate::limiter::{DEFAULT_BURST_BYTES, DEFAULT_MAX_CONNECTIONS_PER_USER, DEFAULT_RATE_BYTES_PER_SEC};
use crate::mode::{FeaturePolicy, VpnMode};
use crate::obfuscation::DEFAULT_PADDING_TARGET;
use crate::protocol::{DEFAULT_PORT, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::server::ServerSettings;
use crate::session::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest datagram the server will ever pad to
const MAX_DATAGRAM: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE + 5;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Check every present section
    pub fn validate(&self) -> Result<(), crate::Error> {
        if let Some(server) = &self.server {
            server.validate()?;
        }
        if let Some(client) = &self.client {
            client.validate()?;
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Tunnel network in CIDR notation
    pub vpn_network: String,
    /// Maximum concurrent sessions
    pub max_clients: usize,
    /// Idle seconds before a session is closed
    pub connection_timeout_secs: u64,
    /// Seconds between expiry sweeps
    pub sweep_interval_secs: u64,
    /// Consecutive decrypt failures that close a session
    pub max_decrypt_failures: u32,
    /// `chacha20-poly1305` or `aes-256-gcm`
    pub cipher: String,
    /// Reject handshakes without valid credentials
    pub require_auth: bool,
    /// User database (JSON)
    pub users_db: Option<PathBuf>,
    pub security: SecurityConfig,
    pub rate_limiting: RateLimitConfig,
    pub network: NetworkConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            vpn_network: "10.9.0.0/24".to_string(),
            max_clients: 1000,
            connection_timeout_secs: 120,
            sweep_interval_secs: 5,
            max_decrypt_failures: 3,
            cipher: CipherSuite::default().name().to_string(),
            require_auth: false,
            users_db: None,
            security: SecurityConfig::default(),
            rate_limiting: RateLimitConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Socket address to bind
    pub fn bind_addr(&self) -> Result<SocketAddr, crate::Error> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| crate::Error::Config(format!("Invalid bind host: {:?}", self.host)))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn cipher_suite(&self) -> Result<CipherSuite, crate::Error> {
        CipherSuite::from_name(&self.cipher).map_err(|e| crate::Error::Config(e.to_string()))
    }

    pub fn network(&self) -> Result<Ipv4Net, crate::Error> {
        self.vpn_network
            .parse()
            .map_err(|e| crate::Error::Config(format!("{}", e)))
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        self.bind_addr()?;
        self.cipher_suite()?;
        self.network()?;

        if self.connection_timeout_secs == 0 {
            return Err(crate::Error::Config("connection_timeout_secs must be > 0".into()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(crate::Error::Config("sweep_interval_secs must be > 0".into()));
        }
        if self.max_clients == 0 {
            return Err(crate::Error::Config("max_clients must be > 0".into()));
        }
        let target = self.security.padding_target;
        if target == 0 || target > MAX_DATAGRAM {
            return Err(crate::Error::Config(format!(
                "padding_target must be in 1..={}, got {}",
                MAX_DATAGRAM, target
            )));
        }
        let rate = &self.rate_limiting;
        if rate.default_limit_bytes_per_sec == 0 || rate.burst_size == 0 {
            return Err(crate::Error::Config("rate limit and burst size must be > 0".into()));
        }
        if rate.max_connections_per_user == 0 {
            return Err(crate::Error::Config("max_connections_per_user must be > 0".into()));
        }
        Ok(())
    }

    /// Runtime settings for the server core
    pub fn settings(&self) -> Result<ServerSettings, crate::Error> {
        self.validate()?;
        Ok(ServerSettings {
            max_clients: self.max_clients,
            session_timeout: Duration::from_secs(self.connection_timeout_secs),
            max_decrypt_failures: self.max_decrypt_failures.max(1),
            cipher: CipherSuite::negotiate(self.cipher_suite()?),
            require_auth: self.require_auth,
            policy: self.security.policy(),
            padding_target: self.security.padding_target,
            allow_unknown_mode: self.security.allow_unknown_mode,
            rate_limiting: self.rate_limiting.enabled,
            rate_limit: self.rate_limiting.default_limit_bytes_per_sec,
            burst_size: self.rate_limiting.burst_size,
            max_connections_per_user: self.rate_limiting.max_connections_per_user,
            vpn_network: Some(self.network()?),
            ..ServerSettings::default()
        })
    }
}

/// Server-wide feature vetoes and mode policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub enable_obfuscation: bool,
    pub enable_padding: bool,
    pub enable_compression: bool,
    /// Datagram size padding grows to
    pub padding_target: usize,
    /// Unknown mode names fall back to normal instead of being dropped
    pub allow_unknown_mode: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_obfuscation: true,
            enable_padding: true,
            enable_compression: true,
            padding_target: DEFAULT_PADDING_TARGET,
            allow_unknown_mode: true,
        }
    }
}

impl SecurityConfig {
    pub fn policy(&self) -> FeaturePolicy {
        FeaturePolicy {
            obfuscation: self.enable_obfuscation,
            padding: self.enable_padding,
            compression: self.enable_compression,
        }
    }
}

/// Per-session throughput limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub default_limit_bytes_per_sec: u64,
    pub burst_size: u64,
    pub max_connections_per_user: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_limit_bytes_per_sec: DEFAULT_RATE_BYTES_PER_SEC,
            burst_size: DEFAULT_BURST_BYTES,
            max_connections_per_user: DEFAULT_MAX_CONNECTIONS_PER_USER,
        }
    }
}

/// Public endpoint discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub enable_nat_traversal: bool,
    pub stun_servers: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enable_nat_traversal: false,
            stun_servers: vec![
                "stun.l.google.com:19302".to_string(),
                "stun1.l.google.com:19302".to_string(),
            ],
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address (`host:port`)
    pub server: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Requested privacy mode
    pub mode: String,
    /// Seconds of idleness before a keepalive is sent
    pub keepalive_secs: u64,
    /// Seconds to wait for the handshake to finish
    pub handshake_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: format!("127.0.0.1:{}", DEFAULT_PORT),
            username: None,
            password: None,
            mode: VpnMode::Normal.name().to_string(),
            keepalive_secs: 25,
            handshake_timeout_secs: 10,
        }
    }
}

impl ClientConfig {
    /// Requested mode; unknown names are passed through so the server's
    /// fallback policy decides
    pub fn vpn_mode(&self) -> Option<VpnMode> {
        VpnMode::from_name(&self.mode)
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.server.trim().is_empty() {
            return Err(crate::Error::Config("client.server must be set".into()));
        }
        if self.keepalive_secs == 0 || self.handshake_timeout_secs == 0 {
            return Err(crate::Error::Config(
                "keepalive_secs and handshake_timeout_secs must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: Some(ServerConfig::default()),
        client: Some(ClientConfig::default()),
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("phazevpn.toml");

        generate_example_config().save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();

        let server = loaded.server.unwrap();
        assert_eq!(server.port, DEFAULT_PORT);
        assert_eq!(server.vpn_network, "10.9.0.0/24");
        assert_eq!(server.security.padding_target, 1500);
        assert_eq!(loaded.logging.level, "warn");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9000

            [server.security]
            enable_compression = false
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        let server = config.server.unwrap();
        assert_eq!(server.port, 9000);
        assert_eq!(server.max_clients, 1000);
        assert!(!server.security.policy().compression);
        assert!(server.security.policy().padding);
    }

    #[test]
    fn test_validation_failures() {
        let bad_host = ServerConfig {
            host: "not-an-ip".into(),
            ..ServerConfig::default()
        };
        assert!(bad_host.validate().is_err());

        let bad_cipher = ServerConfig {
            cipher: "rot13".into(),
            ..ServerConfig::default()
        };
        assert!(bad_cipher.validate().is_err());

        let zero_timeout = ServerConfig {
            connection_timeout_secs: 0,
            ..ServerConfig::default()
        };
        assert!(zero_timeout.validate().is_err());

        let mut huge_padding = ServerConfig::default();
        huge_padding.security.padding_target = 70_000;
        assert!(huge_padding.validate().is_err());

        let mut no_rate = ServerConfig::default();
        no_rate.rate_limiting.burst_size = 0;
        assert!(no_rate.validate().is_err());

        let bad_net = ServerConfig {
            vpn_network: "10.9.0.0".into(),
            ..ServerConfig::default()
        };
        assert!(bad_net.validate().is_err());
    }

    #[test]
    fn test_settings_conversion() {
        let server = ServerConfig {
            cipher: "aes-256-gcm".into(),
            require_auth: true,
            ..ServerConfig::default()
        };
        let settings = server.settings().unwrap();
        assert_eq!(settings.cipher, CipherSuite::Aes256Gcm);
        assert!(settings.require_auth);
        assert_eq!(settings.session_timeout, Duration::from_secs(120));
        assert_eq!(settings.vpn_network.unwrap().prefix(), 24);
    }
}
