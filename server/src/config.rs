//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `LEASEGW_LISTEN`, `LEASEGW_PROVIDER`,
//!    `LEASEGW_TLS_CERT`, `LEASEGW_TLS_KEY`, `LEASEGW_REGISTRY`
//! 2. **Config file**: path via `--config <path>`, or `leasegw.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8443"
//! provider = "akash1..."          # this provider's account address
//! address_prefix = "akash"
//! max_connections = 256
//!
//! [tls]
//! cert = "/etc/leasegw/provider.pem"
//! key = "/etc/leasegw/provider-key.pem"
//! require_client_cert = true
//!
//! [registry]
//! path = "/etc/leasegw/registry.toml"
//!
//! [stream]
//! ping_period_secs = 10
//! pong_wait_secs = 15
//!
//! [logging]
//! level = "info"
//!
//! # Local execution backend: one entry per lease served by this host
//! [[local.leases]]
//! owner = "akash1..."
//! dseq = 42
//! gseq = 1
//! oseq = 1
//!
//! [[local.leases.services]]
//! name = "web"
//! replicas = 1
//! working_dir = "/srv/web"
//! log_files = ["/var/log/web.log"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::address::{AccountAddress, DEFAULT_HRP};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub local: LocalConfig,
}

/// Listener and identity settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8443`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// This provider's account address. Required; override with
    /// `LEASEGW_PROVIDER`.
    #[serde(default)]
    pub provider: String,
    /// Bech32 prefix every peer CommonName must carry (default `akash`).
    #[serde(default = "default_address_prefix")]
    pub address_prefix: String,
    /// Maximum concurrent TLS connections (default 256).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Seconds allowed for the TLS handshake and registry check (default 10).
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

/// Listener certificate settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain (default `provider.pem`).
    #[serde(default = "default_tls_cert")]
    pub cert: PathBuf,
    /// PEM private key (default `provider-key.pem`).
    #[serde(default = "default_tls_key")]
    pub key: PathBuf,
    /// Refuse connections that present no client certificate (default true).
    /// When false, anonymous callers may reach the public routes only.
    #[serde(default = "default_require_client_cert")]
    pub require_client_cert: bool,
}

/// Where the certificate registry is loaded from.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// TOML registry file (default `registry.toml`).
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,
}

/// Keepalive timing for the streaming WebSockets.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct StreamConfig {
    /// Seconds between pings (default 10).
    #[serde(default = "default_ping_period")]
    pub ping_period_secs: u64,
    /// Seconds to wait for a pong before giving up (default 15).
    #[serde(default = "default_pong_wait")]
    pub pong_wait_secs: u64,
}

impl StreamConfig {
    pub fn ping_period(&self) -> Duration {
        Duration::from_secs(self.ping_period_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Leases served by the local execution backend.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LocalConfig {
    #[serde(default)]
    pub leases: Vec<LocalLeaseConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalLeaseConfig {
    pub owner: String,
    pub dseq: u64,
    #[serde(default = "default_seq")]
    pub gseq: u32,
    #[serde(default = "default_seq")]
    pub oseq: u32,
    #[serde(default)]
    pub services: Vec<LocalServiceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalServiceConfig {
    pub name: String,
    /// Number of pods; `podIndex` must be below this (default 1).
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    /// Whether the service currently accepts exec (default true).
    #[serde(default = "default_running")]
    pub running: bool,
    /// Working directory for exec (default `/`).
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    /// Log files tailed for this service, one source per file.
    #[serde(default)]
    pub log_files: Vec<PathBuf>,
    /// URIs reported in the service status.
    #[serde(default)]
    pub uris: Vec<String>,
    /// Whether the service is exposed globally (default true).
    #[serde(default = "default_running")]
    pub global: bool,
}

fn default_listen() -> String {
    "0.0.0.0:8443".to_string()
}
fn default_address_prefix() -> String {
    DEFAULT_HRP.to_string()
}
fn default_max_connections() -> usize {
    256
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_tls_cert() -> PathBuf {
    PathBuf::from("provider.pem")
}
fn default_tls_key() -> PathBuf {
    PathBuf::from("provider-key.pem")
}
fn default_require_client_cert() -> bool {
    true
}
fn default_registry_path() -> PathBuf {
    PathBuf::from("registry.toml")
}
fn default_ping_period() -> u64 {
    10
}
fn default_pong_wait() -> u64 {
    15
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_seq() -> u32 {
    1
}
fn default_replicas() -> u32 {
    1
}
fn default_running() -> bool {
    true
}
fn default_working_dir() -> String {
    "/".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            provider: String::new(),
            address_prefix: default_address_prefix(),
            max_connections: default_max_connections(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert: default_tls_cert(),
            key: default_tls_key(),
            require_client_cert: default_require_client_cert(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ping_period_secs: default_ping_period(),
            pong_wait_secs: default_pong_wait(),
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
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for `leasegw.toml`
    /// in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("leasegw.toml").exists() => {
                Self::from_file(Path::new("leasegw.toml"))?
            }
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = get("LEASEGW_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(provider) = get("LEASEGW_PROVIDER") {
            self.server.provider = provider;
        }
        if let Some(cert) = get("LEASEGW_TLS_CERT") {
            self.tls.cert = PathBuf::from(cert);
        }
        if let Some(key) = get("LEASEGW_TLS_KEY") {
            self.tls.key = PathBuf::from(key);
        }
        if let Some(registry) = get("LEASEGW_REGISTRY") {
            self.registry.path = PathBuf::from(registry);
        }
    }

    /// Cross-field checks that serde defaults cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.provider_address()?;
        if self.stream.ping_period_secs == 0 {
            return Err(ConfigError::Invalid(
                "stream.ping_period_secs must be positive".to_string(),
            ));
        }
        if self.stream.ping_period_secs >= self.stream.pong_wait_secs {
            return Err(ConfigError::Invalid(format!(
                "stream.ping_period_secs ({}) must be shorter than stream.pong_wait_secs ({})",
                self.stream.ping_period_secs, self.stream.pong_wait_secs
            )));
        }
        if self.server.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "server.max_connections must be positive".to_string(),
            ));
        }
        for lease in &self.local.leases {
            AccountAddress::parse_with_prefix(&lease.owner, &self.server.address_prefix)
                .map_err(|e| {
                    ConfigError::Invalid(format!("local lease owner {:?}: {e}", lease.owner))
                })?;
        }
        Ok(())
    }

    pub fn provider_address(&self) -> Result<AccountAddress, ConfigError> {
        if self.server.provider.is_empty() {
            return Err(ConfigError::Invalid(
                "server.provider is not set (or set LEASEGW_PROVIDER)".to_string(),
            ));
        }
        AccountAddress::parse_with_prefix(&self.server.provider, &self.server.address_prefix)
            .map_err(|e| ConfigError::Invalid(format!("server.provider: {e}")))
    }
}
