//! Configuration loading and validation for the gateway.
//!
//! Values come from an optional JSON file (path in `RPC_GATEWAY_CONFIG`,
//! default `config.json`) overlaid by environment variables such as
//! `RPC_GATEWAY__HTTP__CONNECTION__MAXIMUM=512`. The process refuses to start
//! if the merged configuration is unsatisfiable.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Environment variable naming the JSON configuration file.
pub const CONFIG_PATH_ENV: &str = "RPC_GATEWAY_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "config.json";
const ENV_PREFIX: &str = "RPC_GATEWAY";

/// Keep-alive clock used when keep-alive is disabled. A zero-length idle
/// window would drop clients before their first request line arrives.
pub const MINIMAL_KEEP_ALIVE: Duration = Duration::from_millis(100);

/// Validated gateway configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level", rename = "logLevel", alias = "loglevel")]
    pub log_level: String,

    /// The HTTP/HTTPS interface.
    #[serde(default)]
    pub http: HttpConfig,
}

/// Options for the HTTP interface and its listeners.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Plaintext listener.
    #[serde(rename = "default")]
    pub plain: PlainListenerConfig,
    /// TLS listener.
    pub tls: TlsListenerConfig,
    /// Connection admission and lifecycle limits.
    pub connection: ConnectionConfig,
    /// HMAC request signing.
    pub authentication: AuthenticationConfig,
    /// Interface addresses to bind. Empty means all interfaces.
    pub ip: Vec<String>,
    /// Also bind the IPv6 wildcard when `ip` is empty.
    pub ipv6: bool,
}

/// Plaintext listener options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlainListenerConfig {
    pub enabled: bool,
    pub port: u16,
}

/// TLS listener options and certificate material locations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsListenerConfig {
    pub enabled: bool,
    pub port: u16,

    /// PEM-encoded leaf certificate.
    #[serde(rename = "certificatePath", alias = "certificatepath")]
    pub certificate_path: String,

    /// PEM-encoded private key, PKCS#8 encrypted when a passphrase is set.
    #[serde(rename = "privateKeyPath", alias = "privatekeypath")]
    pub private_key_path: String,

    /// Passphrase for the private key. Empty means the key is unencrypted.
    #[serde(rename = "privateKeyPassphrase", alias = "privatekeypassphrase")]
    pub private_key_passphrase: String,

    /// Intermediate certificates, in chain order.
    #[serde(rename = "certificateChainPaths", alias = "certificatechainpaths")]
    pub certificate_chain_paths: Vec<String>,
}

/// Connection policy limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Inactivity timeout in seconds enforced by the admission chain. `0` disables it.
    pub timeout: u64,

    /// Keep-alive idle window in seconds. `0` closes after every response.
    #[serde(rename = "keepAlive", alias = "keepalive")]
    pub keep_alive: u64,

    /// Maximum concurrent connections across all peers.
    pub maximum: usize,

    /// Maximum concurrent connections from a single peer host.
    #[serde(rename = "maximumByPeer", alias = "maximumbypeer")]
    pub maximum_by_peer: usize,

    /// TCP listen backlog.
    #[serde(rename = "queueSize", alias = "queuesize")]
    pub queue_size: u32,

    /// Worker threads available for parsing, authentication, and dispatch.
    pub workers: usize,
}

/// HMAC-SHA512 request authentication options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthenticationConfig {
    /// Shared signing key. Empty disables authentication.
    pub key: String,

    /// Accepted clock skew between the request `time` and now, in seconds.
    #[serde(rename = "maximumTimeOffset", alias = "maximumtimeoffset")]
    pub maximum_time_offset: u64,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_plain_port() -> u16 {
    8080
}
fn default_tls_port() -> u16 {
    8443
}
fn default_timeout() -> u64 {
    60
}
fn default_keep_alive() -> u64 {
    15
}
fn default_maximum() -> usize {
    1024
}
fn default_maximum_by_peer() -> usize {
    64
}
fn default_queue_size() -> u32 {
    128
}
fn default_workers() -> usize {
    10
}
fn default_maximum_time_offset() -> u64 {
    30
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            plain: PlainListenerConfig::default(),
            tls: TlsListenerConfig::default(),
            connection: ConnectionConfig::default(),
            authentication: AuthenticationConfig {
                key: String::new(),
                maximum_time_offset: default_maximum_time_offset(),
            },
            ip: Vec::new(),
            ipv6: false,
        }
    }
}

impl Default for PlainListenerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_plain_port(),
        }
    }
}

impl Default for TlsListenerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_tls_port(),
            certificate_path: String::new(),
            private_key_path: String::new(),
            private_key_passphrase: String::new(),
            certificate_chain_paths: Vec::new(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            keep_alive: default_keep_alive(),
            maximum: default_maximum(),
            maximum_by_peer: default_maximum_by_peer(),
            queue_size: default_queue_size(),
            workers: default_workers(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            http: HttpConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Inactivity timeout applied by the admission chain, if enabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }

    /// Whether connections stay open between requests.
    pub fn keep_alive_enabled(&self) -> bool {
        self.keep_alive > 0
    }

    /// Idle window of the connection protocol between requests.
    pub fn keep_alive_timeout(&self) -> Duration {
        if self.keep_alive_enabled() {
            Duration::from_secs(self.keep_alive)
        } else {
            MINIMAL_KEEP_ALIVE
        }
    }
}

impl HttpConfig {
    /// Parse the configured interface addresses.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first entry that is not an IP address.
    pub fn interface_addrs(&self) -> Result<Vec<IpAddr>> {
        self.ip
            .iter()
            .map(|ip| {
                ip.trim()
                    .parse::<IpAddr>()
                    .with_context(|| format!("http.ip entry {ip:?} is not an IP address"))
            })
            .collect()
    }
}

impl Config {
    /// Load and validate configuration from the JSON file and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());

        let cfg = config::Config::builder()
            .add_source(config::File::new(&path, config::FileFormat::Json).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("failed to build configuration from {path} and environment"))?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Parse and validate configuration from a JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or validation fails.
    pub fn from_json(json: &str) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::from_str(json, config::FileFormat::Json))
            .build()
            .context("failed to parse configuration document")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    pub fn validate(&self) -> Result<()> {
        let http = &self.http;
        let conn = &http.connection;

        if conn.maximum < conn.maximum_by_peer {
            anyhow::bail!(
                "http.connection.maximum ({}) cannot be lower than http.connection.maximumByPeer ({})",
                conn.maximum,
                conn.maximum_by_peer
            );
        }
        if conn.maximum == 0 {
            anyhow::bail!("http.connection.maximum must be > 0");
        }
        if conn.maximum_by_peer == 0 {
            anyhow::bail!("http.connection.maximumByPeer must be > 0");
        }
        if conn.queue_size == 0 {
            anyhow::bail!("http.connection.queueSize must be > 0");
        }
        if conn.workers == 0 {
            anyhow::bail!("http.connection.workers must be > 0");
        }
        if !http.plain.enabled && !http.tls.enabled {
            anyhow::bail!("at least one of http.default and http.tls must be enabled");
        }
        if http.tls.enabled {
            ensure_non_empty(&http.tls.certificate_path, "http.tls.certificatePath")?;
            ensure_non_empty(&http.tls.private_key_path, "http.tls.privateKeyPath")?;
            for path in &http.tls.certificate_chain_paths {
                ensure_non_empty(path, "http.tls.certificateChainPaths entry")?;
            }
        }
        http.interface_addrs()?;
        Ok(())
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}
