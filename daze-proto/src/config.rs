/// Ambient configuration: the registry refresh policy, connection limits,
/// and logging knobs that sit around the core protocol. Listen/server
/// addresses are CLI-driven per the spec's external interface and are not
/// duplicated here; everything in this module has a sane default so a
/// config file is optional on both binaries.
use serde::Deserialize;
use std::path::Path;

// ── Client config ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            limits: LimitsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Policy for building the CIDR table consulted by the router.
#[derive(Debug, Deserialize)]
pub struct RegistryConfig {
    /// Two-letter country code whose IPv4 allocations route DIRECT.
    #[serde(default = "default_country")]
    pub country: String,
    /// Where the downloaded registry file is cached.
    #[serde(default = "default_cache_path")]
    pub cache_path: String,
    /// Registry file to fetch when the cache is missing or stale.
    #[serde(default = "default_source_url")]
    pub source_url: String,
    /// Cache max age before a refresh is attempted.
    #[serde(default = "default_refresh_days")]
    pub refresh_days: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            country: default_country(),
            cache_path: default_cache_path(),
            source_url: default_source_url(),
            refresh_days: default_refresh_days(),
        }
    }
}

// ── Server config ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            limits: LimitsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

// ── Shared ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct LimitsConfig {
    /// Size of the worker pool bounding concurrently active sessions.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Handshake read deadline, in seconds. Enforced only while the key,
    /// auth frame, and destination frame are being read; the session is
    /// untimed once the target dial begins.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_sec: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            handshake_timeout_sec: default_handshake_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

// ── Defaults ─────────────────────────────────────────────────────────

fn default_country() -> String {
    "CN".into()
}
fn default_cache_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    format!("{}/.daze/delegated-apnic-latest", home)
}
fn default_source_url() -> String {
    "http://ftp.apnic.net/apnic/stats/apnic/delegated-apnic-latest".into()
}
fn default_refresh_days() -> u64 {
    28
}
fn default_max_connections() -> u32 {
    128
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".into()
}

// ── Loaders ──────────────────────────────────────────────────────────

/// Load the client config from `path`, or fall back to defaults if no path
/// was given — a config file is optional, CLI flags carry the rest.
pub fn load_client_config(path: Option<&Path>) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        }
        None => Ok(ClientConfig::default()),
    }
}

/// Load the server config from `path`, or fall back to defaults.
pub fn load_server_config(path: Option<&Path>) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        }
        None => Ok(ServerConfig::default()),
    }
}
