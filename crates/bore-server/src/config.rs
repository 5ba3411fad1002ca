//! Server configuration: TOML file + CLI/environment overrides.

use bore_core::{BoreError, BoreResult};
use serde::Deserialize;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub tunnel: TunnelSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_tunnel_addr")]
    pub tunnel_addr: String,
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    #[serde(default = "default_cert_path")]
    pub cert: String,
    #[serde(default = "default_key_path")]
    pub key: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            tunnel_addr: default_tunnel_addr(),
            http_addr: default_http_addr(),
            cert: default_cert_path(),
            key: default_key_path(),
        }
    }
}

/// `[tunnel]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSection {
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            password: None,
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

fn default_domain() -> String {
    "example.com".to_string()
}
fn default_tunnel_addr() -> String {
    "0.0.0.0:2200".to_string()
}
fn default_http_addr() -> String {
    "0.0.0.0:2000".to_string()
}
fn default_cert_path() -> String {
    "~/.bore/cert.pem".to_string()
}
fn default_key_path() -> String {
    "~/.bore/key.pem".to_string()
}
fn default_port_range_start() -> u16 {
    55000
}
fn default_port_range_end() -> u16 {
    65000
}
fn default_idle_timeout() -> u64 {
    120
}

/// Values given on the command line (or through `BORE_*` variables).
/// Each one that is set wins over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub domain: Option<String>,
    pub tunnel_addr: Option<String>,
    pub http_addr: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub password: Option<String>,
    pub port_range_start: Option<u16>,
    pub port_range_end: Option<u16>,
    pub idle_timeout: Option<u64>,
}

/// Resolved server configuration (all paths expanded, overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The server's own hostname; tunnels live at `<id>.<domain>`.
    pub domain: String,
    /// UDP address of the QUIC tunnel endpoint.
    pub tunnel_addr: SocketAddr,
    /// TCP address of the HTTP router.
    pub http_addr: SocketAddr,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// Shared password clients must present before anything else.
    pub password: Option<String>,
    /// Ports handed out for auto-assigned forwards.
    pub port_range: RangeInclusive<u16>,
    /// Connections with no traffic for this long are reaped.
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            tunnel_addr: SocketAddr::from(([0, 0, 0, 0], 2200)),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 2000)),
            cert_path: expand_tilde_str(&default_cert_path()),
            key_path: expand_tilde_str(&default_key_path()),
            password: None,
            port_range: default_port_range_start()..=default_port_range_end(),
            idle_timeout: Duration::from_secs(default_idle_timeout()),
        }
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply overrides.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> BoreResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| BoreError::Config(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        Self::resolve(file_config, overrides)
    }

    fn resolve(file: ConfigFile, overrides: ConfigOverrides) -> BoreResult<Self> {
        let domain = overrides
            .domain
            .unwrap_or(file.server.domain)
            .trim()
            .trim_end_matches('.')
            .to_ascii_lowercase();
        if domain.is_empty() {
            return Err(BoreError::Config("domain must not be empty".into()));
        }

        let tunnel_addr = parse_addr(
            "tunnel_addr",
            &overrides.tunnel_addr.unwrap_or(file.server.tunnel_addr),
        )?;
        let http_addr = parse_addr(
            "http_addr",
            &overrides.http_addr.unwrap_or(file.server.http_addr),
        )?;

        let start = overrides
            .port_range_start
            .unwrap_or(file.tunnel.port_range_start);
        let end = overrides.port_range_end.unwrap_or(file.tunnel.port_range_end);
        if start == 0 || start > end {
            return Err(BoreError::Config(format!(
                "invalid port range {start}-{end}"
            )));
        }

        let idle_timeout = overrides.idle_timeout.unwrap_or(file.tunnel.idle_timeout);
        if idle_timeout == 0 {
            return Err(BoreError::Config("idle_timeout must be positive".into()));
        }

        let password = overrides
            .password
            .or(file.tunnel.password)
            .filter(|p| !p.is_empty());

        Ok(Self {
            domain,
            tunnel_addr,
            http_addr,
            cert_path: expand_tilde_str(&overrides.cert.unwrap_or(file.server.cert)),
            key_path: expand_tilde_str(&overrides.key.unwrap_or(file.server.key)),
            password,
            port_range: start..=end,
            idle_timeout: Duration::from_secs(idle_timeout),
        })
    }
}

fn parse_addr(field: &str, value: &str) -> BoreResult<SocketAddr> {
    value
        .parse()
        .map_err(|e| BoreError::Config(format!("invalid {field} {value:?}: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
