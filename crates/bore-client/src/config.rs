//! Client configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Everything the agent needs to establish and keep a tunnel.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// bore server host name or address.
    pub server_host: String,
    /// QUIC port of the bore server.
    pub server_port: u16,
    /// Host of the service being exposed.
    pub local_host: String,
    /// Port of the service being exposed.
    pub local_port: u16,
    /// Address the server binds the public listener on.
    pub bind_host: String,
    /// Public port to request; `0` lets the server pick one.
    pub bind_port: u16,
    /// Custom tunnel identifier (subdomain).
    pub id: Option<String>,
    /// Send periodic keepalive requests.
    pub keep_alive: bool,
    pub keepalive_interval: Duration,
    /// Shared password, if the server requires one.
    pub password: Option<String>,
    /// Reconnect after the tunnel drops.
    pub reconnect: bool,
    pub reconnect_delay: Duration,
    /// PEM file with the certificate the server must present. Without it any
    /// server certificate is accepted.
    pub ca_cert: Option<PathBuf>,
    /// Connection is considered dead after this long without traffic.
    pub idle_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: "bore.services".into(),
            server_port: 2200,
            local_host: "localhost".into(),
            local_port: 80,
            bind_host: "127.0.0.1".into(),
            bind_port: 0,
            id: None,
            keep_alive: true,
            keepalive_interval: Duration::from_secs(60),
            password: None,
            reconnect: false,
            reconnect_delay: Duration::from_secs(5),
            ca_cert: None,
            idle_timeout: Duration::from_secs(120),
        }
    }
}

impl ClientConfig {
    /// `host:port` of the server.
    pub fn server_addr(&self) -> String {
        join_host_port(&self.server_host, self.server_port)
    }

    /// `host:port` of the local service.
    pub fn local_addr(&self) -> String {
        join_host_port(&self.local_host, self.local_port)
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
