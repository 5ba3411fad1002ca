//! bore: expose a local port through a bore server.
//!
//! Keeps a QUIC tunnel to the server, prints the public URLs it announces,
//! and forwards every inbound connection to the local service.

use bore_client::{ClientConfig, TunnelAgent};
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// bore: reverse tunnel client
#[derive(Parser, Debug)]
#[command(name = "bore", version, about = "Expose a local port through a bore server")]
struct Cli {
    /// bore server host
    #[arg(short = 's', long = "server", default_value = "bore.services")]
    server: String,

    /// bore server port
    #[arg(short = 'p', long = "port", default_value_t = 2200)]
    port: u16,

    /// Local service host
    #[arg(long = "local-host", alias = "ls", default_value = "localhost")]
    local_host: String,

    /// Local service port
    #[arg(short = 'l', long = "local-port", alias = "lp", default_value_t = 80)]
    local_port: u16,

    /// Address the server binds the public port on
    #[arg(long = "bind-host", default_value = "127.0.0.1")]
    bind_host: String,

    /// Public port to request (0 picks a random one)
    #[arg(short = 'b', long = "bind-port", alias = "bp", default_value_t = 0)]
    bind_port: u16,

    /// Identifier to use in the tunnel URL (random if omitted)
    #[arg(short = 'i', long = "id")]
    id: Option<String>,

    /// Keep the tunnel alive with periodic keepalive requests
    #[arg(short = 'a', long = "keep-alive", action = ArgAction::Set, default_value_t = true)]
    keep_alive: bool,

    /// Reconnect when the tunnel drops
    #[arg(short = 'r', long = "reconnect")]
    reconnect: bool,

    /// Password for servers that require one
    #[arg(long, env = "BORE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// PEM certificate the server must present
    #[arg(long = "ca-cert")]
    ca_cert: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "BORE_LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

impl Cli {
    fn client_config(self) -> ClientConfig {
        ClientConfig {
            server_host: self.server,
            server_port: self.port,
            local_host: self.local_host,
            local_port: self.local_port,
            bind_host: self.bind_host,
            bind_port: self.bind_port,
            id: self.id.filter(|id| !id.is_empty()),
            keep_alive: self.keep_alive,
            password: self.password.filter(|p| !p.is_empty()),
            reconnect: self.reconnect,
            ca_cert: self.ca_cert,
            ..ClientConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let agent = TunnelAgent::new(cli.client_config());

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, closing tunnel");
            signal_cancel.cancel();
        }
    });

    agent.run_with_reconnect(tokio::io::stdout, cancel).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_flags_match_the_classic_client() {
        let cli = Cli::parse_from([
            "bore", "-s", "tunnel.example.com", "-p", "2201", "--ls", "127.0.0.1", "--lp", "3000",
            "--bp", "8080", "--id", "myapp", "-a", "false", "-r",
        ]);
        let config = cli.client_config();
        assert_eq!(config.server_addr(), "tunnel.example.com:2201");
        assert_eq!(config.local_addr(), "127.0.0.1:3000");
        assert_eq!(config.bind_port, 8080);
        assert_eq!(config.id.as_deref(), Some("myapp"));
        assert!(!config.keep_alive);
        assert!(config.reconnect);
    }

    #[test]
    fn defaults() {
        let config = Cli::parse_from(["bore"]).client_config();
        assert_eq!(config.server_addr(), "bore.services:2200");
        assert_eq!(config.local_addr(), "localhost:80");
        assert_eq!(config.bind_host, "127.0.0.1");
        assert!(config.keep_alive);
        assert!(!config.reconnect);
        assert!(config.id.is_none());
    }
}
