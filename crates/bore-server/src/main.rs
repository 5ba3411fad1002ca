//! bore-server: reverse tunnel server.
//!
//! Accepts QUIC tunnel clients, hands each a public TCP port, and routes
//! HTTP requests for `<id>.<domain>` to the matching tunnel.

use anyhow::Context;
use bore_server::config::ConfigOverrides;
use bore_server::tls::{generate_self_signed_cert, load_tls_config};
use bore_server::{BoreServer, ServerConfig};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// bore-server: reverse tunnel server
#[derive(Parser, Debug)]
#[command(name = "bore-server", version, about = "Reverse tunnel server")]
struct Cli {
    /// Config file path
    #[arg(long, env = "BORE_CONFIG", default_value = "~/.bore/server.toml")]
    config: String,

    /// Domain tunnels are served under (`<id>.<domain>`)
    #[arg(long, env = "BORE_DOMAIN")]
    domain: Option<String>,

    /// Address for tunnel clients (QUIC)
    #[arg(long, env = "BORE_TUNNEL_ADDR")]
    tunnel_addr: Option<String>,

    /// Address for public HTTP traffic
    #[arg(long, env = "BORE_HTTP_ADDR")]
    http_addr: Option<String>,

    /// TLS certificate (PEM)
    #[arg(long, env = "BORE_CERT")]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long, env = "BORE_KEY")]
    key: Option<String>,

    /// Generate a self-signed certificate at the cert/key paths
    #[arg(long)]
    generate_cert: bool,

    /// Password clients must present before forwarding
    #[arg(long, env = "BORE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// First port of the auto-assignment range
    #[arg(long, env = "BORE_PORT_RANGE_START")]
    port_range_start: Option<u16>,

    /// Last port of the auto-assignment range
    #[arg(long, env = "BORE_PORT_RANGE_END")]
    port_range_end: Option<u16>,

    /// Idle timeout in seconds before a silent client is dropped
    #[arg(long, env = "BORE_IDLE_TIMEOUT")]
    idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "BORE_LOG_LEVEL", default_value = "info")]
    log_level: String,
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
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting bore-server");

    let config_path = PathBuf::from(&cli.config);
    let overrides = ConfigOverrides {
        domain: cli.domain,
        tunnel_addr: cli.tunnel_addr,
        http_addr: cli.http_addr,
        cert: cli.cert,
        key: cli.key,
        password: cli.password,
        port_range_start: cli.port_range_start,
        port_range_end: cli.port_range_end,
        idle_timeout: cli.idle_timeout,
    };
    let config = ServerConfig::load(Some(&config_path), overrides).context("failed to load config")?;

    if cli.generate_cert {
        let (cert, key) = generate_self_signed_cert(&config.domain, &config.cert_path, &config.key_path)
            .context("failed to generate self-signed certificate")?;
        info!(cert = %cert.display(), key = %key.display(), "generated self-signed certificate");
    }

    let tls = load_tls_config(&config.cert_path, &config.key_path).context("failed to load TLS config")?;
    let server = BoreServer::bind(config, tls).await.context("failed to start server")?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        signal_cancel.cancel();
    });

    server.run(cancel).await.context("server error")?;
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
