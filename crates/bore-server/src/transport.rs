//! QUIC endpoint for tunnel clients.

use bore_core::{transport_config, BoreError, BoreResult};
use quinn::crypto::rustls::QuicServerConfig;
use quinn::Endpoint;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Bind the tunnel endpoint with the given TLS config and idle deadline.
pub fn bind_endpoint(
    addr: SocketAddr,
    tls: rustls::ServerConfig,
    idle_timeout: Duration,
) -> BoreResult<Endpoint> {
    let crypto = QuicServerConfig::try_from(tls)
        .map_err(|e| BoreError::Config(format!("TLS config not usable for QUIC: {e}")))?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    server_config.transport_config(transport_config(idle_timeout)?);

    Endpoint::server(server_config, addr)
        .map_err(|e| BoreError::Transport(format!("cannot bind tunnel endpoint {addr}: {e}")))
}
