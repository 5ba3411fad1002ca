//! QUIC connection to the bore server.

mod verify;

use crate::config::ClientConfig;
use bore_core::{transport_config, BoreError, BoreResult, ALPN};
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{Connection, Endpoint};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Resolve the server, open a client endpoint and connect.
pub async fn connect(config: &ClientConfig) -> BoreResult<(Endpoint, Connection)> {
    let addr = config.server_addr();
    let remote = tokio::net::lookup_host(&addr)
        .await
        .map_err(|e| BoreError::Transport(format!("DNS lookup for {addr} failed: {e}")))?
        .next()
        .ok_or_else(|| BoreError::Transport(format!("no addresses for {addr}")))?;

    let local: SocketAddr = if remote.is_ipv6() {
        SocketAddr::from(([0u16; 8], 0))
    } else {
        SocketAddr::from(([0, 0, 0, 0], 0))
    };
    let mut endpoint = Endpoint::client(local)
        .map_err(|e| BoreError::Transport(format!("endpoint error: {e}")))?;
    endpoint.set_default_client_config(client_config(config)?);

    let connection = endpoint.connect(remote, &config.server_host)?.await?;
    info!(server = %addr, remote = %connection.remote_address(), "connected to bore server");
    Ok((endpoint, connection))
}

/// QUIC client config: TLS 1.3, bore ALPN, pinned CA or no verification.
pub fn client_config(config: &ClientConfig) -> BoreResult<quinn::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| BoreError::Config(format!("TLS setup failed: {e}")))?;

    let mut crypto = match &config.ca_cert {
        Some(path) => builder
            .with_root_certificates(load_roots(path)?)
            .with_no_client_auth(),
        None => {
            warn!("no CA certificate configured, server identity is not verified");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(verify::AcceptAnyServerCert::new(provider)))
                .with_no_client_auth()
        }
    };
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let quic = QuicClientConfig::try_from(crypto)
        .map_err(|e| BoreError::Config(format!("TLS config not usable for QUIC: {e}")))?;
    let mut client = quinn::ClientConfig::new(Arc::new(quic));
    client.transport_config(transport_config(config.idle_timeout)?);
    Ok(client)
}

fn load_roots(path: &Path) -> BoreResult<rustls::RootCertStore> {
    let pem = std::fs::read(path)
        .map_err(|e| BoreError::Config(format!("cannot read CA cert {}: {e}", path.display())))?;
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &pem[..]) {
        roots
            .add(cert?)
            .map_err(|e| BoreError::Config(format!("invalid CA cert {}: {e}", path.display())))?;
    }
    if roots.is_empty() {
        return Err(BoreError::Config(format!(
            "no certificate found in {}",
            path.display()
        )));
    }
    Ok(roots)
}
