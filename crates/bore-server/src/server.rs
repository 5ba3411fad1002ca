//! Core server: accepts tunnel sessions on the QUIC endpoint and runs the
//! HTTP router beside them.
//!
//! Owns the registry, the traffic sink and the root cancellation token every
//! session, listener and proxied connection descends from.

use crate::auth::SharedSecret;
use crate::config::ServerConfig;
use crate::http::{self, HttpRouter};
use crate::metrics::{TrafficLedger, TrafficSink};
use crate::transport::bind_endpoint;
use crate::tunnel::{session, PortAllocator, Registry, TunnelContext};
use bore_core::messages::close_code;
use bore_core::{BoreError, BoreResult};
use quinn::{Endpoint, VarInt};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time a new connection has to complete the greeting exchange.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often traffic counters of departed tunnels are dropped.
const TRAFFIC_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound on waiting for clients to acknowledge the shutdown close.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// The bore server instance.
pub struct BoreServer {
    config: ServerConfig,
    endpoint: Endpoint,
    http_listener: TcpListener,
    registry: Arc<Registry>,
    sink: Arc<dyn TrafficSink>,
}

impl BoreServer {
    /// Bind the tunnel endpoint and the HTTP listener.
    pub async fn bind(config: ServerConfig, tls: rustls::ServerConfig) -> BoreResult<Self> {
        let endpoint = bind_endpoint(config.tunnel_addr, tls, config.idle_timeout)?;
        let http_listener = TcpListener::bind(config.http_addr).await.map_err(|e| {
            BoreError::Config(format!("cannot bind HTTP listener {}: {e}", config.http_addr))
        })?;

        Ok(Self {
            config,
            endpoint,
            http_listener,
            registry: Arc::new(Registry::new()),
            sink: Arc::new(TrafficLedger::new()),
        })
    }

    /// Replace the default in-memory traffic ledger.
    pub fn with_traffic_sink(mut self, sink: Arc<dyn TrafficSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn tunnel_addr(&self) -> BoreResult<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    pub fn http_addr(&self) -> BoreResult<SocketAddr> {
        Ok(self.http_listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Serve until `cancel` fires or the HTTP listener fails.
    pub async fn run(self, cancel: CancellationToken) -> BoreResult<()> {
        let BoreServer {
            config,
            endpoint,
            http_listener,
            registry,
            sink,
        } = self;

        let secret = config.password.as_deref().map(SharedSecret::new);
        if let Some(secret) = &secret {
            info!(fingerprint = %secret.fingerprint(), "password authentication enabled");
        }
        let ctx = Arc::new(TunnelContext {
            domain: config.domain.clone(),
            registry: Arc::clone(&registry),
            allocator: PortAllocator::new(config.port_range.clone()),
            secret,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        });

        info!(
            domain = %config.domain,
            tunnel_addr = ?endpoint.local_addr().ok(),
            ports = ?config.port_range,
            "bore server listening"
        );

        let router = Arc::new(HttpRouter::new(
            config.domain.clone(),
            Arc::clone(&registry),
            Arc::clone(&sink),
            cancel.child_token(),
        ));
        let mut http_task = tokio::spawn(http::serve(http_listener, router, cancel.child_token()));
        let mut http_done = false;

        let mut sessions = JoinSet::new();
        let mut sweep = tokio::time::interval(TRAFFIC_SWEEP_INTERVAL);

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                res = &mut http_task => {
                    http_done = true;
                    break match res {
                        Ok(res) => res,
                        Err(e) => Err(BoreError::Other(format!("HTTP router task failed: {e}"))),
                    };
                }
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                _ = sweep.tick() => {
                    let live: HashSet<String> =
                        registry.routes().await.into_iter().map(|r| r.id).collect();
                    sink.prune(&live);
                }
                incoming = endpoint.accept() => {
                    let Some(incoming) = incoming else {
                        break Err(BoreError::Transport("tunnel endpoint closed".into()));
                    };
                    let ctx = Arc::clone(&ctx);
                    let token = cancel.child_token();
                    sessions.spawn(async move {
                        let peer = incoming.remote_address();
                        match incoming.await {
                            Ok(connection) => session::run(ctx, connection, token).await,
                            Err(e) => warn!(peer = %peer, error = %e, "QUIC handshake failed"),
                        }
                    });
                }
            }
        };

        cancel.cancel();
        debug!(sessions = sessions.len(), "draining tunnel sessions");
        while sessions.join_next().await.is_some() {}
        if !http_done {
            let _ = http_task.await;
        }

        endpoint.close(VarInt::from_u32(close_code::SHUTDOWN), b"server shutting down");
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, endpoint.wait_idle()).await;
        info!("bore server stopped");
        outcome
    }
}
