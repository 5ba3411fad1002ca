//! bore-server: the public side of a bore reverse tunnel.
//!
//! Tunnel clients connect over QUIC and ask for a public TCP port. Inbound
//! connections on that port are carried back to the client as channels on
//! the same QUIC connection, and HTTP requests for `<id>.<domain>` are
//! reverse-proxied to the tunnel registered as `id`.

pub mod auth;
pub mod config;
pub mod http;
pub mod metrics;
pub mod server;
pub mod tls;
pub mod transport;
pub mod tunnel;

pub use config::{ConfigOverrides, ServerConfig};
pub use http::{HttpRouter, ProxyKind};
pub use metrics::{NullSink, TrafficLedger, TrafficSink, TunnelTraffic};
pub use server::BoreServer;
pub use tunnel::{Registry, TunnelRoute};
