//! bore-client: client library for the bore reverse tunnel.
//!
//! A [`TunnelAgent`] connects to a bore server over QUIC, asks for a public
//! port, and pipes every connection the server forwards to a local service.
//!
//! # Quick Start
//!
//! ```no_run
//! use bore_client::{ClientConfig, TunnelAgent};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> bore_core::BoreResult<()> {
//! let agent = TunnelAgent::new(ClientConfig {
//!     server_host: "bore.example.com".into(),
//!     local_port: 3000,
//!     ..Default::default()
//! });
//! agent.run(tokio::io::stdout(), CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod transport;

pub use agent::TunnelAgent;
pub use config::ClientConfig;

pub use bore_core::{BoreError, BoreResult};
