//! Tunnel side of the server: QUIC sessions, their control requests and the
//! public listeners they own.

pub mod allocator;
pub mod banner;
pub(crate) mod control;
pub(crate) mod forward;
pub mod registry;
pub mod session;

pub use allocator::PortAllocator;
pub use registry::{Registry, Rename, TunnelRoute};
pub use session::TunnelSession;

use crate::auth::SharedSecret;
use std::sync::Arc;
use std::time::Duration;

/// Everything a session needs from the server, shared by all sessions.
pub(crate) struct TunnelContext {
    pub domain: String,
    pub registry: Arc<Registry>,
    pub allocator: PortAllocator,
    pub secret: Option<SharedSecret>,
    pub handshake_timeout: Duration,
}
