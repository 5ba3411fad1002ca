//! Public HTTP/WebSocket front door. Requests are routed by the first label
//! of their Host to the tunnel registered under that identifier.

mod body;
mod landing;
mod proxy;
mod router;

pub use proxy::{ProxyError, ProxyKind};
pub use router::{serve, HttpRouter};

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};

/// Body type of every response the router produces.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Marker header set on every response for a routed tunnel.
pub const PROXY_HEADER: &str = "x-proxy";
pub const PROXY_HEADER_VALUE: &str = "bore";

pub(crate) fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}
