//! Reverse proxy to a tunnel's public listener.

use super::body::MeteredBody;
use super::ProxyBody;
use crate::tunnel::TunnelRoute;
use bore_core::splice;
use http_body_util::BodyExt;
use hyper::client::conn::http1;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How a request is proxied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    PlainHttp,
    WebSocketUpgrade,
}

impl ProxyKind {
    /// `Upgrade: websocket`, compared case-insensitively.
    pub fn of<B>(req: &Request<B>) -> Self {
        let websocket = req
            .headers()
            .get(header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"));
        if websocket {
            ProxyKind::WebSocketUpgrade
        } else {
            ProxyKind::PlainHttp
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("cannot reach tunnel: {0}")]
    Connect(#[source] io::Error),
    #[error("upstream error: {0}")]
    Upstream(#[from] hyper::Error),
}

impl ProxyError {
    /// The tunnel went away or refused us, as opposed to a broken exchange.
    pub fn is_tunnel_gone(&self) -> bool {
        match self {
            ProxyError::Connect(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::UnexpectedEof
            ),
            ProxyError::Upstream(e) => e.is_incomplete_message() || e.is_closed() || e.is_canceled(),
        }
    }
}

/// Headers that describe a single hop and are not forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
];

/// Send `req` to the tunnel behind `route` and return its response.
///
/// For WebSocket upgrades the 101 response is returned to the client and
/// both upgraded connections are spliced in the background until either
/// side closes or `cancel` fires.
pub(crate) async fn forward(
    kind: ProxyKind,
    mut req: Request<MeteredBody>,
    route: &TunnelRoute,
    peer: SocketAddr,
    cancel: CancellationToken,
) -> Result<Response<ProxyBody>, ProxyError> {
    let host = route.upstream_host();
    let stream = TcpStream::connect((host.as_str(), route.port))
        .await
        .map_err(ProxyError::Connect)?;
    let _ = stream.set_nodelay(true);

    let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
    let id = route.id.clone();
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(id = %id, error = %e, "upstream connection ended");
        }
    });

    prepare_request(&mut req, kind, peer);

    match kind {
        ProxyKind::PlainHttp => {
            let resp = sender.send_request(req).await?;
            let mut resp = resp.map(|b| b.boxed());
            strip_hop_by_hop(resp.headers_mut());
            Ok(resp)
        }
        ProxyKind::WebSocketUpgrade => {
            let client_upgrade = hyper::upgrade::on(&mut req);
            let mut resp = sender.send_request(req).await?;
            if resp.status() != StatusCode::SWITCHING_PROTOCOLS {
                return Ok(resp.map(|b| b.boxed()));
            }

            let upstream_upgrade = hyper::upgrade::on(&mut resp);
            let id = route.id.clone();
            tokio::spawn(async move {
                match tokio::try_join!(client_upgrade, upstream_upgrade) {
                    Ok((client, upstream)) => {
                        let stats = splice(TokioIo::new(client), TokioIo::new(upstream), cancel).await;
                        debug!(
                            id = %id,
                            sent = stats.a_to_b,
                            received = stats.b_to_a,
                            "websocket closed"
                        );
                    }
                    Err(e) => debug!(id = %id, error = %e, "websocket upgrade failed"),
                }
            });
            Ok(resp.map(|b| b.boxed()))
        }
    }
}

/// Rewrite an inbound request for the upstream hop.
fn prepare_request<B>(req: &mut Request<B>, kind: ProxyKind, peer: SocketAddr) {
    let origin_form = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    if let Ok(uri) = origin_form.parse::<Uri>() {
        *req.uri_mut() = uri;
    }

    let original_host = req.headers().get(header::HOST).cloned();
    let headers = req.headers_mut();

    if kind == ProxyKind::PlainHttp {
        strip_hop_by_hop(headers);
        headers.remove(header::UPGRADE);
    }

    let forwarded_for = match headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(prior) => format!("{prior}, {}", peer.ip()),
        None => peer.ip().to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(HeaderName::from_static("x-forwarded-for"), value);
    }
    if let Some(host) = original_host {
        headers
            .entry(HeaderName::from_static("x-forwarded-host"))
            .or_insert(host);
    }
    headers
        .entry(HeaderName::from_static("x-forwarded-proto"))
        .or_insert(HeaderValue::from_static("http"));
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named in Connection are hop-by-hop too.
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: &[(&str, &str)]) -> Request<()> {
        let mut builder = Request::builder().uri("http://abc.example.com/path?q=1");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn websocket_detection_ignores_case() {
        assert_eq!(
            ProxyKind::of(&request(&[("upgrade", "WebSocket")])),
            ProxyKind::WebSocketUpgrade
        );
        assert_eq!(ProxyKind::of(&request(&[])), ProxyKind::PlainHttp);
        assert_eq!(
            ProxyKind::of(&request(&[("upgrade", "h2c")])),
            ProxyKind::PlainHttp
        );
    }

    #[test]
    fn plain_requests_lose_hop_by_hop_headers() {
        let peer: SocketAddr = "198.51.100.4:5000".parse().unwrap();
        let mut req = request(&[
            ("host", "abc.example.com"),
            ("connection", "keep-alive, x-secret"),
            ("x-secret", "1"),
            ("keep-alive", "timeout=5"),
            ("x-forwarded-for", "203.0.113.1"),
        ]);
        prepare_request(&mut req, ProxyKind::PlainHttp, peer);

        assert_eq!(req.uri(), "/path?q=1");
        let headers = req.headers();
        assert!(headers.get("connection").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("x-secret").is_none());
        assert_eq!(headers["host"], "abc.example.com");
        assert_eq!(headers["x-forwarded-for"], "203.0.113.1, 198.51.100.4");
        assert_eq!(headers["x-forwarded-host"], "abc.example.com");
        assert_eq!(headers["x-forwarded-proto"], "http");
    }

    #[test]
    fn websocket_requests_keep_upgrade_headers() {
        let peer: SocketAddr = "198.51.100.4:5000".parse().unwrap();
        let mut req = request(&[("connection", "Upgrade"), ("upgrade", "websocket")]);
        prepare_request(&mut req, ProxyKind::WebSocketUpgrade, peer);

        assert_eq!(req.headers()["connection"], "Upgrade");
        assert_eq!(req.headers()["upgrade"], "websocket");
    }

    #[test]
    fn refused_connection_means_tunnel_gone() {
        let refused = ProxyError::Connect(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(refused.is_tunnel_gone());
        let other = ProxyError::Connect(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(!other.is_tunnel_gone());
    }
}
