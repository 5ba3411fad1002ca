//! Host-based routing of public HTTP requests.

use super::body::{Exchange, MeteredBody};
use super::proxy::{self, ProxyKind};
use super::{landing, ProxyBody, PROXY_HEADER, PROXY_HEADER_VALUE};
use crate::metrics::TrafficSink;
use crate::tunnel::forward::{is_transient_accept_error, ACCEPT_BACKOFF};
use crate::tunnel::Registry;
use bore_core::BoreResult;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Routes requests for `<id>.<domain>` to tunnel `id`.
pub struct HttpRouter {
    domain: String,
    registry: Arc<Registry>,
    sink: Arc<dyn TrafficSink>,
    cancel: CancellationToken,
}

impl HttpRouter {
    pub fn new(
        domain: impl Into<String>,
        registry: Arc<Registry>,
        sink: Arc<dyn TrafficSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            domain: domain.into(),
            registry,
            sink,
            cancel,
        }
    }

    /// Handle one request from `peer`. Never fails; errors become responses.
    pub async fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<Response<ProxyBody>, Infallible> {
        let host = request_host(&req);
        if host.is_empty() || host == self.domain {
            return Ok(landing::serve(&req, &self.domain, &self.registry, self.sink.as_ref()).await);
        }

        let id = host.split('.').next().unwrap_or_default();
        let Some(route) = self.registry.lookup(id).await else {
            debug!(host = %host, "no tunnel for host");
            let scheme = req
                .headers()
                .get("x-forwarded-proto")
                .and_then(|v| v.to_str().ok())
                .filter(|p| *p == "http" || *p == "https")
                .unwrap_or("http");
            return Ok(landing::redirect_not_found(scheme, &self.domain, id));
        };

        let kind = ProxyKind::of(&req);
        let started = Instant::now();
        let method = req.method().clone();
        let uri = req.uri().clone();
        let remote = client_address(&req, peer);

        let bytes_in = Arc::new(AtomicU64::new(0));
        let req = req.map(|body| MeteredBody::counting(body.boxed(), Arc::clone(&bytes_in)));

        let mut resp = match proxy::forward(kind, req, &route, peer, self.cancel.child_token()).await {
            Ok(resp) => resp,
            Err(e) if e.is_tunnel_gone() => {
                warn!(id = %route.id, error = %e, "tunnel backend unavailable");
                landing::plain(StatusCode::BAD_GATEWAY, "bad gateway\n")
            }
            Err(e) => {
                error!(id = %route.id, error = %e, "proxy error");
                landing::plain(StatusCode::BAD_GATEWAY, "bad gateway\n")
            }
        };
        resp.headers_mut()
            .insert(PROXY_HEADER, HeaderValue::from_static(PROXY_HEADER_VALUE));

        let exchange = Exchange {
            method,
            uri,
            status: resp.status(),
            remote,
            started,
            bytes_in,
            route,
            sink: Arc::clone(&self.sink),
        };
        Ok(resp.map(|body| MeteredBody::reporting(body, exchange).boxed()))
    }
}

/// Accept HTTP connections until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    router: Arc<HttpRouter>,
    cancel: CancellationToken,
) -> BoreResult<()> {
    info!(addr = ?listener.local_addr().ok(), "HTTP router listening");
    let mut connections = JoinSet::new();

    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) if is_transient_accept_error(&e) => {
                    debug!(error = %e, "transient HTTP accept error");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            },
        };

        let _ = stream.set_nodelay(true);
        let router = Arc::clone(&router);
        let conn_cancel = cancel.child_token();
        connections.spawn(async move {
            let service = service_fn(move |req| Arc::clone(&router).handle(req, peer));
            let conn = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades();
            tokio::pin!(conn);

            tokio::select! {
                res = conn.as_mut() => {
                    if let Err(e) = res {
                        debug!(peer = %peer, error = %e, "HTTP connection error");
                    }
                }
                _ = conn_cancel.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    let _ = conn.await;
                }
            }
        });
    }

    drop(listener);
    while connections.join_next().await.is_some() {}
    Ok(())
}

/// Host of the request, lowercased, without port or trailing dot.
fn request_host<B>(req: &Request<B>) -> String {
    let raw = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())
        .unwrap_or_default();
    strip_port(raw.trim()).trim_end_matches('.').to_ascii_lowercase()
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// First `X-Forwarded-For` entry, else the peer address.
fn client_address<B>(req: &Request<B>, peer: SocketAddr) -> String {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| peer.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_host(host: &str) -> Request<()> {
        Request::builder()
            .uri("/")
            .header(HOST, host)
            .body(())
            .unwrap()
    }

    #[test]
    fn host_is_normalised() {
        assert_eq!(request_host(&with_host("ABC.Example.com:8080")), "abc.example.com");
        assert_eq!(request_host(&with_host("example.com.")), "example.com");
        assert_eq!(request_host(&with_host("[::1]:2000")), "::1");

        let absolute = Request::builder()
            .uri("http://xyz.example.com:2000/path")
            .body(())
            .unwrap();
        assert_eq!(request_host(&absolute), "xyz.example.com");
    }

    #[test]
    fn remote_prefers_forwarded_for() {
        let peer: SocketAddr = "10.0.0.2:4000".parse().unwrap();
        let req = Request::builder()
            .header("x-forwarded-for", "203.0.113.5, 10.0.0.1")
            .body(())
            .unwrap();
        assert_eq!(client_address(&req, peer), "203.0.113.5");
        assert_eq!(client_address(&with_host("a"), peer), "10.0.0.2:4000");
    }
}
