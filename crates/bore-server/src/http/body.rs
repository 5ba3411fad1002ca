//! Byte-counting bodies and the per-request log line.

use super::ProxyBody;
use crate::metrics::TrafficSink;
use crate::tunnel::TunnelRoute;
use bytes::Bytes;
use bytesize::ByteSize;
use hyper::body::{Body, Frame, SizeHint};
use hyper::{Method, StatusCode, Uri};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tracing::debug;

/// One proxied request, reported once its response body is done.
pub(crate) struct Exchange {
    pub method: Method,
    pub uri: Uri,
    pub status: StatusCode,
    pub remote: String,
    pub started: Instant,
    pub bytes_in: Arc<AtomicU64>,
    pub route: TunnelRoute,
    pub sink: Arc<dyn TrafficSink>,
}

impl Exchange {
    fn finish(self, bytes_out: u64) {
        let bytes_in = self.bytes_in.load(Ordering::Relaxed);
        self.sink.record_traffic(&self.route.id, bytes_in, bytes_out);

        let line = log_line(
            &self.method,
            &self.uri,
            self.status,
            self.started.elapsed(),
            bytes_out,
            &self.remote,
        );
        debug!(id = %self.route.id, bytes_in, "{line}");
        self.route.notify(format!("{line}\n"));
    }
}

pub(crate) fn log_line(
    method: &Method,
    uri: &Uri,
    status: StatusCode,
    elapsed: Duration,
    written: u64,
    remote: &str,
) -> String {
    format!(
        "{method} {uri} (code={} dt={elapsed:?} written={} remote={remote})",
        status.as_u16(),
        ByteSize::b(written)
    )
}

/// Wraps a body and counts the data bytes that pass through it.
pub(crate) struct MeteredBody {
    inner: ProxyBody,
    counter: Arc<AtomicU64>,
    on_done: Option<Exchange>,
}

impl MeteredBody {
    /// Count into `counter` without reporting.
    pub fn counting(inner: ProxyBody, counter: Arc<AtomicU64>) -> Self {
        Self {
            inner,
            counter,
            on_done: None,
        }
    }

    /// Count and report `exchange` when the body ends or is dropped.
    pub fn reporting(inner: ProxyBody, exchange: Exchange) -> Self {
        Self {
            inner,
            counter: Arc::new(AtomicU64::new(0)),
            on_done: Some(exchange),
        }
    }

    fn complete(&mut self) {
        if let Some(exchange) = self.on_done.take() {
            exchange.finish(self.counter.load(Ordering::Relaxed));
        }
    }
}

impl Body for MeteredBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.as_mut().get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.counter.fetch_add(data.len() as u64, Ordering::Relaxed);
                }
            }
            Poll::Ready(None) | Poll::Ready(Some(Err(_))) => this.complete(),
            Poll::Pending => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for MeteredBody {
    fn drop(&mut self) {
        self.complete();
    }
}
