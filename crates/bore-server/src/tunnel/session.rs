//! Tunnel sessions: one per accepted QUIC connection.
//!
//! [`run`] owns the whole lifetime of a session. It performs the greeting
//! handshake, drives the control stream and the client-opened channels, and
//! on every way out (client gone, protocol error, failed auth, server
//! shutdown) runs the same teardown: cancel, deregister, close listeners.

use super::control::ControlHandler;
use super::forward::ListenerHandle;
use super::registry::Registry;
use super::TunnelContext;
use bore_core::messages::close_code;
use bore_core::{
    accept_channel, read_frame, write_frame, BoreError, BoreResult, ChannelOpen, Greeting,
    TunnelStream,
};
use quinn::{Connection, RecvStream, SendStream, VarInt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

/// Status lines buffered before the client opens its status channel.
const STATUS_BUFFER: usize = 64;

static NEXT_SESSION_KEY: AtomicU64 = AtomicU64::new(1);

/// Server-side state of one tunnel client.
pub struct TunnelSession {
    /// Process-unique, never reused; distinguishes sessions that briefly
    /// share an identifier.
    key: u64,
    remote: SocketAddr,
    status: mpsc::Sender<String>,
    cancel: CancellationToken,
    /// Carries the current identifier; entered by every task of the session.
    span: Span,
    pub(crate) state: Mutex<SessionState>,
}

/// Mutable per-session fields, guarded separately from the registry.
pub(crate) struct SessionState {
    pub id: String,
    pub authenticated: bool,
    pub registered: bool,
    pub addr: String,
    pub port: u16,
    /// Active public listeners keyed by `bind_addr:port`.
    pub listeners: HashMap<String, ListenerHandle>,
    /// Whether the banner has been written yet.
    pub announced: bool,
}

impl TunnelSession {
    pub(crate) fn new(
        id: String,
        remote: SocketAddr,
        status: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Self {
        let key = NEXT_SESSION_KEY.fetch_add(1, Ordering::Relaxed);
        let span = info_span!("tunnel", id = %id, key, peer = %remote);
        Self {
            key,
            remote,
            status,
            cancel,
            span,
            state: Mutex::new(SessionState {
                id,
                authenticated: false,
                registered: false,
                addr: String::new(),
                port: 0,
                listeners: HashMap::new(),
                announced: false,
            }),
        }
    }

    /// A session with no connection behind it.
    #[cfg(test)]
    pub(crate) fn detached(id: &str) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(STATUS_BUFFER);
        let remote = SocketAddr::from(([127, 0, 0, 1], 0));
        let session = Self::new(id.to_string(), remote, tx, CancellationToken::new());
        (Arc::new(session), rx)
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub(crate) fn span(&self) -> &Span {
        &self.span
    }

    /// Show `id` on every later log record of this session.
    pub(crate) fn record_id(&self, id: &str) {
        self.span.record("id", tracing::field::display(id));
    }

    pub async fn id(&self) -> String {
        self.state.lock().await.id.clone()
    }

    pub(crate) fn status_sender(&self) -> mpsc::Sender<String> {
        self.status.clone()
    }

    /// Queue text for the client's status channel. Dropped if the client
    /// never opened one and the buffer is full.
    pub(crate) fn notify(&self, text: String) {
        if self.status.try_send(text).is_err() {
            debug!(key = self.key, "status buffer full, dropping line");
        }
    }

    /// Token for tasks owned by this session.
    pub(crate) fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub(crate) async fn is_authenticated(&self) -> bool {
        self.state.lock().await.authenticated
    }

    pub(crate) async fn set_authenticated(&self) {
        self.state.lock().await.authenticated = true;
    }

    /// Insert a listener, closing any previous one under the same key.
    pub(crate) async fn insert_listener(&self, key: String, handle: ListenerHandle) {
        let previous = self.state.lock().await.listeners.insert(key, handle);
        if let Some(previous) = previous {
            previous.close().await;
        }
    }

    /// Remove a listener; returns it with the binding of one that remains.
    pub(crate) async fn remove_listener(
        &self,
        key: &str,
    ) -> Option<(ListenerHandle, Option<(String, u16)>)> {
        let mut state = self.state.lock().await;
        let removed = state.listeners.remove(key)?;
        let remaining = state
            .listeners
            .values()
            .next()
            .map(|l| (l.binding().addr.clone(), l.binding().port));
        Some((removed, remaining))
    }

    /// The single cleanup path. Safe to call more than once.
    pub(crate) async fn teardown(&self, registry: &Registry) {
        self.cancel.cancel();
        registry.deregister(self).await;

        let (id, listeners) = {
            let mut state = self.state.lock().await;
            (state.id.clone(), std::mem::take(&mut state.listeners))
        };
        for (bind, listener) in listeners {
            debug!(id = %id, bind = %bind, "closing listener");
            listener.close().await;
        }
    }
}

/// Drive one accepted connection until it ends, then tear it down.
pub(crate) async fn run(ctx: Arc<TunnelContext>, connection: Connection, cancel: CancellationToken) {
    let remote = connection.remote_address();

    let handshake = tokio::time::timeout(ctx.handshake_timeout, handshake(&connection)).await;
    let (send, recv) = match handshake {
        Ok(Ok(streams)) => streams,
        Ok(Err(e)) => {
            warn!(peer = %remote, error = %e, "handshake failed");
            connection.close(VarInt::from_u32(close_code::PROTOCOL_ERROR), b"handshake failed");
            return;
        }
        Err(_) => {
            warn!(peer = %remote, "handshake timed out");
            connection.close(VarInt::from_u32(close_code::PROTOCOL_ERROR), b"handshake timeout");
            return;
        }
    };

    let (status_tx, status_rx) = mpsc::channel(STATUS_BUFFER);
    let id = ctx.registry.unique_id().await;
    let session = Arc::new(TunnelSession::new(id, remote, status_tx, cancel));
    let span = session.span().clone();
    serve(ctx, connection, send, recv, session, status_rx).instrument(span).await;
}

/// Run an established session inside its span, then tear it down.
async fn serve(
    ctx: Arc<TunnelContext>,
    connection: Connection,
    send: SendStream,
    recv: RecvStream,
    session: Arc<TunnelSession>,
    status_rx: mpsc::Receiver<String>,
) {
    info!("new tunnel session");

    let control = ControlHandler::new(Arc::clone(&ctx), Arc::clone(&session), connection.clone());
    let outcome = tokio::select! {
        res = control.run(send, recv) => res,
        res = serve_channels(&connection, status_rx) => res,
        err = connection.closed() => Err(BoreError::from(err)),
        _ = session.cancel.cancelled() => Err(BoreError::Other("server shutting down".into())),
    };

    let (code, reason): (u32, &[u8]) = match &outcome {
        Ok(()) => {
            info!("tunnel session closed");
            (close_code::NORMAL, b"session closed")
        }
        Err(BoreError::Transport(e)) => {
            info!(reason = %e, "tunnel connection closed");
            (close_code::NORMAL, b"connection closed")
        }
        Err(e @ BoreError::AuthFailed(_)) => {
            warn!(error = %e, "tunnel session rejected");
            (close_code::AUTH_FAILED, b"authentication failed")
        }
        Err(e @ BoreError::Allocation(_)) => {
            warn!(error = %e, "tunnel session closed after failed forward");
            (close_code::ALLOCATION_FAILED, b"forward failed")
        }
        Err(e @ BoreError::Other(_)) if session.cancel.is_cancelled() => {
            info!(reason = %e, "tunnel session stopped");
            (close_code::SHUTDOWN, b"server shutting down")
        }
        Err(e) => {
            warn!(error = %e, "tunnel session terminated");
            (close_code::PROTOCOL_ERROR, b"protocol error")
        }
    };

    session.teardown(&ctx.registry).await;
    connection.close(VarInt::from_u32(code), reason);
}

/// Accept the control stream and exchange greetings.
async fn handshake(connection: &Connection) -> BoreResult<(SendStream, RecvStream)> {
    let (mut send, mut recv) = connection.accept_bi().await?;

    let greeting: Greeting = read_frame(&mut recv)
        .await?
        .ok_or_else(|| BoreError::Handshake("control stream closed before greeting".into()))?;

    write_frame(&mut send, &Greeting::current()).await?;
    if !greeting.is_compatible() {
        return Err(BoreError::Handshake(format!(
            "unsupported protocol version {:?}",
            greeting.version
        )));
    }
    Ok((send, recv))
}

/// Accept client-opened channels. Only one status channel is honored.
async fn serve_channels(
    connection: &Connection,
    status_rx: mpsc::Receiver<String>,
) -> BoreResult<()> {
    let mut status_rx = Some(status_rx);
    let mut writers = JoinSet::new();

    loop {
        tokio::select! {
            accepted = accept_channel(connection) => match accepted {
                Ok((ChannelOpen::Session, stream)) => match status_rx.take() {
                    Some(rx) => {
                        writers.spawn(write_status(stream, rx).in_current_span());
                    }
                    None => debug!("duplicate status channel ignored"),
                },
                Ok((other, _stream)) => {
                    warn!(channel = ?other, "client opened an unsupported channel");
                }
                Err(e @ BoreError::Transport(_)) => return Err(e),
                Err(e) => warn!(error = %e, "bad channel header"),
            },
            Some(_) = writers.join_next(), if !writers.is_empty() => {}
        }
    }
}

async fn write_status(mut stream: TunnelStream, mut lines: mpsc::Receiver<String>) {
    while let Some(line) = lines.recv().await {
        if let Err(e) = stream.write_all(line.as_bytes()).await {
            debug!(error = %e, "status channel closed");
            return;
        }
    }
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;
    use std::sync::Mutex as StdMutex;
    use tracing::field::{Field, Visit};
    use tracing::span::{Attributes, Id, Record};
    use tracing::Subscriber;
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    /// Collects `name=value` for every span field set or recorded.
    #[derive(Clone, Default)]
    struct SpanFields(Arc<StdMutex<Vec<String>>>);

    impl Visit for SpanFields {
        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            self.0
                .lock()
                .unwrap()
                .push(format!("{}={:?}", field.name(), value));
        }
    }

    impl<S: Subscriber> Layer<S> for SpanFields {
        fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
            attrs.record(&mut self.clone());
        }

        fn on_record(&self, _id: &Id, values: &Record<'_>, _ctx: Context<'_, S>) {
            values.record(&mut self.clone());
        }
    }

    #[test]
    fn session_span_follows_the_identifier() {
        let fields = SpanFields::default();
        let subscriber = tracing_subscriber::registry().with(fields.clone());

        tracing::subscriber::with_default(subscriber, || {
            let (session, _rx) = TunnelSession::detached("first");
            session.record_id("renamed");
        });

        let seen = fields.0.lock().unwrap().clone();
        assert!(seen.contains(&"id=first".to_string()), "{seen:?}");
        assert!(seen.contains(&"id=renamed".to_string()), "{seen:?}");
    }

    #[tokio::test]
    async fn teardown_cancels_children_and_deregisters() {
        let registry = Registry::new();
        let (session, _rx) = TunnelSession::detached("gone");
        registry.register(&session, "127.0.0.1", 55001).await;
        let child = session.child_token();

        session.teardown(&registry).await;
        assert!(child.is_cancelled());
        assert!(!registry.contains("gone").await);

        // Second call is harmless.
        session.teardown(&registry).await;
    }

    #[tokio::test]
    async fn session_keys_are_unique() {
        let (a, _rx1) = TunnelSession::detached("a");
        let (b, _rx2) = TunnelSession::detached("a");
        assert_ne!(a.key(), b.key());
    }

    #[tokio::test]
    async fn notify_drops_when_buffer_full() {
        let (session, mut rx) = TunnelSession::detached("chatty");
        for i in 0..(STATUS_BUFFER + 10) {
            session.notify(format!("line {i}\n"));
        }
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, STATUS_BUFFER);
    }
}
