//! Control-stream request handling for one session.

use super::banner::render_banner;
use super::forward::{spawn_listener, Binding};
use super::registry::Rename;
use super::session::TunnelSession;
use super::TunnelContext;
use bore_core::{read_frame, write_frame, BoreError, BoreResult, GlobalReply, GlobalRequest, Request};
use quinn::{Connection, RecvStream, SendStream};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// How long a rejected client gets to read its failure reply before the
/// connection is closed.
const REPLY_LINGER: Duration = Duration::from_secs(2);

pub(crate) struct ControlHandler {
    ctx: Arc<TunnelContext>,
    session: Arc<TunnelSession>,
    connection: Connection,
}

impl ControlHandler {
    pub fn new(ctx: Arc<TunnelContext>, session: Arc<TunnelSession>, connection: Connection) -> Self {
        Self {
            ctx,
            session,
            connection,
        }
    }

    /// Serve requests until the client finishes the control stream (`Ok`) or
    /// a request ends the session (`Err`).
    pub async fn run(&self, mut send: SendStream, mut recv: RecvStream) -> BoreResult<()> {
        loop {
            let Some(request) = read_frame::<_, GlobalRequest>(&mut recv).await? else {
                debug!("control stream finished by client");
                return Ok(());
            };

            let kind = request.request.kind();
            let (reply, outcome) = self.handle(request.request).await;
            debug!(request = kind, success = reply.success, "control request handled");

            if request.want_reply {
                write_frame(&mut send, &reply).await?;
            }

            if let Err(e) = outcome {
                let _ = send.finish();
                let _ = tokio::time::timeout(REPLY_LINGER, send.stopped()).await;
                return Err(e);
            }
        }
    }

    /// Produce the reply for one request. An `Err` outcome closes the
    /// session after the reply is delivered.
    async fn handle(&self, request: Request) -> (GlobalReply, BoreResult<()>) {
        if let Some(secret) = &self.ctx.secret {
            if !self.session.is_authenticated().await {
                return match request {
                    Request::Password { password } if secret.matches(&password) => {
                        self.session.set_authenticated().await;
                        info!(peer = %self.session.remote(), "client authenticated");
                        (GlobalReply::success(), Ok(()))
                    }
                    Request::Password { .. } => (
                        GlobalReply::failure(),
                        Err(BoreError::AuthFailed("wrong password".into())),
                    ),
                    other => (
                        GlobalReply::failure(),
                        Err(BoreError::AuthFailed(format!(
                            "{} before authentication",
                            other.kind()
                        ))),
                    ),
                };
            }
        }

        match request {
            // No password configured, or already authenticated.
            Request::Password { .. } => (GlobalReply::success(), Ok(())),
            Request::SetId { id } => (self.set_id(&id).await, Ok(())),
            Request::TcpipForward {
                bind_addr,
                bind_port,
            } => match self.forward(&bind_addr, bind_port).await {
                Ok(port) => (GlobalReply::bound(port), Ok(())),
                Err(e) => (GlobalReply::failure(), Err(e)),
            },
            Request::CancelTcpipForward {
                bind_addr,
                bind_port,
            } => (self.cancel_forward(&bind_addr, bind_port).await, Ok(())),
            Request::Keepalive => (GlobalReply::success(), Ok(())),
            Request::Unknown => {
                debug!("unknown request type");
                (GlobalReply::failure(), Ok(()))
            }
        }
    }

    async fn set_id(&self, id: &str) -> GlobalReply {
        match self.ctx.registry.rename(&self.session, id).await {
            Rename::Renamed => {
                self.session.record_id(id);
                info!("tunnel identifier set");
                self.announce().await;
                GlobalReply::success()
            }
            Rename::Unchanged => GlobalReply::success(),
            Rename::Taken => {
                info!(id = %id, "requested identifier is taken, keeping current one");
                GlobalReply::success()
            }
            Rename::Invalid => {
                debug!(id = %id, "invalid identifier requested");
                GlobalReply::failure()
            }
        }
    }

    /// Bind the public listener and register the session.
    async fn forward(&self, bind_addr: &str, bind_port: u32) -> BoreResult<u16> {
        let (listener, port) = self.ctx.allocator.bind(bind_addr, bind_port).await?;

        let binding = Binding {
            addr: bind_addr.to_string(),
            port,
        };
        let handle = spawn_listener(listener, binding, &self.session, self.connection.clone());
        self.session
            .insert_listener(format!("{bind_addr}:{port}"), handle)
            .await;

        let id = self.ctx.registry.register(&self.session, bind_addr, port).await;
        self.session.record_id(&id);
        info!(addr = %bind_addr, port, "forward established");

        self.announce_once().await;
        Ok(port)
    }

    async fn cancel_forward(&self, bind_addr: &str, bind_port: u32) -> GlobalReply {
        let key = format!("{bind_addr}:{bind_port}");
        let Some((handle, remaining)) = self.session.remove_listener(&key).await else {
            debug!(bind = %key, "cancel for unknown forward");
            return GlobalReply::failure();
        };
        handle.close().await;

        match remaining {
            Some((addr, port)) => {
                let id = self.ctx.registry.register(&self.session, &addr, port).await;
                self.session.record_id(&id);
            }
            None => {
                self.ctx.registry.deregister(&self.session).await;
            }
        }
        info!(bind = %key, "forward cancelled");
        GlobalReply::success()
    }

    /// Write the banner once, after the first successful forward.
    async fn announce_once(&self) {
        let first = {
            let mut state = self.session.state.lock().await;
            !std::mem::replace(&mut state.announced, true)
        };
        if first {
            self.announce().await;
        }
    }

    /// Write the banner if the session is registered.
    async fn announce(&self) {
        let (id, port, registered) = {
            let state = self.session.state.lock().await;
            (state.id.clone(), state.port, state.registered)
        };
        if registered {
            self.session
                .notify(render_banner(&self.ctx.domain, &id, port));
        }
    }
}
