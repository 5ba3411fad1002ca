//! The tunnel agent: keeps one tunnel to the server and pipes every
//! forwarded connection to the local service.

use crate::config::ClientConfig;
use crate::transport;
use bore_core::messages::close_code;
use bore_core::{
    accept_channel, open_channel, read_frame, splice, write_frame, BoreError, BoreResult,
    ChannelOpen, GlobalReply, GlobalRequest, Greeting, Request,
};
use quinn::{Connection, RecvStream, SendStream, VarInt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Upper bound on waiting for the server to acknowledge our close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Request/reply half of the control stream.
struct Control {
    send: SendStream,
    recv: RecvStream,
}

impl Control {
    async fn request(&mut self, request: Request) -> BoreResult<GlobalReply> {
        let kind = request.kind();
        write_frame(&mut self.send, &GlobalRequest::new(request)).await?;
        read_frame(&mut self.recv)
            .await?
            .ok_or_else(|| BoreError::Transport(format!("control stream closed awaiting {kind} reply")))
    }
}

/// Client side of a bore tunnel.
pub struct TunnelAgent {
    config: ClientConfig,
    bound_port: watch::Sender<Option<u16>>,
}

impl TunnelAgent {
    pub fn new(config: ClientConfig) -> Self {
        let (bound_port, _) = watch::channel(None);
        Self { config, bound_port }
    }

    /// The public port of the current tunnel, `None` while not connected.
    pub fn bound_port(&self) -> watch::Receiver<Option<u16>> {
        self.bound_port.subscribe()
    }

    /// Establish one tunnel and serve it until it dies or `cancel` fires.
    ///
    /// Text the server writes to the status channel is copied to `status`.
    pub async fn run<W>(&self, status: W, cancel: CancellationToken) -> BoreResult<()>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (endpoint, connection) = transport::connect(&self.config).await?;
        let result = self.drive(&connection, status, &cancel).await;
        self.bound_port.send_replace(None);

        let code = match &result {
            Ok(()) => close_code::NORMAL,
            Err(_) => close_code::PROTOCOL_ERROR,
        };
        connection.close(VarInt::from_u32(code), b"client closing");
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, endpoint.wait_idle()).await;
        result
    }

    /// Like [`run`](Self::run), but when reconnecting is enabled a lost tunnel
    /// is re-established after the configured delay. A rejected password is
    /// never retried.
    pub async fn run_with_reconnect<W, F>(
        &self,
        mut make_status: F,
        cancel: CancellationToken,
    ) -> BoreResult<()>
    where
        F: FnMut() -> W,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        loop {
            let result = self.run(make_status(), cancel.clone()).await;
            if cancel.is_cancelled() {
                return Ok(());
            }

            match result {
                Err(e @ BoreError::AuthFailed(_)) => return Err(e),
                result if !self.config.reconnect => return result,
                Ok(()) => info!("tunnel closed, reconnecting"),
                Err(e) => warn!(
                    error = %e,
                    delay = ?self.config.reconnect_delay,
                    "tunnel lost, reconnecting"
                ),
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
    }

    async fn drive<W>(
        &self,
        connection: &Connection,
        status: W,
        cancel: &CancellationToken,
    ) -> BoreResult<()>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut control = handshake(connection).await?;

        if let Some(password) = &self.config.password {
            let reply = control
                .request(Request::Password {
                    password: password.clone(),
                })
                .await?;
            if !reply.success {
                return Err(BoreError::AuthFailed("server rejected the password".into()));
            }
        }

        if let Some(id) = &self.config.id {
            let reply = control.request(Request::SetId { id: id.clone() }).await?;
            if !reply.success {
                warn!(id = %id, "server refused the requested id");
            }
        }

        let mut background = JoinSet::new();
        let status_channel = open_channel(connection, &ChannelOpen::Session).await?;
        background.spawn(copy_status(status_channel, status));

        let reply = control
            .request(Request::TcpipForward {
                bind_addr: self.config.bind_host.clone(),
                bind_port: self.config.bind_port as u32,
            })
            .await?;
        if !reply.success {
            return Err(BoreError::Rejected(format!(
                "server refused to forward {}:{}",
                self.config.bind_host, self.config.bind_port
            )));
        }
        let port = reply
            .bound_port
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(self.config.bind_port);
        info!(port, local = %self.config.local_addr(), "tunnel established");
        self.bound_port.send_replace(Some(port));

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("tunnel cancelled");
                Ok(())
            }
            res = self.keepalive(&mut control) => res,
            res = self.accept_forwards(connection, cancel) => res,
        }
    }

    /// Send a keepalive request every interval; a failed one ends the tunnel.
    async fn keepalive(&self, control: &mut Control) -> BoreResult<()> {
        if !self.config.keep_alive {
            return std::future::pending().await;
        }

        let mut ticker = tokio::time::interval(self.config.keepalive_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let reply = control.request(Request::Keepalive).await?;
            trace!(success = reply.success, "keepalive");
        }
    }

    /// Dial the local service for every forwarded channel. An unreachable
    /// local service ends the tunnel.
    async fn accept_forwards(
        &self,
        connection: &Connection,
        cancel: &CancellationToken,
    ) -> BoreResult<()> {
        let mut splices = JoinSet::new();
        loop {
            tokio::select! {
                Some(_) = splices.join_next(), if !splices.is_empty() => {}
                accepted = accept_channel(connection) => {
                    let (header, channel) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e @ BoreError::Transport(_)) => return Err(e),
                        Err(e) => {
                            warn!(error = %e, "bad channel from server");
                            continue;
                        }
                    };
                    let (origin_addr, origin_port) = match header {
                        ChannelOpen::ForwardedTcpip { origin_addr, origin_port, .. } => {
                            (origin_addr, origin_port)
                        }
                        other => {
                            warn!(channel = ?other, "unexpected channel from server");
                            continue;
                        }
                    };

                    let local = TcpStream::connect(self.config.local_addr())
                        .await
                        .map_err(|e| BoreError::LocalUnreachable(format!(
                            "{}: {e}",
                            self.config.local_addr()
                        )))?;
                    let _ = local.set_nodelay(true);
                    debug!(origin = %format!("{origin_addr}:{origin_port}"), "forwarding connection");
                    splices.spawn(splice(channel, local, cancel.child_token()));
                }
            }
        }
    }
}

async fn handshake(connection: &Connection) -> BoreResult<Control> {
    let (mut send, mut recv) = connection.open_bi().await?;
    write_frame(&mut send, &Greeting::current()).await?;

    let greeting: Greeting = read_frame(&mut recv)
        .await?
        .ok_or_else(|| BoreError::Handshake("server closed the control stream".into()))?;
    if !greeting.is_compatible() {
        return Err(BoreError::Handshake(format!(
            "server speaks {:?}, expected {:?}",
            greeting.version,
            Greeting::current().version
        )));
    }
    Ok(Control { send, recv })
}

/// Copy the status channel to `out`, flushing after every chunk.
async fn copy_status<R, W>(mut channel: R, mut out: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 4096];
    loop {
        let n = match channel.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "status channel closed");
                return;
            }
        };
        if out.write_all(&buf[..n]).await.is_err() || out.flush().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> ClientConfig {
        ClientConfig {
            server_host: "127.0.0.1".into(),
            // Port 0 is rejected by the QUIC stack before any packet is sent.
            server_port: 0,
            reconnect_delay: Duration::from_millis(20),
            ..ClientConfig::default()
        }
    }

    #[tokio::test]
    async fn run_fails_without_reconnect() {
        let agent = TunnelAgent::new(unreachable_config());
        let result = agent
            .run_with_reconnect(tokio::io::sink, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(BoreError::Transport(_))));
        assert_eq!(*agent.bound_port().borrow(), None);
    }

    #[tokio::test]
    async fn reconnect_loop_stops_on_cancel() {
        let agent = TunnelAgent::new(ClientConfig {
            reconnect: true,
            ..unreachable_config()
        });
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stopper.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            agent.run_with_reconnect(tokio::io::sink, cancel),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn status_copy_forwards_everything() {
        let (mut server, client) = tokio::io::duplex(64);
        let (out, mut reader) = tokio::io::duplex(64);
        let copier = tokio::spawn(copy_status(client, out));

        server.write_all(b"Welcome to bore\n").await.unwrap();
        drop(server);
        copier.await.unwrap();

        let mut text = String::new();
        reader.read_to_string(&mut text).await.unwrap();
        assert_eq!(text, "Welcome to bore\n");
    }
}
