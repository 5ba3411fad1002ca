//! Public TCP listeners. Each accepted connection becomes a
//! `forwarded-tcpip` channel back to the tunnel client.

use super::session::TunnelSession;
use bore_core::{open_channel, splice, ChannelOpen};
use quinn::Connection;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};

/// Pause after a transient accept error before accepting again.
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// What a forward request asked for and what was actually bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub addr: String,
    pub port: u16,
}

/// A running public listener owned by a session.
pub(crate) struct ListenerHandle {
    binding: Binding,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    /// Stop accepting, cancel in-flight forwards and wait until the port is
    /// released.
    pub async fn close(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(port = self.binding.port, error = %e, "listener task failed");
        }
    }
}

/// Start accepting on `listener` for `session`.
pub(crate) fn spawn_listener(
    listener: TcpListener,
    binding: Binding,
    session: &TunnelSession,
    connection: Connection,
) -> ListenerHandle {
    let cancel = session.child_token();
    let task = tokio::spawn(
        accept_loop(listener, binding.clone(), connection, cancel.clone())
            .instrument(session.span().clone()),
    );
    ListenerHandle {
        binding,
        cancel,
        task,
    }
}

async fn accept_loop(
    listener: TcpListener,
    binding: Binding,
    connection: Connection,
    cancel: CancellationToken,
) {
    info!(addr = %binding.addr, port = binding.port, "listening for forwarded connections");
    let mut forwards = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(_) = forwards.join_next(), if !forwards.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    forwards.spawn(
                        forward_connection(
                            stream,
                            peer,
                            binding.clone(),
                            connection.clone(),
                            cancel.child_token(),
                        )
                        .in_current_span(),
                    );
                }
                Err(e) if is_transient_accept_error(&e) => {
                    debug!(port = binding.port, error = %e, "transient accept error");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
                Err(e) => {
                    warn!(port = binding.port, error = %e, "accept failed, closing listener");
                    break;
                }
            },
        }
    }

    drop(listener);
    cancel.cancel();
    while forwards.join_next().await.is_some() {}
    debug!(port = binding.port, "listener closed");
}

async fn forward_connection(
    inbound: TcpStream,
    peer: SocketAddr,
    binding: Binding,
    connection: Connection,
    cancel: CancellationToken,
) {
    let header = ChannelOpen::ForwardedTcpip {
        connected_addr: binding.addr.clone(),
        connected_port: binding.port as u32,
        origin_addr: peer.ip().to_string(),
        origin_port: peer.port() as u32,
    };

    let channel = tokio::select! {
        _ = cancel.cancelled() => return,
        opened = open_channel(&connection, &header) => match opened {
            Ok(channel) => channel,
            Err(e) => {
                warn!(peer = %peer, port = binding.port, error = %e, "could not open forwarded channel");
                return;
            }
        },
    };

    if let Err(e) = inbound.set_nodelay(true) {
        trace!(error = %e, "set_nodelay failed");
    }

    let stats = splice(inbound, channel, cancel).await;
    debug!(
        peer = %peer,
        port = binding.port,
        sent = stats.a_to_b,
        received = stats.b_to_a,
        "forwarded connection finished"
    );
}

/// Accept errors caused by one bad connection or by a resource limit that
/// clears on its own, rather than by the listener itself.
pub(crate) fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    ) || is_resource_exhaustion(e)
}

/// Out of descriptors, socket buffers or kernel memory.
#[cfg(unix)]
fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(code) if code == libc::EMFILE
            || code == libc::ENFILE
            || code == libc::ENOBUFS
            || code == libc::ENOMEM
    )
}

#[cfg(not(unix))]
fn is_resource_exhaustion(_e: &io::Error) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_accept_errors() {
        let transient = [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Interrupted,
        ];
        for kind in transient {
            assert!(is_transient_accept_error(&io::Error::from(kind)));
        }
        assert!(!is_transient_accept_error(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
        assert!(!is_transient_accept_error(&io::Error::from(
            io::ErrorKind::InvalidInput
        )));
    }

    #[cfg(unix)]
    #[test]
    fn descriptor_exhaustion_is_transient() {
        for code in [libc::EMFILE, libc::ENFILE, libc::ENOBUFS, libc::ENOMEM] {
            let e = io::Error::from_raw_os_error(code);
            assert!(is_transient_accept_error(&e), "{e}");
        }
        assert!(!is_transient_accept_error(&io::Error::from_raw_os_error(
            libc::EBADF
        )));
    }
}
