//! QUIC channel helpers shared by the bore server and client.
//!
//! A tunnel is one QUIC connection. The first bidirectional stream opened by
//! the client is the control stream; every later stream begins with a
//! [`ChannelOpen`] frame and then carries raw bytes.

use crate::codec::{read_frame, write_frame};
use crate::error::{BoreError, BoreResult};
use crate::messages::ChannelOpen;
use quinn::{Connection, IdleTimeout, RecvStream, SendStream, TransportConfig, VarInt};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Concurrent streams each side lets its peer open.
const MAX_CONCURRENT_STREAMS: u32 = 1024;

/// A QUIC bidirectional stream usable as a single duplex byte stream.
pub struct TunnelStream {
    send: SendStream,
    recv: RecvStream,
}

impl TunnelStream {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        Self { send, recv }
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.recv), cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
    }
}

/// Open a new channel on `conn` and send its header.
pub async fn open_channel(conn: &Connection, header: &ChannelOpen) -> BoreResult<TunnelStream> {
    let (send, recv) = conn.open_bi().await?;
    let mut stream = TunnelStream::new(send, recv);
    write_frame(&mut stream, header).await?;
    Ok(stream)
}

/// Accept the next peer-opened channel and read its header.
pub async fn accept_channel(conn: &Connection) -> BoreResult<(ChannelOpen, TunnelStream)> {
    let (send, recv) = conn.accept_bi().await?;
    let mut stream = TunnelStream::new(send, recv);
    let header = read_frame::<_, ChannelOpen>(&mut stream)
        .await?
        .ok_or_else(|| BoreError::InvalidMessage("channel closed before header".into()))?;
    Ok((header, stream))
}

/// Transport parameters shared by both ends of a tunnel.
///
/// `idle_timeout` is the reaping deadline for a connection that carries no
/// traffic at all; no QUIC-level keepalive is sent, so only real control or
/// data traffic keeps a session alive.
pub fn transport_config(idle_timeout: Duration) -> BoreResult<Arc<TransportConfig>> {
    let idle = IdleTimeout::try_from(idle_timeout)
        .map_err(|e| BoreError::Config(format!("idle timeout out of range: {e}")))?;

    let mut transport = TransportConfig::default();
    transport
        .max_idle_timeout(Some(idle))
        .max_concurrent_bidi_streams(VarInt::from_u32(MAX_CONCURRENT_STREAMS))
        .max_concurrent_uni_streams(VarInt::from_u32(0));
    Ok(Arc::new(transport))
}
