//! Bidirectional splice between two duplex byte streams.
//!
//! Both directions are copied concurrently. As soon as either direction
//! finishes (EOF or error) both write halves are shut down and the pairing
//! ends, so a half-closed peer never leaves a lingering half-open pipe.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

const BUF_SIZE: usize = 16 * 1024;

/// Bytes moved by one splice, per direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceStats {
    /// Bytes read from `a` and written to `b`.
    pub a_to_b: u64,
    /// Bytes read from `b` and written to `a`.
    pub b_to_a: u64,
}

/// Copy `a -> b` and `b -> a` until either direction completes or `cancel`
/// fires, then close both streams.
pub async fn splice<A, B>(a: A, b: B, cancel: CancellationToken) -> SpliceStats
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let a_to_b = AtomicU64::new(0);
    let b_to_a = AtomicU64::new(0);

    tokio::select! {
        res = pump(&mut a_read, &mut b_write, &a_to_b) => {
            trace!(result = ?res, "a -> b finished first");
        }
        res = pump(&mut b_read, &mut a_write, &b_to_a) => {
            trace!(result = ?res, "b -> a finished first");
        }
        _ = cancel.cancelled() => {
            trace!("splice cancelled");
        }
    }

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    SpliceStats {
        a_to_b: a_to_b.load(Ordering::Relaxed),
        b_to_a: b_to_a.load(Ordering::Relaxed),
    }
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn bytes_flow_both_ways() {
        // outer_a <-> inner_a ==splice== inner_b <-> outer_b
        let (mut outer_a, inner_a) = duplex(1024);
        let (mut outer_b, inner_b) = duplex(1024);
        let task = tokio::spawn(splice(inner_a, inner_b, CancellationToken::new()));

        outer_a.write_all(b"ping from a").await.unwrap();
        let mut buf = [0u8; 11];
        outer_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping from a");

        outer_b.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        outer_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(outer_a);
        let stats = task.await.unwrap();
        assert_eq!(stats.a_to_b, 11);
        assert_eq!(stats.b_to_a, 4);
    }

    #[tokio::test]
    async fn large_payload_is_fully_delivered() {
        let (mut outer_a, inner_a) = duplex(4096);
        let (mut outer_b, inner_b) = duplex(4096);
        let task = tokio::spawn(splice(inner_a, inner_b, CancellationToken::new()));

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            outer_a.write_all(&payload).await.unwrap();
            outer_a
        });

        let mut received = vec![0u8; expected.len()];
        outer_b.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);

        drop(writer.await.unwrap());
        let stats = task.await.unwrap();
        assert_eq!(stats.a_to_b, expected.len() as u64);
    }

    #[tokio::test]
    async fn one_side_closing_closes_the_other() {
        let (outer_a, inner_a) = duplex(64);
        let (mut outer_b, inner_b) = duplex(64);
        let task = tokio::spawn(splice(inner_a, inner_b, CancellationToken::new()));

        drop(outer_a);
        task.await.unwrap();

        // b sees EOF even though it never closed its own side.
        let mut buf = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(1), outer_b.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn cancellation_ends_an_idle_splice() {
        let (_outer_a, inner_a) = duplex(64);
        let (_outer_b, inner_b) = duplex(64);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(splice(inner_a, inner_b, cancel.clone()));

        cancel.cancel();
        let stats = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats, SpliceStats::default());
    }
}
