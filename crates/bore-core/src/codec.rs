//! Length-prefixed CBOR framing for the bore control stream.
//!
//! Wire format: `[4-byte big-endian length][CBOR payload]`

use crate::error::{BoreError, BoreResult};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame payload.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Encode a serializable value into a length-prefixed CBOR frame.
pub fn frame_encode<T: serde::Serialize>(value: &T) -> BoreResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;

    if payload.len() > MAX_FRAME_LEN {
        return Err(BoreError::FrameTooLarge(payload.len()));
    }

    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> BoreResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}

/// Write one frame and flush it.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> BoreResult<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let frame = frame_encode(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame from the stream.
///
/// Returns `Ok(None)` when the stream ends cleanly before a length prefix.
/// A stream that ends inside a frame, including inside the prefix, is an
/// error.
pub async fn read_frame<R, T>(reader: &mut R) -> BoreResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    let first = reader.read(&mut len_buf).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut len_buf[first..]).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(BoreError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    cbor_decode(&payload).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::io::ErrorKind;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestMsg {
        name: String,
        value: i64,
    }

    #[test]
    fn frame_has_length_prefix() {
        let msg = TestMsg {
            name: "hello".into(),
            value: 42,
        };
        let frame = frame_encode(&msg).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);

        let decoded: TestMsg = cbor_decode(&frame[4..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn frames_arrive_in_order() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let writer = tokio::spawn(async move {
            for i in 0..3 {
                let msg = TestMsg {
                    name: format!("msg-{i}"),
                    value: i,
                };
                write_frame(&mut client, &msg).await.unwrap();
            }
        });

        for i in 0..3 {
            let msg: TestMsg = read_frame(&mut server).await.unwrap().unwrap();
            assert_eq!(msg.value, i);
            assert_eq!(msg.name, format!("msg-{i}"));
        }
        writer.await.unwrap();

        // Writer dropped: clean end of stream.
        let end: Option<TestMsg> = read_frame(&mut server).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let frame = frame_encode(&TestMsg {
            name: "cut".into(),
            value: 7,
        })
        .unwrap();
        client.write_all(&frame[..frame.len() - 2]).await.unwrap();
        drop(client);

        let result: BoreResult<Option<TestMsg>> = read_frame(&mut server).await;
        assert!(matches!(result, Err(BoreError::Io(_))));
    }

    #[tokio::test]
    async fn truncated_length_prefix_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0, 0]).await.unwrap();
        drop(client);

        let result: BoreResult<Option<TestMsg>> = read_frame(&mut server).await;
        match result {
            Err(BoreError::Io(e)) => assert_eq!(e.kind(), ErrorKind::UnexpectedEof),
            other => panic!("expected an io error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_LEN as u32) + 1;
        client.write_all(&len.to_be_bytes()).await.unwrap();

        let result: BoreResult<Option<TestMsg>> = read_frame(&mut server).await;
        assert!(matches!(result, Err(BoreError::FrameTooLarge(n)) if n == MAX_FRAME_LEN + 1));
    }

    #[test]
    fn garbage_payload_is_codec_error() {
        let result: BoreResult<TestMsg> = cbor_decode(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(BoreError::Codec(_))));
    }
}
