//! Length-prefixed frame codec.
//!
//! Every message on the wire is a 4-byte big-endian length followed by
//! exactly that many payload bytes:
//!
//! ```text
//! +----------------+---------------------------+
//! | length (u32 BE)| payload (length bytes)    |
//! +----------------+---------------------------+
//!
//! Example:
//! Payload: ping
//! Wire:    00 00 00 04 70 69 6e 67
//! ```
//!
//! There is no magic number or version byte. Callers that need versioning
//! embed a tag in the first bytes of the payload.
//!
//! The codec holds no state, so independent streams can be encoded and
//! decoded concurrently.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length header in bytes.
pub const HEADER_LEN: usize = 4;

/// Default maximum payload size (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Errors produced while encoding or decoding a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Payload (or declared length) exceeds the configured maximum.
    #[error("payload too large: {len} > {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// The stream ended partway through the length header.
    #[error("malformed header: stream ended after {got} of 4 header bytes")]
    MalformedHeader { got: usize },

    /// The stream ended before the declared payload was complete.
    #[error("truncated frame: expected {expected} payload bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    /// The stream was already at end-of-stream when a new frame was expected.
    #[error("stream closed by peer")]
    StreamClosed,

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Orderly peer close, not a protocol fault.
    pub fn is_stream_closed(&self) -> bool {
        matches!(self, FrameError::StreamClosed)
    }
}

/// Encode a payload into a complete wire frame.
///
/// Fails with `PayloadTooLarge` before producing any output when the
/// payload is longer than `max_size`.
pub fn encode_frame(payload: &[u8], max_size: usize) -> Result<Bytes, FrameError> {
    let len = checked_len(payload.len(), max_size)?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32(len);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Read one frame from `reader`.
///
/// The declared length is checked against `max_size` before the payload
/// buffer is allocated or a single payload byte is read.
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Bytes, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut got = 0;
    while got < HEADER_LEN {
        let n = reader.read(&mut header[got..]).await?;
        if n == 0 {
            return Err(if got == 0 {
                FrameError::StreamClosed
            } else {
                FrameError::MalformedHeader { got }
            });
        }
        got += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_size {
        return Err(FrameError::PayloadTooLarge { len, max: max_size });
    }

    let mut payload = BytesMut::zeroed(len);
    let mut filled = 0;
    while filled < len {
        let n = reader.read(&mut payload[filled..]).await?;
        if n == 0 {
            return Err(FrameError::Truncated {
                expected: len,
                got: filled,
            });
        }
        filled += n;
    }

    Ok(payload.freeze())
}

/// Encode `payload` and write the whole frame to `writer`, then flush.
pub async fn write_frame<W>(
    writer: &mut W,
    payload: &[u8],
    max_size: usize,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(payload, max_size)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

fn checked_len(len: usize, max_size: usize) -> Result<u32, FrameError> {
    if len > max_size {
        return Err(FrameError::PayloadTooLarge { len, max: max_size });
    }
    u32::try_from(len).map_err(|_| FrameError::PayloadTooLarge {
        len,
        max: u32::MAX as usize,
    })
}
