//! Length-prefixed framing over a byte stream
//!
//! Every frame is a big-endian `u16` length followed by exactly that many
//! payload bytes. Payloads are capped at [`MAX_FRAME_LEN`] so the prefix
//! also fits the signed short the protocol was designed around.

use crate::config::MAX_FRAME_LEN;
use crate::error::FrameError;
use log::warn;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LEN_PREFIX: usize = 2;

/// Encoded form of the bodiless disconnect message, written best-effort on close
pub const DISCONNECT_FRAME: [u8; 3] = [0x00, 0x01, 0xFF];

/// Prefixes `payload` with its length
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge { len: payload.len() });
    }

    let mut frame = Vec::with_capacity(LEN_PREFIX + payload.len());
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Reads one complete frame, honoring an optional deadline for the whole frame.
///
/// Either the full payload is returned or an error is; a partial payload is
/// never handed out. An oversized length prefix is skipped over so the stream
/// stays aligned on the next frame, and reported as [`FrameError::TooLarge`].
pub async fn read_frame<R>(reader: &mut R, timeout: Option<Duration>) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, read_frame_inner(reader))
            .await
            .map_err(|_| FrameError::Timeout)?,
        None => read_frame_inner(reader).await,
    }
}

/// Writes `payload` as one frame
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    Ok(())
}

async fn read_frame_inner<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LEN_PREFIX];
    read_full(reader, &mut prefix).await?;
    let len = u16::from_be_bytes(prefix) as usize;

    if len > MAX_FRAME_LEN {
        let skipped = tokio::io::copy(&mut (&mut *reader).take(len as u64), &mut tokio::io::sink()).await?;
        if (skipped as usize) < len {
            return Err(FrameError::ShortRead {
                read: skipped as usize,
                expected: len,
            });
        }
        warn!("Discarded oversized frame of {} bytes", len);
        return Err(FrameError::TooLarge { len });
    }

    let mut payload = vec![0u8; len];
    read_full(reader, &mut payload).await?;
    Ok(payload)
}

/// Like `read_exact`, but reports how far it got when the peer hangs up
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(FrameError::ShortRead {
                read: filled,
                expected: buf.len(),
            });
        }
        filled += n;
    }
    Ok(())
}
