//! Length-prefixed framing: a 4-byte big-endian length followed by a UTF-8 JSON body.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::QueueError;

/// Maximum frame body size (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub const HEADER_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

impl From<FrameError> for QueueError {
    fn from(error: FrameError) -> Self {
        match error {
            FrameError::FrameTooLarge(_) => QueueError::Protocol(error.to_string()),
            FrameError::Io(e) => QueueError::Io(e),
            FrameError::ConnectionClosed => QueueError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed",
            )),
        }
    }
}

pub fn encode(body: &[u8]) -> Result<Vec<u8>, FrameError> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(body.len()));
    }
    let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(body);
    Ok(buf)
}

/// Write one frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<(), FrameError> {
    let encoded = encode(body)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame body. A clean EOF before the header is `ConnectionClosed`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes(header) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

pub async fn write_json<W, T>(writer: &mut W, value: &T) -> Result<(), QueueError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    write_frame(writer, &body).await?;
    Ok(())
}

pub async fn read_json<R, T>(reader: &mut R) -> Result<T, QueueError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let body = read_frame(reader).await?;
    serde_json::from_slice(&body).map_err(|e| QueueError::Protocol(format!("invalid JSON body: {}", e)))
}
