//! Length-prefixed framing for [`StreamingMessage`].
//!
//! Each frame is a 4-byte big-endian payload length followed by the MessagePack encoding of
//! the message (struct fields encoded by name, so both sides may add optional fields).

use {
    std::io,
    tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    thiserror::Error,
    crate::messages::StreamingMessage,
};

/// Largest payload accepted in a single frame. Bigger values travel through shared memory.
pub const MAX_FRAME_SIZE: usize = 128 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },
}

impl CodecError {
    /// Frame could not be understood, the stream can not be trusted anymore.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::FrameTooLarge { .. })
    }
}

pub fn encode_message(message: &StreamingMessage) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(message)?)
}

pub fn decode_message(bytes: &[u8]) -> Result<StreamingMessage, CodecError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &StreamingMessage) -> Result<(), CodecError> {
    let payload = encode_message(message)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge { size: payload.len(), limit: MAX_FRAME_SIZE });
    }

    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the next frame. Returns `Ok(None)` when the stream is closed on a frame boundary.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<StreamingMessage>, CodecError> {
    let length = match reader.read_u32().await {
        Ok(v) => v as usize,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if length > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge { size: length, limit: MAX_FRAME_SIZE });
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    decode_message(&payload).map(Some)
}
