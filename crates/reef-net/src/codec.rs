//! Frame codec: 4-byte big-endian length prefix + postcard payload.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::NetError;
use crate::message::Envelope;

/// Maximum frame size: 64 MB. Large values dominate frame size; the
/// limit exists so a corrupt length prefix cannot trigger an absurd
/// allocation.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Encode an envelope into a length-prefixed frame ready to write.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, NetError> {
    let payload =
        postcard::to_allocvec(envelope).map_err(|e| NetError::Serialization(e.to_string()))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(NetError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Read one length-prefixed frame and decode the envelope.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Envelope, NetError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(NetError::FrameTooLarge {
            len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    postcard::from_bytes(&payload).map_err(|e| NetError::Serialization(e.to_string()))
}
