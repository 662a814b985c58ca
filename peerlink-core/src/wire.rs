//! Event framing: 4-byte magic + length-prefix (4 bytes LE) + bincode payload.

use crate::protocol::EventInfo;

const MAGIC: &[u8; 4] = b"PLEV";
const HEADER_SIZE: usize = 8;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode an event payload into a single frame.
pub fn encode_event(info: &EventInfo) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(info).map_err(FrameEncodeError::Encode)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode a whole data payload as an event frame. Payloads are delivered whole by the
/// transport, so trailing bytes are an error rather than a second frame.
pub fn decode_event(bytes: &[u8]) -> Result<EventInfo, FrameDecodeError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FrameDecodeError::Truncated);
    }
    if &bytes[..4] != MAGIC {
        return Err(FrameDecodeError::NotAnEvent);
    }
    let len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < HEADER_SIZE + len {
        return Err(FrameDecodeError::Truncated);
    }
    if bytes.len() > HEADER_SIZE + len {
        return Err(FrameDecodeError::TrailingBytes(bytes.len() - HEADER_SIZE - len));
    }
    let info: EventInfo =
        bincode::deserialize(&bytes[HEADER_SIZE..]).map_err(FrameDecodeError::Decode)?;
    Ok(info)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("payload is not an event frame")]
    NotAnEvent,
    #[error("truncated frame")]
    Truncated,
    #[error("frame too large")]
    TooLarge,
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
