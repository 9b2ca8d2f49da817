//! Frame header codec and buffer-level frame extraction.
//!
//! The header is two big-endian `u32`s: message type and payload length.
//! [`extract_frame`] implements the receive-side contract: it either removes
//! one complete frame from the buffer or, on a short read, consumes nothing
//! and reports "need more".

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtoError;
use crate::message::MessageType;

/// Size of the fixed message header in bytes.
pub const HEADER_LEN: usize = 8;

/// Hard cap on payload size (1 MiB). Anything larger is a protocol violation.
pub const MAX_PAYLOAD_LEN: u32 = 1024 * 1024;

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub msg_type: MessageType,
    pub data_len: u32,
}

impl FrameHeader {
    pub fn new(msg_type: MessageType, data_len: u32) -> Self {
        Self { msg_type, data_len }
    }

    /// Append the wire form of this header to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.msg_type.code());
        buf.put_u32(self.data_len);
    }

    /// Parse and validate a header from exactly [`HEADER_LEN`] bytes.
    ///
    /// Validation covers the recognized type range and the payload cap; a
    /// violating header poisons the whole stream, so callers must discard
    /// their buffer and close on error.
    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Result<Self, ProtoError> {
        let raw_type = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let data_len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        let msg_type = MessageType::from_code(raw_type)
            .ok_or(ProtoError::UnknownMessageType(raw_type))?;
        if data_len > MAX_PAYLOAD_LEN {
            return Err(ProtoError::OversizeFrame(data_len));
        }

        Ok(Self { msg_type, data_len })
    }
}

/// Try to remove one complete frame from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer holds less than a full frame; in that
/// case nothing is consumed and the caller should read more bytes. On success
/// the header and payload are split off the buffer and the payload is
/// returned alongside its type.
pub fn extract_frame(buf: &mut BytesMut) -> Result<Option<(MessageType, Bytes)>, ProtoError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let mut header_bytes = [0u8; HEADER_LEN];
    header_bytes.copy_from_slice(&buf[..HEADER_LEN]);
    let header = FrameHeader::decode(&header_bytes)?;

    let total = HEADER_LEN + header.data_len as usize;
    if buf.len() < total {
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    let payload = buf.split_to(header.data_len as usize).freeze();
    Ok(Some((header.msg_type, payload)))
}
