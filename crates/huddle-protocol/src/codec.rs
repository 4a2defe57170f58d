//! Codecs for encoding and decoding Huddle events.
//!
//! Binary frames use MessagePack with a length prefix; text frames carry
//! plain JSON so browser clients can talk to the hub without extra tooling.

use crate::events::{ClientEvent, RequestId};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// An inbound frame that is not a valid [`ClientEvent`].
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RejectedEvent {
    /// The frame's `id`, if one could still be read.
    pub request_id: Option<u64>,
    /// Why decoding failed.
    #[source]
    pub error: ProtocolError,
}

impl RejectedEvent {
    fn new(request_id: Option<u64>, error: impl Into<ProtocolError>) -> Self {
        Self {
            request_id,
            error: error.into(),
        }
    }

    /// Whether the stream lost its framing and buffered bytes must be dropped.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self.error, ProtocolError::FrameTooLarge(_))
    }
}

/// The encoding a client speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireFormat {
    /// JSON in WebSocket text frames.
    #[default]
    Json,
    /// Length-prefixed MessagePack in WebSocket binary frames.
    MessagePack,
}

/// Encode a value to a length-prefixed MessagePack frame.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded event
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(value, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a value into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into<T: Serialize>(value: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(value)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a value from a complete length-prefixed frame.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?)
}

/// Try to decode a value from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(value))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    Ok(Some(rmp_serde::from_slice(&payload)?))
}

/// Encode a value as a JSON string.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_json<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a value from JSON text.
///
/// # Errors
///
/// Returns an error if the text is not a valid event.
pub fn decode_json<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Decode a client event from JSON text.
///
/// # Errors
///
/// Returns a [`RejectedEvent`] carrying the frame's `id` when the text is
/// valid JSON with a numeric `id` but not a valid event.
pub fn decode_event_json(text: &str) -> Result<ClientEvent, RejectedEvent> {
    serde_json::from_str(text).map_err(|e| {
        let request_id = serde_json::from_str::<RequestId>(text)
            .ok()
            .and_then(|r| r.id);
        RejectedEvent::new(request_id, e)
    })
}

/// Try to decode a client event from a buffer of length-prefixed frames.
///
/// Like [`decode_from`], but a frame that is well formed MessagePack yet
/// not a valid event is consumed and reported with its `id`.
///
/// # Errors
///
/// Returns a [`RejectedEvent`] if the frame is too large or invalid.
pub fn decode_event_from(buf: &mut BytesMut) -> Result<Option<ClientEvent>, RejectedEvent> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(RejectedEvent::new(None, ProtocolError::FrameTooLarge(length)));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    match rmp_serde::from_slice(&payload) {
        Ok(event) => Ok(Some(event)),
        Err(e) => {
            let request_id = rmp_serde::from_slice::<RequestId>(&payload)
                .ok()
                .and_then(|r| r.id);
            Err(RejectedEvent::new(request_id, e))
        }
    }
}
