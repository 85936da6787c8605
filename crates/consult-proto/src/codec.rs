use serde_json::Value;
use thiserror::Error;

use crate::{Frame, FrameKind};

/// Why a raw text frame could not be turned into a [`Frame`].
///
/// Callers at the channel boundary log these and drop the frame; a bad
/// frame must never tear down the socket it arrived on.
#[derive(Debug, Error)]
pub enum FrameParseError {
    #[error("invalid json: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("frame has no type field")]
    MissingType,
    #[error("unknown frame type {0:?}")]
    UnknownType(String),
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Decodes one inbound text frame. Unknown `type` values (the relay
/// emits bookkeeping frames such as `message-ack` that clients do not
/// consume) come back as [`FrameParseError::UnknownType`].
pub fn decode_frame(raw: &str) -> Result<Frame, FrameParseError> {
    let value: Value = serde_json::from_str(raw).map_err(FrameParseError::InvalidJson)?;
    let ty = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameParseError::MissingType)?;
    let kind = FrameKind::from_type_str(ty)
        .ok_or_else(|| FrameParseError::UnknownType(ty.to_string()))?;
    serde_json::from_value(value).map_err(|source| FrameParseError::InvalidPayload {
        kind: kind.as_str(),
        source,
    })
}

pub fn encode_frame(frame: &Frame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}
