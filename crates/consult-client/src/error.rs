use std::time::Duration;
use thiserror::Error;

/// Failure taxonomy surfaced by the session client.
///
/// Malformed inbound frames are deliberately absent here: they are
/// swallowed and logged at the channel boundary (see
/// `consult_proto::FrameParseError`) and never propagate to callers.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection timed out after {0:?}")]
    ConnectionTimeout(Duration),
    #[error("transport failure: {0}")]
    Connection(String),
    #[error("send rejected: channel is not open")]
    SendRejected,
    #[error("media unavailable: {0}")]
    MediaUnavailable(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("rest collaborator failed: {0}")]
    Http(String),
    #[error("frame encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type SessionResult<T> = Result<T, SessionError>;
