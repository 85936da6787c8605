//! Wire protocol shared by the consultation chat and call-signaling
//! sockets. Both scopes speak the same tagged-JSON frame vocabulary;
//! keeping it in a dedicated crate lets the relay and future bindings
//! reuse the definitions without pulling in the client runtime.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;

mod codec;

pub use codec::{decode_frame, encode_frame, FrameParseError};

/// Role tag carried on chat frames. The relay treats "doctor" and
/// "user" as the two ends of a consultation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    User,
    Doctor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// SDP description as the browser serializes it: `{"type": "offer", "sdp": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// ICE candidate blob, field names matching `RTCIceCandidate.toJSON()`
/// since the relay forwards these opaquely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// One discrete JSON message on either socket scope, discriminated by
/// the `type` field. Chat frames use snake_case fields, call frames use
/// the camelCase `senderId`/`targetId` the relay validates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    Join {
        sender_id: String,
        sender_type: SenderRole,
        consultation_id: i64,
    },
    Message {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        message: String,
        consultation_id: i64,
        sender_id: String,
        sender_type: SenderRole,
        #[serde(with = "time::serde::rfc3339")]
        created_at: OffsetDateTime,
    },
    Typing {
        sender_id: String,
        consultation_id: i64,
        is_typing: bool,
    },
    Status {
        user_id: String,
        status: PresenceStatus,
    },
    CallInitiate {
        offer: SessionDescription,
        #[serde(rename = "senderId")]
        sender_id: String,
        #[serde(rename = "targetId")]
        target_id: String,
        consultation_id: i64,
    },
    CallAnswer {
        answer: SessionDescription,
        #[serde(rename = "senderId")]
        sender_id: String,
        #[serde(rename = "targetId")]
        target_id: String,
    },
    IceCandidate {
        candidate: IceCandidate,
        #[serde(rename = "senderId")]
        sender_id: String,
        #[serde(rename = "targetId")]
        target_id: String,
    },
    CallEnd {
        #[serde(rename = "senderId")]
        sender_id: String,
        sender: SenderRole,
        #[serde(rename = "targetId")]
        target_id: String,
    },
}

/// Frame discriminator, used as the dispatch routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Join,
    Message,
    Typing,
    Status,
    CallInitiate,
    CallAnswer,
    IceCandidate,
    CallEnd,
}

impl FrameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Join => "join",
            FrameKind::Message => "message",
            FrameKind::Typing => "typing",
            FrameKind::Status => "status",
            FrameKind::CallInitiate => "call-initiate",
            FrameKind::CallAnswer => "call-answer",
            FrameKind::IceCandidate => "ice-candidate",
            FrameKind::CallEnd => "call-end",
        }
    }

    pub fn from_type_str(value: &str) -> Option<FrameKind> {
        match value {
            "join" => Some(FrameKind::Join),
            "message" => Some(FrameKind::Message),
            "typing" => Some(FrameKind::Typing),
            "status" => Some(FrameKind::Status),
            "call-initiate" => Some(FrameKind::CallInitiate),
            "call-answer" => Some(FrameKind::CallAnswer),
            "ice-candidate" => Some(FrameKind::IceCandidate),
            "call-end" => Some(FrameKind::CallEnd),
            _ => None,
        }
    }
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Join { .. } => FrameKind::Join,
            Frame::Message { .. } => FrameKind::Message,
            Frame::Typing { .. } => FrameKind::Typing,
            Frame::Status { .. } => FrameKind::Status,
            Frame::CallInitiate { .. } => FrameKind::CallInitiate,
            Frame::CallAnswer { .. } => FrameKind::CallAnswer,
            Frame::IceCandidate { .. } => FrameKind::IceCandidate,
            Frame::CallEnd { .. } => FrameKind::CallEnd,
        }
    }

    /// Consultation scope of the frame, where the type carries one.
    pub fn consultation_id(&self) -> Option<i64> {
        match self {
            Frame::Join { consultation_id, .. }
            | Frame::Message { consultation_id, .. }
            | Frame::Typing { consultation_id, .. }
            | Frame::CallInitiate { consultation_id, .. } => Some(*consultation_id),
            _ => None,
        }
    }
}

/// One visible chat entry, immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub sender: SenderRole,
    pub sender_id: String,
    pub consultation_id: i64,
}

impl ChatMessage {
    /// Dedup identity: equal server/client ids, or same sender and text
    /// with timestamps inside the tolerance window. The window absorbs
    /// near-simultaneous duplicate deliveries whose ids differ.
    pub fn duplicate_of(&self, other: &ChatMessage, window: Duration) -> bool {
        if self.id == other.id {
            return true;
        }
        self.sender_id == other.sender_id
            && self.message == other.message
            && (self.created_at - other.created_at).abs() < window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn msg(id: &str, sender: &str, text: &str, at: OffsetDateTime) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            message: text.into(),
            created_at: at,
            sender: SenderRole::User,
            sender_id: sender.into(),
            consultation_id: 42,
        }
    }

    const WINDOW: Duration = Duration::from_millis(2000);

    #[test]
    fn same_id_is_duplicate() {
        let at = datetime!(2024-05-01 10:00:00 UTC);
        let a = msg("m1", "u1", "hello", at);
        let b = msg("m1", "u2", "different text", at + time::Duration::hours(1));
        assert!(a.duplicate_of(&b, WINDOW));
    }

    #[test]
    fn same_sender_and_text_inside_window_is_duplicate() {
        let at = datetime!(2024-05-01 10:00:00 UTC);
        let a = msg("m1", "u1", "hello", at);
        let b = msg("m2", "u1", "hello", at + time::Duration::milliseconds(1999));
        assert!(a.duplicate_of(&b, WINDOW));
        assert!(b.duplicate_of(&a, WINDOW));
    }

    #[test]
    fn outside_window_is_not_duplicate() {
        let at = datetime!(2024-05-01 10:00:00 UTC);
        let a = msg("m1", "u1", "hello", at);
        let b = msg("m2", "u1", "hello", at + time::Duration::milliseconds(2000));
        assert!(!a.duplicate_of(&b, WINDOW));
    }

    #[test]
    fn different_text_is_not_duplicate() {
        let at = datetime!(2024-05-01 10:00:00 UTC);
        let a = msg("m1", "u1", "hello", at);
        let b = msg("m2", "u1", "hello there", at);
        assert!(!a.duplicate_of(&b, WINDOW));
    }
}
