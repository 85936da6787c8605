//! Client runtime for real-time consultation sessions: the chat socket
//! with its history merge and dedup rules, presence and typing
//! propagation, and WebRTC call negotiation over the user-scoped
//! signaling socket. The wire vocabulary lives in [`consult_proto`];
//! this crate owns the connection lifecycles built on top of it.

pub mod call;
pub mod channel;
pub mod chat;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod media;
pub mod presence;
pub mod rest;
pub mod testing;

pub use consult_proto as proto;

pub use call::{CallEngine, CallState, CandidateQueue};
pub use channel::{ChannelFactory, ChannelState, FrameChannel, FrameReceiver, SocketFactory};
pub use chat::ChatSession;
pub use config::ClientConfig;
pub use dispatch::FrameDispatcher;
pub use error::{SessionError, SessionResult};
pub use media::{LocalMedia, MediaSource, PlaceholderMedia};
pub use presence::{PresenceMap, PresenceTracker};
pub use rest::{default_stun_servers, ChatHistory, IceServerConfig, IceServerSource, RestApi};

use consult_proto::SenderRole;

/// Who this client is on the wire. Both sockets and every outbound
/// frame carry the same identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub role: SenderRole,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, role: SenderRole) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }
}
