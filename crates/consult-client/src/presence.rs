//! Presence and typing state folded from `status`/`typing` frames.
//! Nothing here is persisted; state lives only as long as the session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use consult_proto::PresenceStatus;

/// Per-counterpart online flags, keyed by user id.
#[derive(Default)]
pub struct PresenceMap {
    inner: RwLock<HashMap<String, bool>>,
}

impl PresenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_online(&self, user_id: &str, online: bool) {
        self.inner.write().insert(user_id.to_string(), online);
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.inner.read().get(user_id).copied().unwrap_or(false)
    }
}

/// Folds remote presence/typing frames into local state, with the
/// guards the chat session relies on: the local user's own frames are
/// ignored, and typing only applies to the active consultation.
pub struct PresenceTracker {
    local_user: String,
    map: PresenceMap,
    counterpart_typing: AtomicBool,
}

impl PresenceTracker {
    pub fn new(local_user: impl Into<String>) -> Self {
        Self {
            local_user: local_user.into(),
            map: PresenceMap::new(),
            counterpart_typing: AtomicBool::new(false),
        }
    }

    pub fn apply_status(&self, user_id: &str, status: PresenceStatus) {
        if user_id == self.local_user {
            return;
        }
        self.map
            .set_online(user_id, status == PresenceStatus::Online);
    }

    pub fn apply_typing(
        &self,
        sender_id: &str,
        frame_consultation: i64,
        active_consultation: Option<i64>,
        is_typing: bool,
    ) {
        if sender_id == self.local_user {
            return;
        }
        if active_consultation != Some(frame_consultation) {
            return;
        }
        self.counterpart_typing.store(is_typing, Ordering::SeqCst);
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.map.is_online(user_id)
    }

    pub fn counterpart_typing(&self) -> bool {
        self.counterpart_typing.load(Ordering::SeqCst)
    }

    /// Called when the active consultation changes; a stale typing flag
    /// must not leak into the next session.
    pub fn reset_typing(&self) {
        self.counterpart_typing.store(false, Ordering::SeqCst);
    }
}
