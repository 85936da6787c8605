//! Chat session manager. One consultation is active at a time; switching
//! tears the previous socket down before the next one opens, and every
//! inbound frame is checked against the active consultation id so a
//! late frame from a closed session cannot leak into the new one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use time::OffsetDateTime;
use tokio::task::JoinHandle;

use consult_proto::{ChatMessage, Frame, FrameKind};

use crate::channel::{ChannelFactory, ChannelState, FrameChannel};
use crate::config::ClientConfig;
use crate::dispatch::FrameDispatcher;
use crate::error::SessionResult;
use crate::presence::PresenceTracker;
use crate::rest::ChatHistory;
use crate::Identity;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveConsultation {
    consultation_id: i64,
    counterpart_id: String,
}

/// State shared between the session handle and its pump tasks.
pub struct ChatShared {
    active: RwLock<Option<ActiveConsultation>>,
    messages: RwLock<Vec<ChatMessage>>,
    presence: PresenceTracker,
    loading: AtomicBool,
    dedup_window: Duration,
}

impl ChatShared {
    fn new(local_user: &str, dedup_window: Duration) -> Self {
        Self {
            active: RwLock::new(None),
            messages: RwLock::new(Vec::new()),
            presence: PresenceTracker::new(local_user),
            loading: AtomicBool::new(false),
            dedup_window,
        }
    }

    fn begin(&self, consultation_id: i64, counterpart_id: &str) {
        *self.active.write() = Some(ActiveConsultation {
            consultation_id,
            counterpart_id: counterpart_id.to_string(),
        });
        self.messages.write().clear();
        self.presence.reset_typing();
        self.loading.store(true, Ordering::SeqCst);
    }

    fn active_id(&self) -> Option<i64> {
        self.active.read().as_ref().map(|a| a.consultation_id)
    }

    fn counterpart_id(&self) -> Option<String> {
        self.active.read().as_ref().map(|a| a.counterpart_id.clone())
    }

    /// Clears the selection after a failed connect so that selecting the
    /// same consultation again retries instead of short-circuiting as a
    /// no-op.
    fn fail_load(&self, consultation_id: i64) {
        let mut active = self.active.write();
        if active.as_ref().map(|a| a.consultation_id) == Some(consultation_id) {
            *active = None;
            self.loading.store(false, Ordering::SeqCst);
        }
    }

    fn finish_load(&self, consultation_id: i64) {
        if self.active_id() == Some(consultation_id) {
            self.loading.store(false, Ordering::SeqCst);
        }
    }

    fn apply(&self, frame: Frame) {
        match frame {
            Frame::Message {
                id,
                message,
                consultation_id,
                sender_id,
                sender_type,
                created_at,
            } => {
                if self.active_id() != Some(consultation_id) {
                    tracing::debug!(
                        target = "chat",
                        consultation_id,
                        "discarding message for inactive consultation"
                    );
                    return;
                }
                let id = id.unwrap_or_else(|| fallback_message_id(&sender_id, created_at));
                self.append_unique(ChatMessage {
                    id,
                    message,
                    created_at,
                    sender: sender_type,
                    sender_id,
                    consultation_id,
                });
            }
            Frame::Typing {
                sender_id,
                consultation_id,
                is_typing,
            } => {
                self.presence
                    .apply_typing(&sender_id, consultation_id, self.active_id(), is_typing);
            }
            Frame::Status { user_id, status } => {
                self.presence.apply_status(&user_id, status);
            }
            other => {
                tracing::trace!(
                    target = "chat",
                    kind = other.kind().as_str(),
                    "ignoring frame outside the chat scope"
                );
            }
        }
    }

    fn append_unique(&self, incoming: ChatMessage) {
        let mut messages = self.messages.write();
        if messages
            .iter()
            .any(|existing| existing.duplicate_of(&incoming, self.dedup_window))
        {
            tracing::debug!(target = "chat", id = %incoming.id, "dropping duplicate message");
            return;
        }
        messages.push(incoming);
    }

    /// Replaces the buffer with the fetched history, then re-applies any
    /// frames that arrived live while the fetch was in flight. Live
    /// frames already present in the history fold away via dedup.
    fn seed_history(&self, consultation_id: i64, history: Vec<ChatMessage>) {
        if self.active_id() != Some(consultation_id) {
            tracing::debug!(
                target = "chat",
                consultation_id,
                "discarding history for inactive consultation"
            );
            return;
        }
        let raced = {
            let mut messages = self.messages.write();
            std::mem::replace(&mut *messages, history)
        };
        for message in raced {
            self.append_unique(message);
        }
        self.finish_load(consultation_id);
    }

    fn messages(&self) -> Vec<ChatMessage> {
        self.messages.read().clone()
    }
}

fn fallback_message_id(sender_id: &str, created_at: OffsetDateTime) -> String {
    let millis = created_at.unix_timestamp_nanos() / 1_000_000;
    format!("{sender_id}-{millis}")
}

struct ActiveChannel {
    channel: Arc<dyn FrameChannel>,
    tasks: Vec<JoinHandle<()>>,
}

/// Handle over the per-consultation chat socket, message buffer, and
/// presence state. Cheap accessors read shared state; the socket pump
/// runs on background tasks owned by the handle.
pub struct ChatSession {
    identity: Identity,
    config: ClientConfig,
    factory: Arc<dyn ChannelFactory>,
    history: Arc<dyn ChatHistory>,
    shared: Arc<ChatShared>,
    active_channel: Mutex<Option<ActiveChannel>>,
}

impl ChatSession {
    pub fn new(
        identity: Identity,
        config: ClientConfig,
        factory: Arc<dyn ChannelFactory>,
        history: Arc<dyn ChatHistory>,
    ) -> Self {
        let shared = Arc::new(ChatShared::new(&identity.user_id, config.dedup_window));
        Self {
            identity,
            config,
            factory,
            history,
            shared,
            active_channel: Mutex::new(None),
        }
    }

    /// Switches the session to `consultation_id`. Selecting the already
    /// active consultation is a no-op; otherwise the previous socket is
    /// closed before the new one opens.
    pub async fn select_consultation(
        &self,
        consultation_id: i64,
        counterpart_id: &str,
    ) -> SessionResult<()> {
        if self.shared.active_id() == Some(consultation_id) {
            tracing::debug!(target = "chat", consultation_id, "consultation already active");
            return Ok(());
        }

        // Mark the new selection before the first suspension point so an
        // older select still awaiting its connect sees itself superseded.
        self.shared.begin(consultation_id, counterpart_id);
        self.close_active().await;

        let url = self.config.chat_socket_url(consultation_id);
        let (channel, frames) = match self.factory.open(&url).await {
            Ok(opened) => opened,
            Err(err) => {
                tracing::warn!(
                    target = "chat",
                    consultation_id,
                    error = %err,
                    "chat socket connect failed"
                );
                self.shared.fail_load(consultation_id);
                return Err(err);
            }
        };
        if self.shared.active_id() != Some(consultation_id) {
            tracing::debug!(
                target = "chat",
                consultation_id,
                "selection superseded while connecting"
            );
            channel.close().await;
            return Ok(());
        }

        let join = Frame::Join {
            sender_id: self.identity.user_id.clone(),
            sender_type: self.identity.role,
            consultation_id,
        };
        if let Err(err) = channel.send(&join) {
            self.shared.fail_load(consultation_id);
            channel.close().await;
            return Err(err);
        }

        let dispatcher = Arc::new(FrameDispatcher::new());
        let mut inbound =
            dispatcher.subscribe(&[FrameKind::Message, FrameKind::Typing, FrameKind::Status]);
        let feed = dispatcher.run(frames);

        let shared = Arc::clone(&self.shared);
        let pump = tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                shared.apply(frame);
            }
        });

        let shared = Arc::clone(&self.shared);
        let history = Arc::clone(&self.history);
        let fetch = tokio::spawn(async move {
            match history.chat_messages(consultation_id).await {
                Ok(messages) => shared.seed_history(consultation_id, messages),
                Err(err) => {
                    tracing::warn!(
                        target = "chat",
                        consultation_id,
                        error = %err,
                        "chat history fetch failed"
                    );
                    shared.finish_load(consultation_id);
                }
            }
        });

        let tasks = vec![feed, pump, fetch];
        let stale = {
            let mut active = self.active_channel.lock();
            if self.shared.active_id() == Some(consultation_id) {
                *active = Some(ActiveChannel {
                    channel: Arc::clone(&channel),
                    tasks,
                });
                None
            } else {
                Some(tasks)
            }
        };
        if let Some(tasks) = stale {
            tracing::debug!(
                target = "chat",
                consultation_id,
                "selection superseded before install"
            );
            for task in &tasks {
                task.abort();
            }
            channel.close().await;
        }
        Ok(())
    }

    /// Sends a chat message tagged with a fresh client id. Blank input
    /// and a missing or non-open channel degrade to logged no-ops.
    pub fn send_message(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            tracing::debug!(target = "chat", "ignoring blank message");
            return;
        }
        let Some(consultation_id) = self.shared.active_id() else {
            tracing::warn!(target = "chat", "no active consultation, message dropped");
            return;
        };
        let frame = Frame::Message {
            id: Some(uuid::Uuid::new_v4().to_string()),
            message: text.to_string(),
            consultation_id,
            sender_id: self.identity.user_id.clone(),
            sender_type: self.identity.role,
            created_at: OffsetDateTime::now_utc(),
        };
        self.send_frame(frame);
    }

    pub fn send_typing(&self, is_typing: bool) {
        let Some(consultation_id) = self.shared.active_id() else {
            return;
        };
        self.send_frame(Frame::Typing {
            sender_id: self.identity.user_id.clone(),
            consultation_id,
            is_typing,
        });
    }

    fn send_frame(&self, frame: Frame) {
        let channel = {
            let guard = self.active_channel.lock();
            guard.as_ref().map(|active| Arc::clone(&active.channel))
        };
        let Some(channel) = channel else {
            tracing::warn!(target = "chat", "no chat socket, frame dropped");
            return;
        };
        if channel.state() != ChannelState::Open {
            tracing::warn!(target = "chat", "chat socket not open, frame dropped");
            return;
        }
        if let Err(err) = channel.send(&frame) {
            tracing::warn!(target = "chat", error = %err, "chat send failed");
        }
    }

    pub async fn close(&self) {
        self.close_active().await;
        *self.shared.active.write() = None;
        self.shared.loading.store(false, Ordering::SeqCst);
    }

    async fn close_active(&self) {
        let previous = self.active_channel.lock().take();
        if let Some(active) = previous {
            for task in &active.tasks {
                task.abort();
            }
            active.channel.close().await;
        }
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.shared.messages()
    }

    pub fn is_loading(&self) -> bool {
        self.shared.loading.load(Ordering::SeqCst)
    }

    pub fn active_consultation(&self) -> Option<i64> {
        self.shared.active_id()
    }

    pub fn counterpart_id(&self) -> Option<String> {
        self.shared.counterpart_id()
    }

    pub fn counterpart_typing(&self) -> bool {
        self.shared.presence.counterpart_typing()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.shared.presence.is_online(user_id)
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if let Some(active) = self.active_channel.lock().take() {
            for task in &active.tasks {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consult_proto::SenderRole;
    use time::macros::datetime;

    const WINDOW: Duration = Duration::from_millis(2000);

    fn shared() -> ChatShared {
        let shared = ChatShared::new("me", WINDOW);
        shared.begin(42, "doctor-9");
        shared
    }

    fn message_frame(id: Option<&str>, consultation_id: i64, text: &str) -> Frame {
        Frame::Message {
            id: id.map(str::to_string),
            message: text.to_string(),
            consultation_id,
            sender_id: "doctor-9".to_string(),
            sender_type: SenderRole::Doctor,
            created_at: datetime!(2024-05-01 10:00:00 UTC),
        }
    }

    #[test]
    fn stale_consultation_frames_are_discarded() {
        let shared = shared();
        shared.apply(message_frame(Some("m1"), 41, "old"));
        assert!(shared.messages().is_empty());

        shared.apply(message_frame(Some("m1"), 42, "current"));
        assert_eq!(shared.messages().len(), 1);
    }

    #[test]
    fn missing_id_gets_sender_and_timestamp_fallback() {
        let shared = shared();
        shared.apply(message_frame(None, 42, "hello"));
        let messages = shared.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].id.starts_with("doctor-9-"));
    }

    #[test]
    fn duplicate_deliveries_append_once() {
        let shared = shared();
        shared.apply(message_frame(Some("m1"), 42, "hello"));
        shared.apply(message_frame(Some("m1"), 42, "hello"));
        // Same sender and text inside the window, different id.
        shared.apply(message_frame(Some("m2"), 42, "hello"));
        assert_eq!(shared.messages().len(), 1);
    }

    #[test]
    fn history_seed_keeps_raced_live_frames() {
        let shared = shared();
        shared.apply(message_frame(Some("live-1"), 42, "raced in"));

        let history = vec![ChatMessage {
            id: "h1".to_string(),
            message: "from history".to_string(),
            created_at: datetime!(2024-05-01 09:00:00 UTC),
            sender: SenderRole::User,
            sender_id: "me".to_string(),
            consultation_id: 42,
        }];
        shared.seed_history(42, history);

        let messages = shared.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, "h1");
        assert_eq!(messages[1].id, "live-1");
        assert!(!shared.loading.load(Ordering::SeqCst));
    }

    #[test]
    fn history_for_replaced_consultation_is_ignored() {
        let shared = shared();
        shared.begin(43, "doctor-9");
        shared.seed_history(42, vec![]);
        assert!(shared.loading.load(Ordering::SeqCst));
    }

    #[test]
    fn failed_load_clears_selection_for_retry() {
        let shared = shared();
        shared.fail_load(42);
        assert_eq!(shared.active_id(), None);
        assert!(!shared.loading.load(Ordering::SeqCst));
    }
}
