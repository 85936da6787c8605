//! One persistent socket per logical scope (a consultation's chat, or a
//! user's call signaling). The channel decodes inbound text frames and
//! delivers them in arrival order; it never reconnects on its own,
//! that is the owning manager's call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use consult_proto::{decode_frame, encode_frame, Frame};

use crate::error::{SessionError, SessionResult};

/// Lifecycle of one socket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    Closed,
    Failed,
}

pub type FrameReceiver = mpsc::UnboundedReceiver<Frame>;

/// Send/close surface of an open channel. Frame delivery happens on the
/// receiver returned from [`ChannelFactory::open`].
#[async_trait]
pub trait FrameChannel: Send + Sync {
    fn state(&self) -> ChannelState;
    /// Rejects unless the channel is `Open`. Chat callers treat the
    /// rejection as a logged no-op; the call engine retries the offer.
    fn send(&self, frame: &Frame) -> SessionResult<()>;
    /// Idempotent; closing a closed channel has no effect.
    async fn close(&self);
}

#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn open(&self, url: &Url) -> SessionResult<(Arc<dyn FrameChannel>, FrameReceiver)>;
}

/// Production channel over tokio-tungstenite. A writer task drains the
/// outbound queue, a reader task decodes inbound frames; both are
/// aborted on close or drop.
pub struct SocketChannel {
    state: Arc<Mutex<ChannelState>>,
    outbound: mpsc::UnboundedSender<String>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SocketChannel {
    pub async fn open(
        url: &Url,
        connect_timeout: Duration,
    ) -> SessionResult<(Arc<Self>, FrameReceiver)> {
        let (ws, _) = tokio::time::timeout(connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| SessionError::ConnectionTimeout(connect_timeout))?
            .map_err(|err| SessionError::Connection(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target = "relay", url = %url, "socket connected");

        let (mut ws_write, mut ws_read) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Frame>();
        let state = Arc::new(Mutex::new(ChannelState::Open));

        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let reader_state = Arc::clone(&state);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => forward_frame(&frame_tx, &text),
                    Ok(Message::Binary(data)) => {
                        if let Ok(text) = String::from_utf8(data) {
                            forward_frame(&frame_tx, &text);
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        tracing::debug!(target = "relay", error = %err, "socket read error");
                        break;
                    }
                }
            }
            let mut guard = reader_state.lock();
            if *guard == ChannelState::Open {
                *guard = ChannelState::Closed;
                tracing::debug!(target = "relay", "socket closed by remote");
            }
        });

        let channel = Arc::new(SocketChannel {
            state,
            outbound: outbound_tx,
            tasks: Mutex::new(vec![writer, reader]),
        });
        Ok((channel, frame_rx))
    }

    fn abort_tasks(&self) {
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
        }
    }
}

/// Malformed frames are logged and dropped here; the reader keeps
/// running regardless of what the relay sends.
fn forward_frame(frame_tx: &mpsc::UnboundedSender<Frame>, text: &str) {
    match decode_frame(text) {
        Ok(frame) => {
            let _ = frame_tx.send(frame);
        }
        Err(err) => {
            tracing::warn!(target = "relay", error = %err, "dropping malformed frame");
        }
    }
}

#[async_trait]
impl FrameChannel for SocketChannel {
    fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    fn send(&self, frame: &Frame) -> SessionResult<()> {
        if self.state() != ChannelState::Open {
            return Err(SessionError::SendRejected);
        }
        let text = encode_frame(frame)?;
        self.outbound
            .send(text)
            .map_err(|_| SessionError::SendRejected)
    }

    async fn close(&self) {
        *self.state.lock() = ChannelState::Closed;
        self.abort_tasks();
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Factory used by managers in production; tests swap in
/// [`crate::testing::MockChannelFactory`].
pub struct SocketFactory {
    connect_timeout: Duration,
}

impl SocketFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl ChannelFactory for SocketFactory {
    async fn open(&self, url: &Url) -> SessionResult<(Arc<dyn FrameChannel>, FrameReceiver)> {
        let (channel, frames) = SocketChannel::open(url, self.connect_timeout).await?;
        Ok((channel as Arc<dyn FrameChannel>, frames))
    }
}
