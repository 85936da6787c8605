//! In-memory doubles for the session managers: scripted channels, canned
//! history and ICE responses, and media sources that grant or deny
//! capture. Compiled into the crate so downstream consumers can drive
//! their own tests without a relay.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use consult_proto::{ChatMessage, Frame};

use crate::channel::{ChannelFactory, ChannelState, FrameChannel, FrameReceiver};
use crate::error::{SessionError, SessionResult};
use crate::media::{LocalMedia, MediaSource};
use crate::rest::{ChatHistory, IceServerConfig, IceServerSource};

/// Channel double that records sends and can be told to reject them.
pub struct MockChannel {
    label: String,
    state: Mutex<ChannelState>,
    sent: Mutex<Vec<Frame>>,
    rejected: Mutex<Vec<Frame>>,
    send_attempts: AtomicUsize,
    reject_sends: AtomicBool,
    close_count: AtomicUsize,
    log: Arc<Mutex<Vec<String>>>,
}

impl MockChannel {
    pub fn new(label: impl Into<String>, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            label: label.into(),
            state: Mutex::new(ChannelState::Open),
            sent: Mutex::new(Vec::new()),
            rejected: Mutex::new(Vec::new()),
            send_attempts: AtomicUsize::new(0),
            reject_sends: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
            log,
        }
    }

    pub fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
    }

    /// Frames accepted so far; rejected sends are not recorded here.
    pub fn sent(&self) -> Vec<Frame> {
        self.sent.lock().clone()
    }

    /// Frames the channel turned away.
    pub fn rejected(&self) -> Vec<Frame> {
        self.rejected.lock().clone()
    }

    /// Total send calls, accepted or rejected.
    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    pub fn reject_sends(&self, reject: bool) {
        self.reject_sends.store(reject, Ordering::SeqCst);
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameChannel for MockChannel {
    fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    fn send(&self, frame: &Frame) -> SessionResult<()> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        if self.reject_sends.load(Ordering::SeqCst) || self.state() != ChannelState::Open {
            self.rejected.lock().push(frame.clone());
            return Err(SessionError::SendRejected);
        }
        self.sent.lock().push(frame.clone());
        Ok(())
    }

    async fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if *state != ChannelState::Closed {
            *state = ChannelState::Closed;
            self.log.lock().push(format!("close {}", self.label));
        }
    }
}

/// Factory double handing out pre-scripted channels in push order. Every
/// open and close lands in a shared event log, so tests can assert the
/// teardown-before-reconnect ordering.
#[derive(Default)]
pub struct MockChannelFactory {
    log: Arc<Mutex<Vec<String>>>,
    queue: Mutex<VecDeque<ScriptedChannel>>,
}

struct ScriptedChannel {
    channel: Arc<MockChannel>,
    frames: FrameReceiver,
    delay: Option<Duration>,
}

impl MockChannelFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the next channel `open` will return. The returned sender
    /// injects inbound frames as if the relay had pushed them.
    pub fn push_channel(
        &self,
        label: impl Into<String>,
    ) -> (Arc<MockChannel>, mpsc::UnboundedSender<Frame>) {
        self.push_scripted(label, None)
    }

    /// Like `push_channel`, but `open` holds the connect in flight for
    /// `delay` before handing the channel back.
    pub fn push_channel_delayed(
        &self,
        label: impl Into<String>,
        delay: Duration,
    ) -> (Arc<MockChannel>, mpsc::UnboundedSender<Frame>) {
        self.push_scripted(label, Some(delay))
    }

    fn push_scripted(
        &self,
        label: impl Into<String>,
        delay: Option<Duration>,
    ) -> (Arc<MockChannel>, mpsc::UnboundedSender<Frame>) {
        let channel = Arc::new(MockChannel::new(label, Arc::clone(&self.log)));
        let (tx, rx) = mpsc::unbounded_channel();
        self.queue.lock().push_back(ScriptedChannel {
            channel: Arc::clone(&channel),
            frames: rx,
            delay,
        });
        (channel, tx)
    }

    pub fn events(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl ChannelFactory for MockChannelFactory {
    async fn open(&self, url: &url::Url) -> SessionResult<(Arc<dyn FrameChannel>, FrameReceiver)> {
        let scripted = self.queue.lock().pop_front();
        let Some(ScriptedChannel {
            channel,
            frames,
            delay,
        }) = scripted
        else {
            return Err(SessionError::Connection(format!(
                "no scripted channel for {}",
                url.path()
            )));
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.log.lock().push(format!("open {}", url.path()));
        Ok((channel, frames))
    }
}

/// History double returning a fixed message list, optionally after a
/// delay to let live frames race the fetch.
pub struct StaticHistory {
    messages: Vec<ChatMessage>,
    delay: Option<Duration>,
}

impl StaticHistory {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl ChatHistory for StaticHistory {
    async fn chat_messages(&self, _consultation_id: i64) -> SessionResult<Vec<ChatMessage>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.messages.clone())
    }
}

pub struct FailingHistory;

#[async_trait]
impl ChatHistory for FailingHistory {
    async fn chat_messages(&self, _consultation_id: i64) -> SessionResult<Vec<ChatMessage>> {
        Err(SessionError::Http("history endpoint unavailable".to_string()))
    }
}

pub struct StaticIceServers(pub Vec<IceServerConfig>);

#[async_trait]
impl IceServerSource for StaticIceServers {
    async fn ice_servers(&self) -> SessionResult<Vec<IceServerConfig>> {
        Ok(self.0.clone())
    }
}

pub struct FailingIceServers;

#[async_trait]
impl IceServerSource for FailingIceServers {
    async fn ice_servers(&self) -> SessionResult<Vec<IceServerConfig>> {
        Err(SessionError::Http("turn-credentials unavailable".to_string()))
    }
}

/// Media source granting capture with inert tracks and no feeder tasks.
pub struct StubMedia;

#[async_trait]
impl MediaSource for StubMedia {
    async fn acquire(&self) -> SessionResult<LocalMedia> {
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                ..Default::default()
            },
            "audio".to_string(),
            "stub-media".to_string(),
        ));
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                ..Default::default()
            },
            "video".to_string(),
            "stub-media".to_string(),
        ));
        Ok(LocalMedia::new(
            audio,
            video,
            Arc::new(AtomicBool::new(true)),
            Arc::new(AtomicBool::new(true)),
            Vec::new(),
        ))
    }
}

/// Media source that denies capture, as a browser does when the user
/// refuses the permission prompt.
pub struct DeniedMedia;

#[async_trait]
impl MediaSource for DeniedMedia {
    async fn acquire(&self) -> SessionResult<LocalMedia> {
        Err(SessionError::MediaUnavailable(
            "capture permission denied".to_string(),
        ))
    }
}
