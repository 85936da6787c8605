//! Call negotiation engine: offer/answer exchange and trickle ICE over
//! the user-scoped signaling socket. Candidates that arrive before
//! their precondition holds are queued, never dropped; the outbound
//! queue gates on knowing the remote peer, the inbound queue gates on
//! the remote description being applied.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_remote::TrackRemote;

use consult_proto::{Frame, FrameKind, IceCandidate, SdpKind, SessionDescription};

use crate::channel::{ChannelFactory, ChannelState, FrameChannel};
use crate::config::ClientConfig;
use crate::dispatch::FrameDispatcher;
use crate::error::{SessionError, SessionResult};
use crate::media::{LocalMedia, MediaSource};
use crate::rest::{default_stun_servers, IceServerConfig, IceServerSource};
use crate::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    AcquiringMedia,
    Negotiating,
    Connected,
    Closed,
    Failed,
}

/// Gate plus buffer for trickle ICE candidates. `offer` hands the
/// candidate back once the gate is open; `open` drains the buffer in
/// arrival order.
#[derive(Default)]
pub struct CandidateQueue {
    inner: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    ready: bool,
    pending: Vec<IceCandidate>,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the candidate when the gate is open, otherwise buffers it.
    pub fn offer(&self, candidate: IceCandidate) -> Option<IceCandidate> {
        let mut inner = self.inner.lock();
        if inner.ready {
            Some(candidate)
        } else {
            inner.pending.push(candidate);
            None
        }
    }

    /// Opens the gate and drains everything buffered so far, preserving
    /// arrival order.
    pub fn open(&self) -> Vec<IceCandidate> {
        let mut inner = self.inner.lock();
        inner.ready = true;
        std::mem::take(&mut inner.pending)
    }

    /// Closes the gate and discards the buffer. Applied between calls so
    /// candidates from a finished call never reach the next one.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.ready = false;
        inner.pending.clear();
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().ready
    }
}

struct CallShared {
    state: RwLock<CallState>,
    last_error: RwLock<Option<String>>,
    remote_peer: RwLock<Option<String>>,
    outbound: CandidateQueue,
    inbound: CandidateQueue,
    pc: Mutex<Option<Arc<RTCPeerConnection>>>,
    media: Mutex<Option<LocalMedia>>,
    remote_track: Mutex<Option<Arc<TrackRemote>>>,
}

impl CallShared {
    fn new() -> Self {
        Self {
            state: RwLock::new(CallState::Idle),
            last_error: RwLock::new(None),
            remote_peer: RwLock::new(None),
            outbound: CandidateQueue::new(),
            inbound: CandidateQueue::new(),
            pc: Mutex::new(None),
            media: Mutex::new(None),
            remote_track: Mutex::new(None),
        }
    }

    fn state(&self) -> CallState {
        *self.state.read()
    }

    fn set_state(&self, next: CallState) {
        *self.state.write() = next;
    }

    fn remote_peer(&self) -> Option<String> {
        self.remote_peer.read().clone()
    }

    /// Records the counterpart and opens the outbound candidate gate;
    /// anything buffered before the peer was known comes back for
    /// immediate delivery.
    fn set_remote_peer(&self, peer: &str) -> Vec<IceCandidate> {
        *self.remote_peer.write() = Some(peer.to_string());
        self.outbound.open()
    }

    fn fail(&self, reason: &str) {
        tracing::warn!(target = "call", reason, "call failed");
        *self.last_error.write() = Some(reason.to_string());
        self.set_state(CallState::Failed);
    }

    /// Releases the peer connection, local media, candidate queues, and
    /// peer bookkeeping. A `Failed` state stays visible, anything else
    /// lands in `Closed`.
    async fn teardown(&self) {
        let pc = self.pc.lock().take();
        if let Some(pc) = pc {
            if let Err(err) = pc.close().await {
                tracing::debug!(target = "call", error = %err, "peer connection close failed");
            }
        }
        if let Some(media) = self.media.lock().take() {
            media.stop();
        }
        self.outbound.reset();
        self.inbound.reset();
        *self.remote_peer.write() = None;
        *self.remote_track.lock() = None;
        if self.state() != CallState::Failed {
            self.set_state(CallState::Closed);
        }
    }

    fn pc(&self) -> Option<Arc<RTCPeerConnection>> {
        self.pc.lock().clone()
    }
}

/// Negotiation engine for one user. `connect` opens the signaling
/// socket; afterwards the engine both places outgoing calls and
/// answers incoming ones. Clones share the same underlying session.
#[derive(Clone)]
pub struct CallEngine {
    inner: Arc<CallInner>,
}

impl CallEngine {
    pub fn new(
        identity: Identity,
        config: ClientConfig,
        factory: Arc<dyn ChannelFactory>,
        ice: Arc<dyn IceServerSource>,
        media_source: Arc<dyn MediaSource>,
    ) -> Self {
        Self {
            inner: Arc::new(CallInner {
                identity,
                config,
                factory,
                ice,
                media_source,
                shared: Arc::new(CallShared::new()),
                channel: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Opens the user-scoped signaling socket and starts reacting to
    /// inbound call frames.
    pub async fn connect(&self) -> SessionResult<()> {
        let inner = &self.inner;
        // Reconnecting retires the previous socket and its pumps first.
        let previous = inner.channel.lock().take();
        if let Some(previous) = previous {
            previous.close().await;
        }
        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }
        let url = inner.config.signaling_socket_url(&inner.identity.user_id);
        let (channel, frames) = inner.factory.open(&url).await?;

        let dispatcher = Arc::new(FrameDispatcher::new());
        let mut inbound = dispatcher.subscribe(&[
            FrameKind::CallInitiate,
            FrameKind::CallAnswer,
            FrameKind::IceCandidate,
            FrameKind::CallEnd,
        ]);
        let feed = dispatcher.run(frames);

        let engine = Arc::clone(inner);
        let pump = tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                engine.handle_signal(frame).await;
            }
        });

        *inner.channel.lock() = Some(channel);
        let mut tasks = inner.tasks.lock();
        tasks.push(feed);
        tasks.push(pump);
        Ok(())
    }

    /// Places a call: acquires media, builds the peer connection, and
    /// pushes the offer to `target_id` with bounded retries.
    pub async fn initiate(&self, target_id: &str, consultation_id: i64) -> SessionResult<()> {
        self.inner.initiate(target_id, consultation_id).await
    }

    /// Hangs up: tells the counterpart on a best-effort basis, then
    /// tears local state down. Safe to call repeatedly.
    pub async fn end_call(&self) {
        self.inner.end_call().await
    }

    /// Closes the signaling socket and any in-flight call.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await
    }

    pub fn state(&self) -> CallState {
        self.inner.shared.state()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.shared.last_error.read().clone()
    }

    pub fn remote_peer(&self) -> Option<String> {
        self.inner.shared.remote_peer()
    }

    pub fn remote_track(&self) -> Option<Arc<TrackRemote>> {
        self.inner.shared.remote_track.lock().clone()
    }

    pub fn toggle_audio(&self) -> Option<bool> {
        self.inner
            .shared
            .media
            .lock()
            .as_ref()
            .map(LocalMedia::toggle_audio)
    }

    pub fn toggle_video(&self) -> Option<bool> {
        self.inner
            .shared
            .media
            .lock()
            .as_ref()
            .map(LocalMedia::toggle_video)
    }
}

struct CallInner {
    identity: Identity,
    config: ClientConfig,
    factory: Arc<dyn ChannelFactory>,
    ice: Arc<dyn IceServerSource>,
    media_source: Arc<dyn MediaSource>,
    shared: Arc<CallShared>,
    channel: Mutex<Option<Arc<dyn FrameChannel>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CallInner {
    async fn initiate(&self, target_id: &str, consultation_id: i64) -> SessionResult<()> {
        if matches!(
            self.shared.state(),
            CallState::AcquiringMedia | CallState::Negotiating | CallState::Connected
        ) {
            return Err(SessionError::Negotiation(
                "call already in progress".to_string(),
            ));
        }
        let channel = self.signaling_channel()?;

        self.reset_call_state();
        for candidate in self.shared.set_remote_peer(target_id) {
            send_candidate(&self.shared, &channel, &self.identity.user_id, candidate);
        }

        match self.start_call(&channel, target_id, consultation_id).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if self.shared.state() != CallState::Failed {
                    self.shared.fail(&format!("call setup failed: {err}"));
                }
                self.shared.teardown().await;
                Err(err)
            }
        }
    }

    async fn start_call(
        &self,
        channel: &Arc<dyn FrameChannel>,
        target_id: &str,
        consultation_id: i64,
    ) -> SessionResult<()> {
        let media = self.acquire_media().await?;
        let pc = self.build_peer_connection(channel, &media).await?;
        *self.shared.media.lock() = Some(media);
        *self.shared.pc.lock() = Some(Arc::clone(&pc));
        self.shared.set_state(CallState::Negotiating);

        let offer = pc.create_offer(None).await.map_err(to_negotiation)?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(to_negotiation)?;

        let frame = Frame::CallInitiate {
            offer: SessionDescription {
                kind: SdpKind::Offer,
                sdp: offer.sdp,
            },
            sender_id: self.identity.user_id.clone(),
            target_id: target_id.to_string(),
            consultation_id,
        };
        self.send_offer_with_retry(channel, &frame).await
    }

    async fn end_call(&self) {
        let peer = self.shared.remote_peer();
        if self.shared.pc().is_none() && peer.is_none() {
            return;
        }
        if let (Some(target_id), Ok(channel)) = (peer, self.signaling_channel()) {
            let frame = Frame::CallEnd {
                sender_id: self.identity.user_id.clone(),
                sender: self.identity.role,
                target_id,
            };
            if let Err(err) = channel.send(&frame) {
                tracing::debug!(target = "call", error = %err, "call-end delivery failed");
            }
        }
        self.teardown().await;
    }

    async fn disconnect(&self) {
        self.teardown().await;
        let channel = self.channel.lock().take();
        if let Some(channel) = channel {
            channel.close().await;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    async fn handle_signal(&self, frame: Frame) {
        match frame {
            Frame::CallInitiate {
                offer,
                sender_id,
                target_id,
                consultation_id: _,
            } => {
                if target_id != self.identity.user_id {
                    tracing::debug!(target = "call", target_id = %target_id, "offer addressed elsewhere");
                    return;
                }
                if matches!(
                    self.shared.state(),
                    CallState::AcquiringMedia | CallState::Negotiating | CallState::Connected
                ) {
                    tracing::warn!(target = "call", sender_id = %sender_id, "busy, ignoring incoming offer");
                    return;
                }
                if let Err(err) = self.answer_call(&sender_id, offer).await {
                    if self.shared.state() != CallState::Failed {
                        self.shared.fail(&format!("answering call failed: {err}"));
                    }
                    self.shared.teardown().await;
                }
            }
            Frame::CallAnswer { answer, sender_id, .. } => {
                if self.shared.remote_peer().as_deref() != Some(sender_id.as_str()) {
                    tracing::debug!(target = "call", sender_id = %sender_id, "answer from unexpected peer");
                    return;
                }
                if let Err(err) = self.apply_remote_description(answer).await {
                    self.shared.fail(&format!("applying answer failed: {err}"));
                    self.shared.teardown().await;
                }
            }
            Frame::IceCandidate { candidate, .. } => {
                if let Some(candidate) = self.shared.inbound.offer(candidate) {
                    self.apply_candidate(candidate).await;
                }
            }
            Frame::CallEnd { sender_id, .. } => {
                tracing::info!(target = "call", sender_id = %sender_id, "counterpart ended the call");
                self.teardown().await;
            }
            other => {
                tracing::trace!(
                    target = "call",
                    kind = other.kind().as_str(),
                    "ignoring frame outside the signaling scope"
                );
            }
        }
    }

    async fn answer_call(&self, caller_id: &str, offer: SessionDescription) -> SessionResult<()> {
        let channel = self.signaling_channel()?;

        self.reset_call_state();
        for candidate in self.shared.set_remote_peer(caller_id) {
            send_candidate(&self.shared, &channel, &self.identity.user_id, candidate);
        }

        let media = self.acquire_media().await?;
        let pc = self.build_peer_connection(&channel, &media).await?;
        *self.shared.media.lock() = Some(media);
        *self.shared.pc.lock() = Some(Arc::clone(&pc));
        self.shared.set_state(CallState::Negotiating);

        self.apply_remote_description(offer).await?;

        let answer = pc.create_answer(None).await.map_err(to_negotiation)?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(to_negotiation)?;

        let frame = Frame::CallAnswer {
            answer: SessionDescription {
                kind: SdpKind::Answer,
                sdp: answer.sdp,
            },
            sender_id: self.identity.user_id.clone(),
            target_id: caller_id.to_string(),
        };
        if channel.state() != ChannelState::Open {
            self.shared.fail("signaling socket closed before answer");
            return Err(SessionError::SendRejected);
        }
        channel.send(&frame)?;
        Ok(())
    }

    /// Applies the remote description, then opens the inbound candidate
    /// gate and replays everything that arrived early.
    async fn apply_remote_description(&self, description: SessionDescription) -> SessionResult<()> {
        let Some(pc) = self.shared.pc() else {
            return Err(SessionError::Negotiation(
                "no peer connection for remote description".to_string(),
            ));
        };
        let rtc = to_rtc_description(&description)?;
        pc.set_remote_description(rtc).await.map_err(to_negotiation)?;
        for candidate in self.shared.inbound.open() {
            self.apply_candidate(candidate).await;
        }
        Ok(())
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        let Some(pc) = self.shared.pc() else {
            tracing::debug!(target = "call", "candidate without peer connection, dropped");
            return;
        };
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        if let Err(err) = pc.add_ice_candidate(init).await {
            tracing::warn!(target = "call", error = %err, "adding ice candidate failed");
        }
    }

    async fn acquire_media(&self) -> SessionResult<LocalMedia> {
        self.shared.set_state(CallState::AcquiringMedia);
        match self.media_source.acquire().await {
            Ok(media) => Ok(media),
            Err(err) => {
                self.shared.fail(&format!("media acquisition failed: {err}"));
                Err(err)
            }
        }
    }

    async fn build_peer_connection(
        &self,
        channel: &Arc<dyn FrameChannel>,
        media: &LocalMedia,
    ) -> SessionResult<Arc<RTCPeerConnection>> {
        let ice_servers = self.resolve_ice_servers().await;

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(to_negotiation)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(to_negotiation)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(IceServerConfig::to_rtc).collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|err| SessionError::Negotiation(err.to_string()))?,
        );

        for track in media.tracks() {
            pc.add_track(track).await.map_err(to_negotiation)?;
        }

        let shared = Arc::clone(&self.shared);
        let send_channel = Arc::clone(channel);
        let local_user = self.identity.user_id.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let shared = Arc::clone(&shared);
            let send_channel = Arc::clone(&send_channel);
            let local_user = local_user.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(err) => {
                        tracing::warn!(target = "call", error = %err, "candidate serialization failed");
                        return;
                    }
                };
                let candidate = IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                };
                if let Some(candidate) = shared.outbound.offer(candidate) {
                    send_candidate(&shared, &send_channel, &local_user, candidate);
                }
            })
        }));

        let shared = Arc::clone(&self.shared);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let shared = Arc::clone(&shared);
            Box::pin(async move {
                tracing::info!(target = "call", kind = %track.kind(), "remote track arrived");
                *shared.remote_track.lock() = Some(track);
                shared.set_state(CallState::Connected);
            })
        }));

        let shared = Arc::clone(&self.shared);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let shared = Arc::clone(&shared);
            Box::pin(async move {
                tracing::debug!(target = "call", state = %state, "peer connection state");
                match state {
                    RTCPeerConnectionState::Connected => shared.set_state(CallState::Connected),
                    RTCPeerConnectionState::Failed => {
                        shared.fail("peer connection failed");
                        let shared = Arc::clone(&shared);
                        tokio::spawn(async move { shared.teardown().await });
                    }
                    RTCPeerConnectionState::Closed => {
                        if shared.state() != CallState::Failed {
                            shared.set_state(CallState::Closed);
                        }
                    }
                    _ => {}
                }
            })
        }));

        Ok(pc)
    }

    async fn resolve_ice_servers(&self) -> Vec<IceServerConfig> {
        match self.ice.ice_servers().await {
            Ok(servers) if !servers.is_empty() => servers,
            Ok(_) => {
                tracing::warn!(target = "call", "empty ice server list, using stun fallback");
                default_stun_servers()
            }
            Err(err) => {
                tracing::warn!(target = "call", error = %err, "ice server fetch failed, using stun fallback");
                default_stun_servers()
            }
        }
    }

    async fn send_offer_with_retry(
        &self,
        channel: &Arc<dyn FrameChannel>,
        frame: &Frame,
    ) -> SessionResult<()> {
        let attempts = self.config.offer_send_attempts;
        for attempt in 1..=attempts {
            if channel.state() == ChannelState::Open && channel.send(frame).is_ok() {
                return Ok(());
            }
            tracing::warn!(target = "call", attempt, "offer delivery attempt failed");
            if attempt < attempts {
                tokio::time::sleep(self.config.offer_backoff_step * attempt).await;
            }
        }
        self.shared
            .fail(&format!("offer not delivered after {attempts} attempts"));
        Err(SessionError::Negotiation(format!(
            "offer not delivered after {attempts} attempts"
        )))
    }

    fn signaling_channel(&self) -> SessionResult<Arc<dyn FrameChannel>> {
        self.channel
            .lock()
            .clone()
            .ok_or_else(|| SessionError::Connection("signaling socket not connected".to_string()))
    }

    fn reset_call_state(&self) {
        self.shared.outbound.reset();
        self.shared.inbound.reset();
        *self.shared.remote_peer.write() = None;
        *self.shared.remote_track.lock() = None;
        *self.shared.last_error.write() = None;
    }

    async fn teardown(&self) {
        self.shared.teardown().await;
    }
}

impl Drop for CallInner {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

fn send_candidate(
    shared: &CallShared,
    channel: &Arc<dyn FrameChannel>,
    local_user: &str,
    candidate: IceCandidate,
) {
    let Some(target_id) = shared.remote_peer() else {
        tracing::debug!(target = "call", "candidate without remote peer, dropped");
        return;
    };
    let frame = Frame::IceCandidate {
        candidate,
        sender_id: local_user.to_string(),
        target_id,
    };
    if let Err(err) = channel.send(&frame) {
        tracing::warn!(target = "call", error = %err, "candidate delivery failed");
    }
}

fn to_rtc_description(description: &SessionDescription) -> SessionResult<RTCSessionDescription> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp.clone()),
    }
    .map_err(to_negotiation)
}

fn to_negotiation(err: webrtc::Error) -> SessionError {
    SessionError::Negotiation(err.to_string())
}
