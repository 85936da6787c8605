//! Local media capture behind a trait. The production source for a
//! headless client feeds placeholder samples; tests plug in stubs that
//! grant or deny capture without touching any device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::SessionResult;

/// Capture device seam. Denied capture surfaces as
/// [`crate::error::SessionError::MediaUnavailable`].
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> SessionResult<LocalMedia>;
}

/// Acquired local tracks plus their mute flags. Dropping or stopping
/// the bundle halts the feeder tasks.
pub struct LocalMedia {
    pub audio: Arc<TrackLocalStaticSample>,
    pub video: Arc<TrackLocalStaticSample>,
    audio_enabled: Arc<AtomicBool>,
    video_enabled: Arc<AtomicBool>,
    feeders: Vec<JoinHandle<()>>,
}

impl LocalMedia {
    pub fn new(
        audio: Arc<TrackLocalStaticSample>,
        video: Arc<TrackLocalStaticSample>,
        audio_enabled: Arc<AtomicBool>,
        video_enabled: Arc<AtomicBool>,
        feeders: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            audio,
            video,
            audio_enabled,
            video_enabled,
            feeders,
        }
    }

    pub fn tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        vec![
            Arc::clone(&self.audio) as Arc<dyn TrackLocal + Send + Sync>,
            Arc::clone(&self.video) as Arc<dyn TrackLocal + Send + Sync>,
        ]
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::SeqCst)
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::SeqCst)
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn toggle_audio(&self) -> bool {
        !self.audio_enabled.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn toggle_video(&self) -> bool {
        !self.video_enabled.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn stop(&self) {
        for feeder in &self.feeders {
            feeder.abort();
        }
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Synthetic capture source: an Opus silence track and a blank VP8
/// track, each driven by a timer task. Keeps the peer connection's
/// media pipeline live without real devices.
pub struct PlaceholderMedia;

const AUDIO_FRAME_INTERVAL: Duration = Duration::from_millis(20);
const VIDEO_FRAME_INTERVAL: Duration = Duration::from_millis(33);

// Opus DTX silence frame.
const SILENCE_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

#[async_trait]
impl MediaSource for PlaceholderMedia {
    async fn acquire(&self) -> SessionResult<LocalMedia> {
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                ..Default::default()
            },
            "audio".to_string(),
            "consult-media".to_string(),
        ));
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                ..Default::default()
            },
            "video".to_string(),
            "consult-media".to_string(),
        ));

        let audio_enabled = Arc::new(AtomicBool::new(true));
        let video_enabled = Arc::new(AtomicBool::new(true));

        let audio_feeder = spawn_feeder(
            Arc::clone(&audio),
            Arc::clone(&audio_enabled),
            AUDIO_FRAME_INTERVAL,
            Bytes::from_static(&SILENCE_FRAME),
        );
        let video_feeder = spawn_feeder(
            Arc::clone(&video),
            Arc::clone(&video_enabled),
            VIDEO_FRAME_INTERVAL,
            Bytes::from_static(&[0u8; 16]),
        );

        Ok(LocalMedia::new(
            audio,
            video,
            audio_enabled,
            video_enabled,
            vec![audio_feeder, video_feeder],
        ))
    }
}

fn spawn_feeder(
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    interval: Duration,
    payload: Bytes,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if !enabled.load(Ordering::SeqCst) {
                continue;
            }
            let sample = Sample {
                data: payload.clone(),
                duration: interval,
                ..Default::default()
            };
            if track.write_sample(&sample).await.is_err() {
                // No bound RTP sender yet; keep ticking until one binds.
                continue;
            }
        }
    })
}
