//! Local capture side of a session: one audio and one video track, shared
//! by every peer connection. Muting flips a flag on the shared track, so it
//! takes effect for all peers at once and never needs renegotiation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::{Error, Result};

const LOCAL_STREAM_ID: &str = "mesh-local";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Handle to one captured track. Clones share the same track and flag.
#[derive(Clone)]
pub struct LocalTrack {
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            kind,
            track,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Opus or VP8 sample track, depending on `kind`.
    pub fn with_default_codec(kind: MediaKind) -> Self {
        let (mime_type, track_id) = match kind {
            MediaKind::Audio => (MIME_TYPE_OPUS, "audio"),
            MediaKind::Video => (MIME_TYPE_VP8, "video"),
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track_id.to_owned(),
            LOCAL_STREAM_ID.to_owned(),
        ));
        Self::new(kind, track)
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// True when both handles refer to the same underlying track.
    pub fn same_track(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.track, &other.track)
    }

    /// Feeds one encoded sample to every peer. Dropped while disabled.
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.track.write_sample(sample).await?;
        Ok(())
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Which devices a session asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaRequest {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaRequest {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Camera and microphone access.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, request: MediaRequest) -> Result<LocalMediaSource>;
}

/// Exposes encoded-sample tracks that the embedding application feeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct SampleTrackDevices;

#[async_trait]
impl MediaDevices for SampleTrackDevices {
    async fn acquire(&self, request: MediaRequest) -> Result<LocalMediaSource> {
        let audio = request
            .audio
            .then(|| LocalTrack::with_default_codec(MediaKind::Audio));
        let video = request
            .video
            .then(|| LocalTrack::with_default_codec(MediaKind::Video));
        Ok(LocalMediaSource::new(audio, video))
    }
}

/// No capture hardware at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDevices;

#[async_trait]
impl MediaDevices for NoDevices {
    async fn acquire(&self, _request: MediaRequest) -> Result<LocalMediaSource> {
        Err(Error::MediaAcquisition(
            "no camera or microphone available".to_string(),
        ))
    }
}

/// The session's single set of local tracks.
#[derive(Debug, Default)]
pub struct LocalMediaSource {
    audio: Option<LocalTrack>,
    video: Option<LocalTrack>,
    released: bool,
}

impl LocalMediaSource {
    pub fn new(audio: Option<LocalTrack>, video: Option<LocalTrack>) -> Self {
        Self {
            audio,
            video,
            released: false,
        }
    }

    /// Empty source used when capture failed; the session is receive-only.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Acquires from `devices`, degrading to an empty source on failure.
    pub async fn acquire_or_empty(devices: &dyn MediaDevices, request: MediaRequest) -> Self {
        match devices.acquire(request).await {
            Ok(source) => {
                info!(
                    "Local media acquired (audio: {}, video: {})",
                    source.audio.is_some(),
                    source.video.is_some()
                );
                source
            }
            Err(e) => {
                warn!("{}; continuing receive-only", e);
                Self::empty()
            }
        }
    }

    pub fn audio(&self) -> Option<&LocalTrack> {
        self.audio.as_ref()
    }

    pub fn video(&self) -> Option<&LocalTrack> {
        self.video.as_ref()
    }

    /// Shared handles to attach to a new peer connection.
    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.audio.iter().chain(self.video.iter()).cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Returns the resulting flag; `false` when there is no audio track.
    pub fn set_audio_enabled(&self, enabled: bool) -> bool {
        Self::set_track_enabled(self.audio.as_ref(), enabled)
    }

    pub fn set_video_enabled(&self, enabled: bool) -> bool {
        Self::set_track_enabled(self.video.as_ref(), enabled)
    }

    pub fn toggle_audio(&self) -> bool {
        let current = self.audio.as_ref().map_or(false, LocalTrack::is_enabled);
        self.set_audio_enabled(!current)
    }

    pub fn toggle_video(&self) -> bool {
        let current = self.video.as_ref().map_or(false, LocalTrack::is_enabled);
        self.set_video_enabled(!current)
    }

    fn set_track_enabled(track: Option<&LocalTrack>, enabled: bool) -> bool {
        match track {
            Some(track) => {
                track.set_enabled(enabled);
                debug!("Local {:?} track enabled: {}", track.kind(), enabled);
                enabled
            }
            None => false,
        }
    }

    /// Stops capture. Safe to call repeatedly.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        for track in self.audio.iter().chain(self.video.iter()) {
            track.set_enabled(false);
        }
        self.audio = None;
        self.video = None;
        self.released = true;
        info!("Local media released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_devices_degrade_to_receive_only() {
        let source = LocalMediaSource::acquire_or_empty(&NoDevices, MediaRequest::default()).await;
        assert!(source.is_empty());
        assert!(source.tracks().is_empty());
        assert!(!source.toggle_audio());
    }

    #[tokio::test]
    async fn mute_is_shared_by_every_clone() {
        let source =
            LocalMediaSource::acquire_or_empty(&SampleTrackDevices, MediaRequest::default()).await;
        let attached = source.tracks();
        assert_eq!(attached.len(), 2);

        assert!(!source.set_audio_enabled(false));
        let audio = attached
            .iter()
            .find(|t| t.kind() == MediaKind::Audio)
            .unwrap();
        assert!(!audio.is_enabled());
        assert!(audio.same_track(source.audio().unwrap()));

        let video = attached
            .iter()
            .find(|t| t.kind() == MediaKind::Video)
            .unwrap();
        assert!(video.is_enabled());
        assert!(!source.toggle_video());
        assert!(!video.is_enabled());
    }

    #[tokio::test]
    async fn audio_only_request() {
        let source = SampleTrackDevices
            .acquire(MediaRequest {
                audio: true,
                video: false,
            })
            .await
            .unwrap();
        assert!(source.audio().is_some());
        assert!(source.video().is_none());
        assert!(!source.set_video_enabled(true));
    }

    #[test]
    fn release_is_idempotent() {
        let mut source = LocalMediaSource::new(
            Some(LocalTrack::with_default_codec(MediaKind::Audio)),
            None,
        );
        let held = source.tracks();
        source.release();
        source.release();
        assert!(source.is_released());
        assert!(source.is_empty());
        assert!(!held[0].is_enabled());
    }
}
