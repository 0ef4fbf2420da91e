pub mod audio;
pub mod devices;
pub mod native;
pub mod peer;
pub mod synthetic;
pub mod tracks;
pub mod video;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::error::MediaError;

pub use devices::{Device, DeviceInventory, DeviceKind, DeviceSnapshot};
pub use tracks::MediaTrackManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

impl TrackSource {
    pub fn kind(self) -> TrackKind {
        match self {
            TrackSource::Microphone => TrackKind::Audio,
            TrackSource::Camera | TrackSource::Screen => TrackKind::Video,
        }
    }
}

/// Lifecycle of a local track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    /// The source went away on its own (e.g. the user stopped sharing from system UI).
    Ended,
    /// Stopped by us.
    Stopped,
}

/// One outgoing audio or video track.
///
/// Clones share state: muting or stopping through any clone is visible through
/// all of them and through the peer connection the sink is bound to.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<LocalTrackInner>,
}

struct LocalTrackInner {
    id: String,
    source: TrackSource,
    device_id: Option<String>,
    label: String,
    enabled: AtomicBool,
    state: watch::Sender<TrackState>,
    sink: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(
        source: TrackSource,
        device_id: Option<String>,
        label: impl Into<String>,
        stream_id: &str,
    ) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let sink = match source.kind() {
            TrackKind::Audio => audio::opus_sink(&id, stream_id),
            TrackKind::Video => video::vp8_sink(&id, stream_id),
        };
        let (state, _) = watch::channel(TrackState::Live);
        Self {
            inner: Arc::new(LocalTrackInner {
                id,
                source,
                device_id,
                label: label.into(),
                enabled: AtomicBool::new(true),
                state,
                sink,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.source.kind()
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn device_id(&self) -> Option<&str> {
        self.inner.device_id.as_deref()
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn state(&self) -> TrackState {
        *self.inner.state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.state() == TrackState::Live
    }

    /// Sample sink the capture pipeline writes into and the peer connection reads from.
    pub fn sink(&self) -> Arc<TrackLocalStaticSample> {
        self.inner.sink.clone()
    }

    pub fn stop(&self) {
        self.transition(TrackState::Stopped);
    }

    /// Called by the platform when the source ends without our involvement.
    pub fn end(&self) {
        self.transition(TrackState::Ended);
    }

    fn transition(&self, to: TrackState) {
        self.inner.state.send_if_modified(|state| {
            if *state == TrackState::Live {
                *state = to;
                true
            } else {
                false
            }
        });
    }

    /// Resolves once the track leaves `Live`: `true` if the source ended by
    /// itself, `false` if it was stopped locally.
    pub async fn ended(&self) -> bool {
        let mut rx = self.inner.state.subscribe();
        loop {
            match *rx.borrow_and_update() {
                TrackState::Live => {}
                TrackState::Ended => return true,
                TrackState::Stopped => return false,
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("source", &self.inner.source)
            .field("device_id", &self.inner.device_id)
            .field("enabled", &self.is_enabled())
            .field("state", &self.state())
            .finish()
    }
}

/// A set of local tracks acquired together.
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self { id: id.into(), tracks }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_track(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// One incoming track announced by the peer connection.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    pub handle: Option<Arc<TrackRemote>>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Tracks received from the other party, grouped under the first stream seen.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn add(&mut self, track: RemoteTrack) {
        if !self.tracks.iter().any(|t| t.id == track.id) {
            self.tracks.push(track);
        }
    }
}

/// What to ask the platform for. Audio is always requested.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio_device_id: Option<String>,
    pub video_device_id: Option<String>,
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self::default()
    }

    pub fn with_video(video: bool) -> Self {
        Self { video, ..Self::default() }
    }
}

/// Capture and enumeration services of the host platform.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn enumerate(&self) -> Result<Vec<Device>, MediaError>;

    /// Microphone, plus camera when `constraints.video` is set.
    async fn user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError>;

    async fn display_media(&self) -> Result<MediaStream, MediaError>;
}
