use async_trait::async_trait;
use tracing::{info, warn};

use super::devices::{Device, DeviceKind, DeviceSnapshot};
use super::{audio, video, LocalTrack, MediaConstraints, MediaDevices, MediaStream, TrackSource};
use crate::error::MediaError;

/// Host devices: microphones and speakers through cpal, cameras through nokhwa.
///
/// Tracks are Opus/VP8 sample sinks bound to the selected endpoint; the
/// platform's capture pipeline writes encoded frames into them.
#[derive(Debug, Clone, Default)]
pub struct NativeMediaDevices;

impl NativeMediaDevices {
    pub fn new() -> Self {
        Self
    }

    async fn snapshot(&self) -> Result<DeviceSnapshot, MediaError> {
        Ok(DeviceSnapshot::classify(self.enumerate().await?))
    }

    fn select(
        snapshot: &DeviceSnapshot,
        kind: DeviceKind,
        requested: Option<&str>,
        what: &str,
    ) -> Result<Device, MediaError> {
        let found = match requested {
            Some(id) => snapshot.find(kind, id),
            None => snapshot.of_kind(kind).first(),
        };
        found.cloned().ok_or_else(|| {
            let wanted = requested.unwrap_or(what);
            warn!("Requested {} not available: {}", what, wanted);
            MediaError::DeviceUnavailable(wanted.to_string())
        })
    }
}

#[async_trait]
impl MediaDevices for NativeMediaDevices {
    async fn enumerate(&self) -> Result<Vec<Device>, MediaError> {
        tokio::task::spawn_blocking(|| {
            let mut devices = audio::list_devices();
            devices.extend(video::list_cameras());
            devices
        })
        .await
        .map_err(|e| MediaError::Capture(format!("device enumeration panicked: {}", e)))
    }

    async fn user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError> {
        let snapshot = self.snapshot().await?;
        let mic = Self::select(
            &snapshot,
            DeviceKind::AudioIn,
            constraints.audio_device_id.as_deref(),
            "microphone",
        )?;
        let camera = if constraints.video {
            Some(Self::select(
                &snapshot,
                DeviceKind::VideoIn,
                constraints.video_device_id.as_deref(),
                "camera",
            )?)
        } else {
            None
        };

        let stream_id = uuid::Uuid::new_v4().to_string();
        let mut tracks = vec![LocalTrack::new(
            TrackSource::Microphone,
            Some(mic.id),
            mic.label,
            &stream_id,
        )];
        if let Some(camera) = camera {
            info!("Binding VP8 track to camera {}", camera.label);
            tracks.push(LocalTrack::new(
                TrackSource::Camera,
                Some(camera.id),
                camera.label,
                &stream_id,
            ));
        }
        Ok(MediaStream::new(stream_id, tracks))
    }

    async fn display_media(&self) -> Result<MediaStream, MediaError> {
        let stream_id = uuid::Uuid::new_v4().to_string();
        let track = LocalTrack::new(TrackSource::Screen, None, "Primary display", &stream_id);
        info!("Screen capture track {} ready", track.id());
        Ok(MediaStream::new(stream_id, vec![track]))
    }
}
