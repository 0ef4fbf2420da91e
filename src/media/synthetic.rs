use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use super::audio::spawn_silence_pump;
use super::devices::{Device, DeviceKind, DeviceSnapshot};
use super::{LocalTrack, MediaConstraints, MediaDevices, MediaStream, TrackSource};
use crate::error::MediaError;

/// Headless media platform with a configurable device set.
///
/// Used for loopback runs and tests: tracks are real sample sinks, but nothing
/// is captured. With the silence pump enabled, microphone tracks carry silent
/// Opus frames so a connected peer sees RTP flow.
pub struct SyntheticMediaDevices {
    state: Mutex<SyntheticState>,
}

struct SyntheticState {
    devices: Vec<Device>,
    permission_granted: bool,
    display_available: bool,
    silence_pump: bool,
    issued: Vec<LocalTrack>,
}

impl Default for SyntheticMediaDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticMediaDevices {
    /// One microphone, one speaker, one camera.
    pub fn new() -> Self {
        Self::with_devices(vec![
            Device::new(DeviceKind::AudioIn, "mic-0", "Synthetic Microphone"),
            Device::new(DeviceKind::AudioOut, "spk-0", "Synthetic Speakers"),
            Device::new(DeviceKind::VideoIn, "cam-0", "Synthetic Camera"),
        ])
    }

    pub fn with_devices(devices: Vec<Device>) -> Self {
        Self {
            state: Mutex::new(SyntheticState {
                devices,
                permission_granted: true,
                display_available: true,
                silence_pump: false,
                issued: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SyntheticState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_devices(&self, devices: Vec<Device>) {
        self.lock().devices = devices;
    }

    pub fn set_permission_granted(&self, granted: bool) {
        self.lock().permission_granted = granted;
    }

    pub fn set_display_available(&self, available: bool) {
        self.lock().display_available = available;
    }

    pub fn set_silence_pump(&self, enabled: bool) {
        self.lock().silence_pump = enabled;
    }

    /// Every track handed out so far, in issue order.
    pub fn issued_tracks(&self) -> Vec<LocalTrack> {
        self.lock().issued.clone()
    }

    fn pick(
        snapshot: &DeviceSnapshot,
        kind: DeviceKind,
        requested: Option<&str>,
    ) -> Result<Device, MediaError> {
        match requested {
            Some(id) => snapshot
                .find(kind, id)
                .cloned()
                .ok_or_else(|| MediaError::DeviceUnavailable(id.to_string())),
            None => snapshot
                .of_kind(kind)
                .first()
                .cloned()
                .ok_or_else(|| MediaError::DeviceUnavailable(format!("no {:?} device", kind))),
        }
    }
}

#[async_trait]
impl MediaDevices for SyntheticMediaDevices {
    async fn enumerate(&self) -> Result<Vec<Device>, MediaError> {
        Ok(self.lock().devices.clone())
    }

    async fn user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError> {
        let mut state = self.lock();
        if !state.permission_granted {
            return Err(MediaError::PermissionDenied("microphone".into()));
        }
        let snapshot = DeviceSnapshot::classify(state.devices.clone());
        let mic = Self::pick(&snapshot, DeviceKind::AudioIn, constraints.audio_device_id.as_deref())?;
        let camera = if constraints.video {
            Some(Self::pick(&snapshot, DeviceKind::VideoIn, constraints.video_device_id.as_deref())?)
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
            tracks.push(LocalTrack::new(
                TrackSource::Camera,
                Some(camera.id),
                camera.label,
                &stream_id,
            ));
        }
        if state.silence_pump {
            spawn_silence_pump(tracks[0].clone());
        }
        state.issued.extend(tracks.iter().cloned());
        debug!("Issued synthetic user media stream {} ({} tracks)", stream_id, tracks.len());
        Ok(MediaStream::new(stream_id, tracks))
    }

    async fn display_media(&self) -> Result<MediaStream, MediaError> {
        let mut state = self.lock();
        if !state.display_available {
            return Err(MediaError::PermissionDenied("display capture".into()));
        }
        let stream_id = uuid::Uuid::new_v4().to_string();
        let track = LocalTrack::new(TrackSource::Screen, None, "Synthetic Screen", &stream_id);
        state.issued.push(track.clone());
        Ok(MediaStream::new(stream_id, vec![track]))
    }
}
