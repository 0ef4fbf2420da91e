use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::peer::PeerConnection;
use super::{MediaConstraints, MediaDevices, MediaStream};
use crate::error::{CallError, MediaError};

/// Owns the outgoing tracks of the current call.
///
/// The camera stream and the screen stream are held separately so that
/// ending a screen share can put the camera track back on the sender
/// without acquiring it again.
pub struct MediaTrackManager {
    devices: Arc<dyn MediaDevices>,
    local: Option<MediaStream>,
    screen: Option<MediaStream>,
    muted: bool,
    end_hook: Option<JoinHandle<()>>,
}

impl MediaTrackManager {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            local: None,
            screen: None,
            muted: false,
            end_hook: None,
        }
    }

    pub fn devices(&self) -> Arc<dyn MediaDevices> {
        self.devices.clone()
    }

    /// Microphone plus optional camera, honoring explicit device selection.
    /// Replaces (and stops) any previously held local stream.
    pub async fn acquire_local(&mut self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError> {
        let stream = self.devices.user_media(constraints).await?;
        if let Some(previous) = self.local.replace(stream.clone()) {
            previous.stop();
        }
        self.muted = false;
        info!(
            "Acquired local stream {} (video: {})",
            stream.id(),
            stream.video_track().is_some()
        );
        Ok(stream)
    }

    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.local.as_ref()
    }

    pub fn screen_stream(&self) -> Option<&MediaStream> {
        self.screen.as_ref()
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_sharing(&self) -> bool {
        self.screen.is_some()
    }

    /// Flip `enabled` on every local audio track. Returns the new muted flag.
    pub fn toggle_mute(&mut self) -> bool {
        self.muted = !self.muted;
        if let Some(local) = &self.local {
            for track in local.audio_tracks() {
                track.set_enabled(!track.is_enabled());
            }
        }
        debug!("Muted: {}", self.muted);
        self.muted
    }

    /// Put a display capture on the video sender. `on_end` runs if the capture
    /// source ends by itself (e.g. the user stops sharing from system UI).
    pub async fn start_screen_share<F>(&mut self, peer: &dyn PeerConnection, on_end: F) -> Result<(), CallError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_sharing() {
            debug!("Screen share already active");
            return Ok(());
        }

        let screen = self.devices.display_media().await?;
        let Some(track) = screen.video_track().cloned() else {
            screen.stop();
            return Err(MediaError::Capture("display stream has no video track".into()).into());
        };

        if let Err(e) = peer.replace_video_track(&track).await {
            warn!("Could not start screen share: {}", e);
            screen.stop();
            return Err(e);
        }

        self.end_hook = Some(tokio::spawn(async move {
            if track.ended().await {
                on_end();
            }
        }));
        self.screen = Some(screen);
        info!("Screen share started");
        Ok(())
    }

    /// Stop the screen capture and restore the camera track. No-op when not sharing.
    pub async fn stop_screen_share(&mut self, peer: Option<&dyn PeerConnection>) -> Result<(), CallError> {
        let Some(screen) = self.screen.take() else {
            return Ok(());
        };
        if let Some(hook) = self.end_hook.take() {
            hook.abort();
        }
        screen.stop();

        let camera = self.local.as_ref().and_then(|s| s.video_track());
        let result = match (peer, camera) {
            (Some(peer), Some(camera)) => peer.replace_video_track(camera).await,
            _ => Ok(()),
        };
        match &result {
            Ok(()) => info!("Screen share stopped, camera restored"),
            Err(e) => warn!("Screen share stopped but camera could not be restored: {}", e),
        }
        result
    }

    /// Stop every held track and reset the mute and share flags.
    pub fn release_all(&mut self) {
        if let Some(hook) = self.end_hook.take() {
            hook.abort();
        }
        if let Some(screen) = self.screen.take() {
            screen.stop();
        }
        if let Some(local) = self.local.take() {
            local.stop();
            debug!("Released local stream {}", local.id());
        }
        self.muted = false;
    }
}

impl Drop for MediaTrackManager {
    fn drop(&mut self) {
        self.release_all();
    }
}
