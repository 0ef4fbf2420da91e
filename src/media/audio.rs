use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::devices::{Device, DeviceKind};
use super::{LocalTrack, TrackState};

/// 20ms Opus frame.
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Opus TOC + payload for a 20ms silent frame.
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];

/// List available input and output audio endpoints.
pub fn list_devices() -> Vec<Device> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    if let Ok(input_devices) = host.input_devices() {
        for device in input_devices {
            if let Ok(name) = device.name() {
                devices.push(Device::new(DeviceKind::AudioIn, name.clone(), name));
            }
        }
    }

    if let Ok(output_devices) = host.output_devices() {
        for device in output_devices {
            if let Ok(name) = device.name() {
                devices.push(Device::new(DeviceKind::AudioOut, name.clone(), name));
            }
        }
    }

    debug!("Enumerated {} audio endpoints", devices.len());
    devices
}

/// Opus sink: 48kHz mono, in-band FEC.
pub fn opus_sink(track_id: &str, stream_id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 1,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            rtcp_feedback: vec![],
        },
        track_id.to_string(),
        stream_id.to_string(),
    ))
}

/// Feed silent Opus frames into `track` while it is live. Muted frames are skipped.
pub fn spawn_silence_pump(track: LocalTrack) -> JoinHandle<()> {
    tokio::spawn(async move {
        let sink = track.sink();
        let mut ticker = tokio::time::interval(FRAME_DURATION);
        info!("Silence pump started for track {}", track.id());
        loop {
            ticker.tick().await;
            if track.state() != TrackState::Live {
                break;
            }
            if !track.is_enabled() {
                continue;
            }
            let sample = Sample {
                data: Bytes::from_static(&OPUS_SILENCE),
                duration: FRAME_DURATION,
                ..Default::default()
            };
            if let Err(e) = sink.write_sample(&sample).await {
                debug!("Failed to write silence sample: {}", e);
            }
        }
        info!("Silence pump for track {} exited", track.id());
    })
}
