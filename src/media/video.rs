use std::sync::Arc;

use tracing::warn;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::devices::{Device, DeviceKind};

/// List available cameras.
pub fn list_cameras() -> Vec<Device> {
    match nokhwa::query(nokhwa::utils::ApiBackend::Auto) {
        Ok(devices) => devices
            .into_iter()
            .enumerate()
            .map(|(i, info)| {
                let index = info.index().as_index().unwrap_or(i as u32);
                Device::new(DeviceKind::VideoIn, index.to_string(), info.human_name())
            })
            .collect(),
        Err(e) => {
            warn!("Failed to query cameras: {}", e);
            Vec::new()
        }
    }
}

/// VP8 sink at the standard 90kHz video clock.
pub fn vp8_sink(track_id: &str, stream_id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
        track_id.to_string(),
        stream_id.to_string(),
    ))
}
