use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::MediaDevices;
use crate::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    AudioIn,
    AudioOut,
    VideoIn,
}

/// Immutable description of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub kind: DeviceKind,
    pub id: String,
    pub label: String,
}

impl Device {
    pub fn new(kind: DeviceKind, id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            label: label.into(),
        }
    }
}

/// Endpoints grouped by kind, as of the last refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceSnapshot {
    pub audio_in: Vec<Device>,
    pub audio_out: Vec<Device>,
    pub video_in: Vec<Device>,
}

impl DeviceSnapshot {
    pub fn classify(devices: impl IntoIterator<Item = Device>) -> Self {
        let mut snapshot = Self::default();
        for device in devices {
            match device.kind {
                DeviceKind::AudioIn => snapshot.audio_in.push(device),
                DeviceKind::AudioOut => snapshot.audio_out.push(device),
                DeviceKind::VideoIn => snapshot.video_in.push(device),
            }
        }
        snapshot
    }

    pub fn of_kind(&self, kind: DeviceKind) -> &[Device] {
        match kind {
            DeviceKind::AudioIn => &self.audio_in,
            DeviceKind::AudioOut => &self.audio_out,
            DeviceKind::VideoIn => &self.video_in,
        }
    }

    pub fn find(&self, kind: DeviceKind, id: &str) -> Option<&Device> {
        self.of_kind(kind).iter().find(|d| d.id == id)
    }

    pub fn len(&self) -> usize {
        self.audio_in.len() + self.audio_out.len() + self.video_in.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read-only view of the platform's endpoints, replaced wholesale on refresh.
pub struct DeviceInventory {
    devices: Arc<dyn MediaDevices>,
    snapshot: Arc<DeviceSnapshot>,
}

impl DeviceInventory {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            snapshot: Arc::new(DeviceSnapshot::default()),
        }
    }

    pub async fn refresh(&mut self) -> Result<Arc<DeviceSnapshot>, MediaError> {
        let listed = self.devices.enumerate().await?;
        let snapshot = Arc::new(DeviceSnapshot::classify(listed));
        info!(
            "Devices refreshed: {} audio in, {} audio out, {} video in",
            snapshot.audio_in.len(),
            snapshot.audio_out.len(),
            snapshot.video_in.len()
        );
        self.snapshot = snapshot.clone();
        Ok(snapshot)
    }

    pub fn snapshot(&self) -> Arc<DeviceSnapshot> {
        self.snapshot.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::synthetic::SyntheticMediaDevices;

    #[test]
    fn classify_groups_by_kind() {
        let snapshot = DeviceSnapshot::classify(vec![
            Device::new(DeviceKind::VideoIn, "0", "Webcam"),
            Device::new(DeviceKind::AudioIn, "mic", "Mic"),
            Device::new(DeviceKind::AudioOut, "spk", "Speakers"),
            Device::new(DeviceKind::AudioIn, "usb", "USB Mic"),
        ]);
        assert_eq!(snapshot.audio_in.len(), 2);
        assert_eq!(snapshot.audio_out.len(), 1);
        assert_eq!(snapshot.video_in[0].label, "Webcam");
        assert_eq!(snapshot.find(DeviceKind::AudioIn, "usb").unwrap().label, "USB Mic");
        assert!(snapshot.find(DeviceKind::VideoIn, "usb").is_none());
    }

    #[tokio::test]
    async fn refresh_replaces_whole_snapshot() {
        let platform = Arc::new(SyntheticMediaDevices::new());
        let mut inventory = DeviceInventory::new(platform.clone());
        assert!(inventory.snapshot().is_empty());

        inventory.refresh().await.unwrap();
        let before = inventory.snapshot();
        assert_eq!(before.len(), 3);

        platform.set_devices(vec![Device::new(DeviceKind::AudioOut, "hdmi", "HDMI")]);
        inventory.refresh().await.unwrap();
        let after = inventory.snapshot();
        assert_eq!(after.len(), 1);
        assert!(after.audio_in.is_empty());
        // The earlier snapshot is untouched.
        assert_eq!(before.len(), 3);
    }
}
