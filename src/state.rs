use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use crate::call::{CallCommand, CallSnapshot, Reply};
use crate::error::CallError;
use crate::media::DeviceSnapshot;
use crate::signaling::SessionId;

/// Application-side handle to a running call engine. Cheap to clone.
#[derive(Clone)]
pub struct CallHandle {
    command_tx: mpsc::Sender<CallCommand>,
    snapshot_rx: watch::Receiver<CallSnapshot>,
}

impl CallHandle {
    pub fn new(command_tx: mpsc::Sender<CallCommand>, snapshot_rx: watch::Receiver<CallSnapshot>) -> Self {
        Self { command_tx, snapshot_rx }
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> CallCommand) -> Result<T, CallError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(command(reply))
            .await
            .map_err(|_| CallError::EngineClosed)?;
        rx.await.map_err(|_| CallError::EngineClosed)?
    }

    pub async fn set_contact(&self, contact: Option<String>) -> Result<(), CallError> {
        self.request(|reply| CallCommand::SetContact { contact, reply }).await
    }

    pub async fn select_devices(&self, audio: Option<String>, video: Option<String>) -> Result<(), CallError> {
        self.request(|reply| CallCommand::SelectDevices { audio, video, reply }).await
    }

    pub async fn place_call(&self, video: bool) -> Result<SessionId, CallError> {
        self.request(|reply| CallCommand::Place { video, reply }).await
    }

    pub async fn answer(&self) -> Result<(), CallError> {
        self.request(|reply| CallCommand::Answer { reply }).await
    }

    pub async fn decline(&self) -> Result<(), CallError> {
        self.request(|reply| CallCommand::Decline { reply }).await
    }

    pub async fn hang_up(&self) -> Result<(), CallError> {
        self.request(|reply| CallCommand::HangUp { reply }).await
    }

    /// Returns the new muted flag.
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.request(|reply| CallCommand::ToggleMute { reply }).await
    }

    pub async fn start_screen_share(&self) -> Result<(), CallError> {
        self.request(|reply| CallCommand::StartScreenShare { reply }).await
    }

    pub async fn stop_screen_share(&self) -> Result<(), CallError> {
        self.request(|reply| CallCommand::StopScreenShare { reply }).await
    }

    pub async fn refresh_devices(&self) -> Result<Arc<DeviceSnapshot>, CallError> {
        self.request(|reply| CallCommand::RefreshDevices { reply }).await
    }

    /// Hang up whatever is active and stop the engine.
    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(CallCommand::Shutdown).await;
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    pub async fn wait_for(&self, predicate: impl FnMut(&CallSnapshot) -> bool) -> Result<CallSnapshot, CallError> {
        let mut rx = self.snapshot_rx.clone();
        let snapshot = rx.wait_for(predicate).await.map_err(|_| CallError::EngineClosed)?;
        Ok(snapshot.clone())
    }
}
