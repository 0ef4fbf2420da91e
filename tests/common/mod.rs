#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use peercall::call::CallStatus;
use peercall::events::PeerEventSink;
use peercall::media::peer::{PeerConnection, PeerConnectionState, PeerConnector, PeerEvent};
use peercall::media::synthetic::SyntheticMediaDevices;
use peercall::media::{LocalTrack, TrackKind};
use peercall::signaling::{IceCandidate, MemoryChannel, SessionDescription};
use peercall::{spawn_call_engine, CallConfig, CallError, CallHandle, CallSnapshot, Collaborators, IceServerConfig};
use tokio::task::JoinHandle;

/// Peer connection double: records everything, negotiates nothing.
pub struct FakePeer {
    id: usize,
    events: PeerEventSink,
    state: Mutex<FakePeerState>,
}

#[derive(Default)]
struct FakePeerState {
    tracks: Vec<LocalTrack>,
    video_sender: Option<LocalTrack>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_sets: usize,
    candidates: Vec<IceCandidate>,
    closed: bool,
}

impl FakePeer {
    pub fn new(id: usize, events: PeerEventSink) -> Self {
        Self {
            id,
            events,
            state: Mutex::new(FakePeerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakePeerState> {
        self.state.lock().unwrap()
    }

    /// Fire a callback as the real connection would.
    pub fn emit(&self, event: PeerEvent) {
        self.events.emit(event);
    }

    pub fn discover(&self, candidate: &str) {
        self.emit(PeerEvent::LocalCandidate(candidate_named(candidate)));
    }

    pub fn set_connection_state(&self, state: PeerConnectionState) {
        self.emit(PeerEvent::StateChanged(state));
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.lock().remote.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.lock().local.clone()
    }

    pub fn remote_sets(&self) -> usize {
        self.lock().remote_sets
    }

    /// Applied remote candidates, in application order.
    pub fn applied(&self) -> Vec<String> {
        self.lock().candidates.iter().map(|c| c.candidate.clone()).collect()
    }

    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.lock().tracks.clone()
    }

    pub fn video_sender_track(&self) -> Option<String> {
        self.lock().video_sender.as_ref().map(|t| t.id().to_string())
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), CallError> {
        let mut state = self.lock();
        if track.kind() == TrackKind::Video {
            state.video_sender = Some(track.clone());
        }
        state.tracks.push(track.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        Ok(SessionDescription::offer(format!("offer-from-peer-{}", self.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        if self.lock().remote.is_none() {
            return Err(CallError::Negotiation("answer requested without an offer".into()));
        }
        Ok(SessionDescription::answer(format!("answer-from-peer-{}", self.id)))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> Result<(), CallError> {
        self.lock().local = Some(description.clone());
        Ok(())
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<(), CallError> {
        let mut state = self.lock();
        state.remote = Some(description.clone());
        state.remote_sets += 1;
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.lock().remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), CallError> {
        let mut state = self.lock();
        if state.remote.is_none() {
            return Err(CallError::Negotiation("no remote description".into()));
        }
        if state.candidates.contains(candidate) {
            return Err(CallError::Negotiation("duplicate candidate".into()));
        }
        state.candidates.push(candidate.clone());
        Ok(())
    }

    async fn replace_video_track(&self, track: &LocalTrack) -> Result<(), CallError> {
        let mut state = self.lock();
        match state.video_sender.as_mut() {
            Some(sender) => {
                *sender = track.clone();
                Ok(())
            }
            None => Err(CallError::NoVideoSender),
        }
    }

    async fn close(&self) {
        self.lock().closed = true;
    }
}

/// Hands out [`FakePeer`]s and keeps them for inspection.
#[derive(Default)]
pub struct FakeConnector {
    peers: Mutex<Vec<Arc<FakePeer>>>,
    next: AtomicUsize,
    fail: AtomicBool,
}

impl FakeConnector {
    pub fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().unwrap().clone()
    }

    pub fn last(&self) -> Arc<FakePeer> {
        self.peers().last().cloned().expect("no peer connection was allocated")
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        _ice_servers: &[IceServerConfig],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, CallError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CallError::Negotiation("connector refused".into()));
        }
        let peer = Arc::new(FakePeer::new(self.next.fetch_add(1, Ordering::SeqCst), events));
        self.peers.lock().unwrap().push(peer.clone());
        Ok(peer)
    }
}

pub fn candidate_named(name: &str) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.1 5000 typ host", name),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

pub fn test_config() -> CallConfig {
    CallConfig {
        ring_timeout_secs: 5,
        connect_timeout_secs: 5,
        disconnect_grace_secs: 2,
        ..CallConfig::default()
    }
}

/// One side of a call wired to fakes.
pub struct Party {
    pub id: &'static str,
    pub handle: CallHandle,
    pub connector: Arc<FakeConnector>,
    pub devices: Arc<SyntheticMediaDevices>,
    pub task: JoinHandle<()>,
}

impl Party {
    pub fn spawn(id: &'static str, relay: &Arc<MemoryChannel>) -> Self {
        Self::spawn_with(id, relay, test_config())
    }

    pub fn spawn_with(id: &'static str, relay: &Arc<MemoryChannel>, config: CallConfig) -> Self {
        let connector = Arc::new(FakeConnector::default());
        let devices = Arc::new(SyntheticMediaDevices::new());
        let (handle, task) = spawn_call_engine(
            id,
            config,
            Collaborators {
                signaling: relay.clone(),
                connector: connector.clone(),
                devices: devices.clone(),
            },
        );
        Self {
            id,
            handle,
            connector,
            devices,
            task,
        }
    }

    pub async fn wait_status(&self, status: CallStatus) -> CallSnapshot {
        wait_for(&self.handle, |s| s.status == status).await
    }

    /// Every track this party ever acquired has been stopped.
    pub fn holds_no_tracks(&self) -> bool {
        self.devices.issued_tracks().iter().all(|t| !t.is_live())
    }
}

pub async fn wait_for(handle: &CallHandle, predicate: impl FnMut(&CallSnapshot) -> bool) -> CallSnapshot {
    tokio::time::timeout(Duration::from_secs(30), handle.wait_for(predicate))
        .await
        .expect("timed out waiting for snapshot")
        .expect("engine stopped")
}

/// Poll `condition` until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

/// A calls B and B answers; returns once both are in the call.
pub async fn establish(a: &Party, b: &Party, video: bool) {
    a.handle.set_contact(Some(b.id.to_string())).await.unwrap();
    a.handle.place_call(video).await.unwrap();
    b.wait_status(CallStatus::Receiving).await;
    b.handle.answer().await.unwrap();
    a.wait_status(CallStatus::InCall).await;
}
