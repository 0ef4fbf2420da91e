use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::negotiator::SessionNegotiator;
use super::state::{CallRole, CallState, IncomingCall};
use super::{CallSnapshot, CallStatus};
use crate::config::CallConfig;
use crate::error::{CallError, MediaError};
use crate::events::{CallEvent, EventSender, Watch};
use crate::media::peer::{PeerConnectionState, PeerConnector, PeerEvent};
use crate::media::{
    DeviceInventory, DeviceKind, DeviceSnapshot, MediaConstraints, MediaDevices, MediaTrackManager,
    RemoteStream, RemoteTrack,
};
use crate::signaling::records::incoming_offers;
use crate::signaling::{CallRecord, SessionId, SessionKeys, SignalingChannel, Snapshot};

/// External services the engine is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub signaling: Arc<dyn SignalingChannel>,
    pub connector: Arc<dyn PeerConnector>,
    pub devices: Arc<dyn MediaDevices>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    /// Unanswered outgoing or incoming call.
    Ring,
    /// Answer exchanged, waiting for media to flow.
    Connect,
    /// Connection dropped, waiting for it to recover.
    Grace,
}

/// The authoritative call lifecycle: `Idle → Calling/Receiving → InCall → Idle`.
///
/// Owned by a single engine task. Operations only change state once the
/// work they started has settled; a failure at any step leaves the machine
/// where it was before the attempt (or `Idle`) with everything released.
pub struct CallStateMachine {
    self_id: String,
    config: CallConfig,
    keys: SessionKeys,
    signaling: Arc<dyn SignalingChannel>,
    negotiator: SessionNegotiator,
    media: MediaTrackManager,
    inventory: DeviceInventory,
    state: CallState,
    contact: Option<String>,
    audio_device: Option<String>,
    video_device: Option<String>,
    attempts: u64,
    /// Offers that were declined, timed out or auto-declined, by fingerprint.
    dismissed: HashSet<String>,
    last_failure: Option<CallError>,
    deadline: Option<(Instant, Deadline)>,
    events: EventSender,
    snapshots: watch::Sender<CallSnapshot>,
    root_watch: Option<JoinHandle<()>>,
}

impl CallStateMachine {
    pub fn new(
        self_id: impl Into<String>,
        config: CallConfig,
        collaborators: Collaborators,
        events: EventSender,
        snapshots: watch::Sender<CallSnapshot>,
    ) -> Self {
        let self_id = self_id.into();
        let keys = SessionKeys::new(config.sessions_root.clone());
        let negotiator = SessionNegotiator::new(
            self_id.clone(),
            keys.clone(),
            config.ice_servers.clone(),
            collaborators.signaling.clone(),
            collaborators.connector,
            events.clone(),
        );
        Self {
            self_id,
            keys,
            signaling: collaborators.signaling,
            negotiator,
            media: MediaTrackManager::new(collaborators.devices.clone()),
            inventory: DeviceInventory::new(collaborators.devices),
            config,
            state: CallState::Idle,
            contact: None,
            audio_device: None,
            video_device: None,
            attempts: 0,
            dismissed: HashSet::new(),
            last_failure: None,
            deadline: None,
            events,
            snapshots,
            root_watch: None,
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn status(&self) -> CallStatus {
        self.state.status()
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    /// Start watching the sessions root for incoming offers and take a first
    /// device inventory.
    pub async fn start(&mut self) -> Result<(), CallError> {
        if let Err(e) = self.inventory.refresh().await {
            warn!("Initial device enumeration failed: {}", e);
        }
        let mut sessions = self.signaling.subscribe(self.keys.root()).await?;
        let tx = self.events.clone();
        self.root_watch = Some(tokio::spawn(async move {
            while let Some(value) = sessions.next().await {
                if tx.send(CallEvent::Sessions(value)).is_err() {
                    break;
                }
            }
        }));
        info!("Watching {} for incoming calls to {}", self.keys.root(), self.self_id);
        Ok(())
    }

    pub fn set_contact(&mut self, contact: Option<String>) {
        debug!("Contact set to {:?}", contact);
        self.contact = contact;
    }

    /// Prefer specific capture devices for later calls. Ids are checked
    /// against the last inventory when one has been taken.
    pub fn select_devices(&mut self, audio: Option<String>, video: Option<String>) -> Result<(), CallError> {
        let snapshot = self.inventory.snapshot();
        if !snapshot.is_empty() {
            for (kind, id) in [(DeviceKind::AudioIn, &audio), (DeviceKind::VideoIn, &video)] {
                if let Some(id) = id {
                    if snapshot.find(kind, id).is_none() {
                        return Err(MediaError::DeviceUnavailable(id.clone()).into());
                    }
                }
            }
        }
        self.audio_device = audio;
        self.video_device = video;
        Ok(())
    }

    pub async fn refresh_devices(&mut self) -> Result<Arc<DeviceSnapshot>, CallError> {
        Ok(self.inventory.refresh().await?)
    }

    fn constraints(&self, video: bool) -> MediaConstraints {
        MediaConstraints {
            video,
            audio_device_id: self.audio_device.clone(),
            video_device_id: self.video_device.clone(),
        }
    }

    fn next_attempt(&mut self) -> u64 {
        self.attempts += 1;
        self.attempts
    }

    fn arm(&mut self, kind: Deadline) {
        let after = match kind {
            Deadline::Ring => self.config.ring_timeout(),
            Deadline::Connect => self.config.connect_timeout(),
            Deadline::Grace => self.config.disconnect_grace(),
        };
        debug!("Armed {:?} deadline ({:?})", kind, after);
        self.deadline = Some((Instant::now() + after, kind));
    }

    fn disarm(&mut self, kinds: &[Deadline]) {
        if matches!(self.deadline, Some((_, kind)) if kinds.contains(&kind)) {
            self.deadline = None;
        }
    }

    /// `Idle → Calling`.
    pub async fn place(&mut self, video: bool) -> Result<SessionId, CallError> {
        let contact = self.contact.clone().ok_or(CallError::NoContact)?;
        if !matches!(self.state, CallState::Idle) {
            return Err(CallError::InvalidState {
                op: "place a call",
                state: self.status(),
            });
        }
        self.last_failure = None;
        let attempt = self.next_attempt();
        let constraints = self.constraints(video);
        let call = self
            .negotiator
            .make_call(attempt, &contact, &constraints, &mut self.media)
            .await
            .inspect_err(|e| error!("Call to {} failed: {}", contact, e))?;

        let session = call.session.clone();
        info!("Calling {} ({}, video: {})", contact, session, video);
        self.state = CallState::Calling(call);
        self.arm(Deadline::Ring);
        Ok(session)
    }

    /// `Receiving → InCall`.
    pub async fn answer(&mut self) -> Result<(), CallError> {
        let incoming = match &self.state {
            CallState::Receiving(incoming) => incoming.clone(),
            CallState::Idle => return Err(CallError::NoPendingCall),
            other => {
                return Err(CallError::InvalidState {
                    op: "answer",
                    state: other.status(),
                })
            }
        };
        self.last_failure = None;
        let attempt = self.next_attempt();
        let constraints = self.constraints(incoming.offer.is_video);
        match self
            .negotiator
            .answer_call(attempt, &incoming, &constraints, &mut self.media)
            .await
        {
            Ok(call) => {
                info!("In call with {} ({})", call.remote_party, call.session);
                self.state = CallState::InCall(call);
                self.arm(Deadline::Connect);
                Ok(())
            }
            Err(e) => {
                error!("Answering {} failed: {}", incoming.caller(), e);
                self.dismissed.insert(incoming.offer.fingerprint());
                self.state = CallState::Idle;
                self.deadline = None;
                Err(e)
            }
        }
    }

    /// `Receiving → Idle`. The caller is released by deleting the record.
    pub async fn decline(&mut self) -> Result<(), CallError> {
        let incoming = match std::mem::take(&mut self.state) {
            CallState::Receiving(incoming) => incoming,
            other => {
                let status = other.status();
                self.state = other;
                return Err(match status {
                    CallStatus::Idle => CallError::NoPendingCall,
                    state => CallError::InvalidState { op: "decline", state },
                });
            }
        };
        info!("Declining call from {}", incoming.caller());
        self.deadline = None;
        self.dismiss(incoming.session, incoming.offer.fingerprint()).await;
        Ok(())
    }

    async fn dismiss(&mut self, session: SessionId, fingerprint: String) {
        self.dismissed.insert(fingerprint);
        let key = self.keys.session(&session);
        if let Err(e) = self.signaling.delete(&key).await {
            warn!("Failed to remove declined session {}: {}", key, e);
        }
    }

    /// Any state `→ Idle`. Never fails: a relay error while removing the
    /// record is logged and local cleanup still happens.
    pub async fn hang_up(&mut self) -> Result<(), CallError> {
        if self.status() != CallStatus::Idle {
            info!("Hanging up ({})", self.status());
        }
        self.teardown(true).await;
        Ok(())
    }

    async fn teardown(&mut self, delete_record: bool) {
        self.deadline = None;
        match std::mem::take(&mut self.state) {
            CallState::Idle => {}
            CallState::Receiving(incoming) => {
                if delete_record {
                    self.dismiss(incoming.session, incoming.offer.fingerprint()).await;
                } else {
                    self.dismissed.insert(incoming.offer.fingerprint());
                }
            }
            CallState::Calling(call) | CallState::InCall(call) => {
                drop(call.watchers);
                if delete_record {
                    let key = self.keys.session(&call.session);
                    match self.signaling.delete(&key).await {
                        Ok(()) => debug!("Removed session record {}", key),
                        Err(e) => warn!("Failed to remove session record {}: {}", key, e),
                    }
                }
                call.peer.close().await;
            }
        }
        self.media.release_all();
    }

    async fn end_call(&mut self, failure: CallError) {
        warn!("Ending call: {}", failure);
        self.teardown(true).await;
        self.last_failure = Some(failure);
    }

    pub fn toggle_mute(&mut self) -> Result<bool, CallError> {
        if self.state.active().is_none() {
            return Err(CallError::InvalidState {
                op: "toggle mute",
                state: self.status(),
            });
        }
        Ok(self.media.toggle_mute())
    }

    pub async fn start_screen_share(&mut self) -> Result<(), CallError> {
        let call = self.state.active().ok_or(CallError::NoPeerConnection)?;
        let attempt = call.attempt;
        let peer = call.peer.clone();
        let tx = self.events.clone();
        self.media
            .start_screen_share(&*peer, move || {
                let _ = tx.send(CallEvent::ScreenShareEnded { attempt });
            })
            .await
    }

    pub async fn stop_screen_share(&mut self) -> Result<(), CallError> {
        let peer = self.state.active().map(|call| call.peer.clone());
        self.media.stop_screen_share(peer.as_deref()).await
    }

    /// When the earliest armed timer fires, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline.map(|(at, _)| at)
    }

    pub async fn on_deadline(&mut self) {
        let Some((_, kind)) = self.deadline.take() else {
            return;
        };
        match (kind, self.status()) {
            (Deadline::Ring, CallStatus::Receiving) => {
                info!("Incoming call not answered in time");
                self.teardown(true).await;
            }
            (Deadline::Ring, CallStatus::Calling) => {
                self.end_call(CallError::PeerUnreachable("call was not answered".into()))
                    .await;
            }
            (Deadline::Connect, CallStatus::InCall) => {
                let secs = self.config.connect_timeout_secs;
                self.end_call(CallError::PeerUnreachable(format!(
                    "no media within {}s of negotiation",
                    secs
                )))
                .await;
            }
            (Deadline::Grace, CallStatus::Calling | CallStatus::InCall) => {
                self.end_call(CallError::PeerUnreachable("connection lost".into())).await;
            }
            (kind, status) => debug!("{:?} deadline expired while {}, ignoring", kind, status),
        }
    }

    pub async fn handle_event(&mut self, event: CallEvent) {
        if let Some(attempt) = event.attempt() {
            if self.state.attempt() != Some(attempt) {
                debug!("Dropping event from attempt {}: {}", attempt, CallError::StaleSessionIgnored);
                return;
            }
        }
        match event {
            CallEvent::Sessions(snapshot) => self.on_sessions(snapshot).await,
            CallEvent::Signal {
                watch: Watch::Session,
                value,
                ..
            } => self.on_session_record(value).await,
            CallEvent::Signal {
                watch: Watch::RemoteCandidates,
                value,
                ..
            } => {
                let signaling = self.signaling.clone();
                if let Some(call) = self.state.active_mut() {
                    let peer = call.peer.clone();
                    let applied = call.ice.on_remote_snapshot(&*peer, &value).await;
                    if applied > 0 {
                        debug!("Applied {} remote candidates for {}", applied, call.session);
                    }
                    // The relay is answering again; retry anything it refused earlier.
                    if call.ice.unsent() > 0 {
                        call.ice.flush_outbox(&*signaling).await;
                    }
                }
            }
            CallEvent::Peer { event, .. } => self.on_peer_event(event).await,
            CallEvent::ScreenShareEnded { .. } => {
                info!("Screen capture ended by the platform");
                if let Err(e) = self.stop_screen_share().await {
                    warn!("Failed to restore camera after screen share: {}", e);
                }
            }
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        let signaling = self.signaling.clone();
        let Some(call) = self.state.active_mut() else {
            return;
        };
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                call.ice.on_local_candidate(&*signaling, candidate).await;
            }
            PeerEvent::RemoteTrack(track) => add_remote_track(&mut call.remote_stream, track),
            PeerEvent::StateChanged(PeerConnectionState::Connected) => {
                info!("Media flowing with {}", call.remote_party);
                call.connected = true;
                self.disarm(&[Deadline::Connect, Deadline::Grace]);
            }
            PeerEvent::StateChanged(PeerConnectionState::Disconnected) => {
                warn!("Connection to {} interrupted", call.remote_party);
                call.connected = false;
                self.arm(Deadline::Grace);
            }
            PeerEvent::StateChanged(PeerConnectionState::Failed) => {
                let party = call.remote_party.clone();
                self.end_call(CallError::PeerUnreachable(format!("connection to {} failed", party)))
                    .await;
            }
            PeerEvent::StateChanged(state) => debug!("Peer connection {:?}", state),
        }
    }

    /// Changes to the active session's record: the answer arriving, or the
    /// record going away because the other party hung up.
    async fn on_session_record(&mut self, value: Snapshot) {
        let record = value.as_ref().and_then(|v| CallRecord::from_value(v).ok());
        let Some(call) = self.state.active_mut() else {
            return;
        };

        let offer = record.as_ref().and_then(|r| r.offer.as_ref());
        match offer {
            None => {
                info!("{} ended the call", call.remote_party);
                self.teardown(true).await;
                return;
            }
            Some(offer) if offer.fingerprint() != call.offer_fingerprint => {
                info!("Session {} was replaced by a newer offer", call.session);
                self.teardown(false).await;
                return;
            }
            Some(_) => {}
        }

        let answer = record.and_then(|r| r.answer);
        let (Some(answer), CallRole::Caller) = (answer, call.role) else {
            return;
        };
        match SessionNegotiator::apply_answer(call, &answer).await {
            Ok(true) => {
                if let CallState::Calling(call) = std::mem::take(&mut self.state) {
                    info!("{} answered ({})", call.remote_party, call.session);
                    self.state = CallState::InCall(call);
                    self.arm(Deadline::Connect);
                }
            }
            Ok(false) => debug!("{}", CallError::StaleSessionIgnored),
            Err(e) => {
                error!("Failed to apply answer: {}", e);
                self.end_call(e).await;
            }
        }
    }

    /// Incoming-call watcher over the whole sessions root.
    async fn on_sessions(&mut self, snapshot: Snapshot) {
        let root = snapshot.unwrap_or(Value::Null);
        let offers = incoming_offers(&root, &self.self_id);
        let present: HashSet<String> = offers.iter().map(|(_, offer)| offer.fingerprint()).collect();
        self.dismissed.retain(|fingerprint| present.contains(fingerprint));

        if let CallState::Receiving(incoming) = &self.state {
            if !present.contains(&incoming.offer.fingerprint()) {
                info!("{} cancelled the call", incoming.caller());
                self.state = CallState::Idle;
                self.deadline = None;
            }
        }

        for (session, offer) in offers {
            let fingerprint = offer.fingerprint();
            if self.dismissed.contains(&fingerprint) || self.state.session() == Some(&session) {
                continue;
            }
            if matches!(self.state, CallState::Idle) {
                info!(
                    "Incoming {} call from {}",
                    if offer.is_video { "video" } else { "audio" },
                    offer.caller
                );
                self.state = CallState::Receiving(IncomingCall { session, offer });
                self.arm(Deadline::Ring);
            } else {
                info!("Busy ({}), declining call from {}", self.status(), offer.caller);
                self.dismiss(session, fingerprint).await;
            }
        }
    }

    pub fn snapshot(&self) -> CallSnapshot {
        let active = self.state.active();
        CallSnapshot {
            status: self.status(),
            contact: self.contact.clone(),
            session: self.state.session().cloned(),
            remote_party: match &self.state {
                CallState::Receiving(incoming) => Some(incoming.caller().to_string()),
                _ => active.map(|call| call.remote_party.clone()),
            },
            is_video: match &self.state {
                CallState::Receiving(incoming) => incoming.offer.is_video,
                _ => active.is_some_and(|call| call.is_video),
            },
            muted: self.media.is_muted(),
            screen_sharing: self.media.is_sharing(),
            connected: active.is_some_and(|call| call.connected),
            local_stream: self.media.local_stream().cloned(),
            remote_stream: active.and_then(|call| call.remote_stream.clone()),
            devices: self.inventory.snapshot(),
            last_failure: self.last_failure.clone(),
        }
    }

    pub fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }
}

fn add_remote_track(stream: &mut Option<RemoteStream>, track: RemoteTrack) {
    debug!("Remote {:?} track {} arrived", track.kind, track.id);
    stream
        .get_or_insert_with(|| RemoteStream {
            id: track.stream_id.clone(),
            tracks: Vec::new(),
        })
        .add(track);
}

impl Drop for CallStateMachine {
    fn drop(&mut self) {
        if let Some(watch) = self.root_watch.take() {
            watch.abort();
        }
    }
}
