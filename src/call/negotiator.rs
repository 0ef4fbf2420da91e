use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error, info, warn};

use super::ice::IceExchanger;
use super::state::{ActiveCall, CallRole, IncomingCall, Watchers};
use crate::config::IceServerConfig;
use crate::error::{CallError, SignalingError};
use crate::events::{EventSender, PeerEventSink, Watch};
use crate::media::peer::{PeerConnection, PeerConnector};
use crate::media::{MediaConstraints, MediaTrackManager};
use crate::signaling::{
    CallRecord, OfferRecord, SessionDescription, SessionId, SessionKeys, SignalingChannel,
};

/// Drives offer/answer creation and owns the peer connection until it is
/// handed to the state machine inside an [`ActiveCall`].
///
/// Every failure unwinds what the attempt allocated: media acquisition runs
/// first so a refusal never leaves a record on the relay, and a failed relay
/// write releases media and closes the connection.
pub struct SessionNegotiator {
    self_id: String,
    keys: SessionKeys,
    ice_servers: Vec<IceServerConfig>,
    signaling: Arc<dyn SignalingChannel>,
    connector: Arc<dyn PeerConnector>,
    events: EventSender,
}

impl SessionNegotiator {
    pub fn new(
        self_id: impl Into<String>,
        keys: SessionKeys,
        ice_servers: Vec<IceServerConfig>,
        signaling: Arc<dyn SignalingChannel>,
        connector: Arc<dyn PeerConnector>,
        events: EventSender,
    ) -> Self {
        Self {
            self_id: self_id.into(),
            keys,
            ice_servers,
            signaling,
            connector,
            events,
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn keys(&self) -> &SessionKeys {
        &self.keys
    }

    /// Place a call to `contact`: offer, write `{offer}`, then watch the
    /// session for an answer and the contact's candidate list.
    pub async fn make_call(
        &self,
        attempt: u64,
        contact: &str,
        constraints: &MediaConstraints,
        media: &mut MediaTrackManager,
    ) -> Result<ActiveCall, CallError> {
        let session = SessionId::derive(&self.self_id, contact);
        let session_key = self.keys.session(&session);

        let local = media.acquire_local(constraints).await?;
        let peer = self.open_peer(attempt, media).await?;
        for track in local.tracks() {
            if let Err(e) = peer.add_track(track).await {
                return Err(abandon(&*peer, media, e).await);
            }
        }

        let offer = match self.describe(&*peer, true).await {
            Ok(offer) => offer,
            Err(e) => return Err(abandon(&*peer, media, e).await),
        };
        let record = OfferRecord::new(offer, &self.self_id, contact, constraints.video);
        let fingerprint = record.fingerprint();
        let value = match serde_json::to_value(CallRecord::with_offer(record)) {
            Ok(value) => value,
            Err(e) => return Err(abandon(&*peer, media, SignalingError::from(e).into()).await),
        };
        if let Err(e) = self.signaling.write(&session_key, value).await {
            error!("Failed to write offer to {}: {}", session_key, e);
            return Err(abandon(&*peer, media, e.into()).await);
        }
        info!("Offer written to {}", session_key);

        let mut ice = IceExchanger::new();
        ice.bind(&*self.signaling, self.keys.candidates(&session, &self.self_id)).await;

        let watchers = match self
            .watch(attempt, &session, &self.keys.candidates(&session, contact))
            .await
        {
            Ok(watchers) => watchers,
            Err(e) => {
                if let Err(e) = self.signaling.delete(&session_key).await {
                    warn!("Failed to withdraw offer at {}: {}", session_key, e);
                }
                return Err(abandon(&*peer, media, e).await);
            }
        };

        Ok(ActiveCall {
            attempt,
            role: CallRole::Caller,
            session,
            remote_party: contact.to_string(),
            is_video: constraints.video,
            offer_fingerprint: fingerprint,
            peer,
            ice,
            remote_stream: None,
            connected: false,
            watchers,
        })
    }

    /// Answer a pending offer: apply it, write `{answer}` into the session
    /// record, then watch the caller's candidate list.
    pub async fn answer_call(
        &self,
        attempt: u64,
        incoming: &IncomingCall,
        constraints: &MediaConstraints,
        media: &mut MediaTrackManager,
    ) -> Result<ActiveCall, CallError> {
        let session_key = self.keys.session(&incoming.session);
        let caller = incoming.caller().to_string();

        let local = media.acquire_local(constraints).await?;
        let peer = self.open_peer(attempt, media).await?;
        for track in local.tracks() {
            if let Err(e) = peer.add_track(track).await {
                return Err(abandon(&*peer, media, e).await);
            }
        }

        if let Err(e) = peer.set_remote_description(&incoming.offer.description).await {
            return Err(abandon(&*peer, media, e).await);
        }
        let answer = match self.describe(&*peer, false).await {
            Ok(answer) => answer,
            Err(e) => return Err(abandon(&*peer, media, e).await),
        };
        if let Err(e) = self.signaling.patch(&session_key, json!({ "answer": answer })).await {
            error!("Failed to write answer to {}: {}", session_key, e);
            return Err(abandon(&*peer, media, e.into()).await);
        }
        info!("Answer written to {}", session_key);

        let mut ice = IceExchanger::new();
        ice.bind(&*self.signaling, self.keys.candidates(&incoming.session, &self.self_id))
            .await;

        let watchers = match self
            .watch(attempt, &incoming.session, &self.keys.candidates(&incoming.session, &caller))
            .await
        {
            Ok(watchers) => watchers,
            Err(e) => return Err(abandon(&*peer, media, e).await),
        };

        Ok(ActiveCall {
            attempt,
            role: CallRole::Callee,
            session: incoming.session.clone(),
            remote_party: caller,
            is_video: constraints.video,
            offer_fingerprint: incoming.offer.fingerprint(),
            peer,
            ice,
            remote_stream: None,
            connected: false,
            watchers,
        })
    }

    /// Apply the callee's answer unless a remote description is already set.
    /// Returns `false` for a duplicate delivery.
    pub async fn apply_answer(call: &mut ActiveCall, answer: &SessionDescription) -> Result<bool, CallError> {
        if call.peer.has_remote_description().await {
            debug!("Answer for {} already applied, ignoring", call.session);
            return Ok(false);
        }
        call.peer.set_remote_description(answer).await?;
        let flushed = call.ice.flush_pending(&*call.peer).await;
        info!("Answer applied for {} ({} queued candidates flushed)", call.session, flushed);
        Ok(true)
    }

    async fn open_peer(
        &self,
        attempt: u64,
        media: &mut MediaTrackManager,
    ) -> Result<Arc<dyn PeerConnection>, CallError> {
        let sink = PeerEventSink::new(attempt, self.events.clone());
        match self.connector.connect(&self.ice_servers, sink).await {
            Ok(peer) => Ok(peer),
            Err(e) => {
                error!("Failed to allocate peer connection: {}", e);
                media.release_all();
                Err(e)
            }
        }
    }

    async fn describe(&self, peer: &dyn PeerConnection, offer: bool) -> Result<SessionDescription, CallError> {
        let description = if offer {
            peer.create_offer().await?
        } else {
            peer.create_answer().await?
        };
        peer.set_local_description(&description).await?;
        Ok(description)
    }

    async fn watch(&self, attempt: u64, session: &SessionId, remote_candidates: &str) -> Result<Watchers, CallError> {
        let mut watchers = Watchers::default();
        let record = self.signaling.subscribe(&self.keys.session(session)).await?;
        watchers.forward(record, self.events.clone(), attempt, Watch::Session);
        let candidates = self.signaling.subscribe(remote_candidates).await?;
        watchers.forward(candidates, self.events.clone(), attempt, Watch::RemoteCandidates);
        Ok(watchers)
    }
}

/// Release everything a failed attempt allocated and pass the error through.
async fn abandon(peer: &dyn PeerConnection, media: &mut MediaTrackManager, e: CallError) -> CallError {
    warn!("Abandoning call attempt: {}", e);
    peer.close().await;
    media.release_all();
    e
}
