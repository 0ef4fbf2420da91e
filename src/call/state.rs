use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::trace;

use super::ice::IceExchanger;
use super::CallStatus;
use crate::events::{CallEvent, EventSender, Watch};
use crate::media::peer::PeerConnection;
use crate::media::RemoteStream;
use crate::signaling::{OfferRecord, SessionId, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

/// Relay subscriptions feeding the engine for one attempt. Dropping this
/// stops the forwarders, which in turn unsubscribes.
#[derive(Debug, Default)]
pub struct Watchers(Vec<JoinHandle<()>>);

impl Watchers {
    pub fn forward(&mut self, mut subscription: Subscription, tx: EventSender, attempt: u64, watch: Watch) {
        self.0.push(tokio::spawn(async move {
            while let Some(value) = subscription.next().await {
                if tx.send(CallEvent::Signal { attempt, watch, value }).is_err() {
                    break;
                }
            }
            trace!("Watcher for {} finished", subscription.key());
        }));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Drop for Watchers {
    fn drop(&mut self) {
        for handle in self.0.drain(..) {
            handle.abort();
        }
    }
}

/// A call with an allocated peer connection.
pub struct ActiveCall {
    pub attempt: u64,
    pub role: CallRole,
    pub session: SessionId,
    pub remote_party: String,
    pub is_video: bool,
    /// Identifies the offer this call was built on.
    pub offer_fingerprint: String,
    pub peer: Arc<dyn PeerConnection>,
    pub ice: IceExchanger,
    pub remote_stream: Option<RemoteStream>,
    pub connected: bool,
    pub watchers: Watchers,
}

impl std::fmt::Debug for ActiveCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveCall")
            .field("attempt", &self.attempt)
            .field("role", &self.role)
            .field("session", &self.session)
            .field("remote_party", &self.remote_party)
            .field("is_video", &self.is_video)
            .field("connected", &self.connected)
            .finish()
    }
}

/// An offer addressed to us that has not been answered yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    pub session: SessionId,
    pub offer: OfferRecord,
}

impl IncomingCall {
    pub fn caller(&self) -> &str {
        &self.offer.caller
    }
}

/// Each variant carries exactly what is valid in that state.
#[derive(Debug, Default)]
pub enum CallState {
    #[default]
    Idle,
    Calling(ActiveCall),
    Receiving(IncomingCall),
    InCall(ActiveCall),
}

impl CallState {
    pub fn status(&self) -> CallStatus {
        match self {
            CallState::Idle => CallStatus::Idle,
            CallState::Calling(_) => CallStatus::Calling,
            CallState::Receiving(_) => CallStatus::Receiving,
            CallState::InCall(_) => CallStatus::InCall,
        }
    }

    pub fn active(&self) -> Option<&ActiveCall> {
        match self {
            CallState::Calling(call) | CallState::InCall(call) => Some(call),
            _ => None,
        }
    }

    pub fn active_mut(&mut self) -> Option<&mut ActiveCall> {
        match self {
            CallState::Calling(call) | CallState::InCall(call) => Some(call),
            _ => None,
        }
    }

    pub fn incoming(&self) -> Option<&IncomingCall> {
        match self {
            CallState::Receiving(incoming) => Some(incoming),
            _ => None,
        }
    }

    /// Session this state is bound to, if any.
    pub fn session(&self) -> Option<&SessionId> {
        match self {
            CallState::Idle => None,
            CallState::Receiving(incoming) => Some(&incoming.session),
            CallState::Calling(call) | CallState::InCall(call) => Some(&call.session),
        }
    }

    /// Attempt whose events are current.
    pub fn attempt(&self) -> Option<u64> {
        self.active().map(|call| call.attempt)
    }
}
