use tokio::sync::mpsc;
use tracing::trace;

use crate::media::peer::PeerEvent;
use crate::signaling::Snapshot;

/// Which per-attempt relay subscription a snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watch {
    /// The session record itself.
    Session,
    /// The other party's candidate list.
    RemoteCandidates,
}

/// Asynchronous completions delivered to the call engine.
///
/// Everything produced on behalf of one call attempt carries that attempt's
/// number; the engine drops events whose attempt is no longer current.
#[derive(Debug)]
pub enum CallEvent {
    /// New snapshot of the whole sessions root (incoming-call watcher).
    Sessions(Snapshot),
    Signal {
        attempt: u64,
        watch: Watch,
        value: Snapshot,
    },
    Peer {
        attempt: u64,
        event: PeerEvent,
    },
    /// The screen capture source ended outside our control.
    ScreenShareEnded { attempt: u64 },
}

impl CallEvent {
    pub fn attempt(&self) -> Option<u64> {
        match self {
            CallEvent::Sessions(_) => None,
            CallEvent::Signal { attempt, .. }
            | CallEvent::Peer { attempt, .. }
            | CallEvent::ScreenShareEnded { attempt } => Some(*attempt),
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<CallEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<CallEvent>;

pub fn create_event_bus() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Handed to a peer connection so its callbacks reach the engine tagged with
/// the attempt they belong to.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    attempt: u64,
    tx: EventSender,
}

impl PeerEventSink {
    pub fn new(attempt: u64, tx: EventSender) -> Self {
        Self { attempt, tx }
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn emit(&self, event: PeerEvent) {
        if self
            .tx
            .send(CallEvent::Peer { attempt: self.attempt, event })
            .is_err()
        {
            trace!("Call engine gone, dropping peer event");
        }
    }
}
