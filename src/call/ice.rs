use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::media::peer::PeerConnection;
use crate::signaling::records::candidate_items;
use crate::signaling::{IceCandidate, SignalingChannel, Snapshot};

/// Relays candidates between the peer connection and the two per-party
/// candidate lists of one session.
///
/// Outgoing: candidates discovered before the session key is known, or that
/// the relay refused, are held and flushed in discovery order once
/// [`bind`](Self::bind) is called or the next candidate arrives.
///
/// Incoming: each snapshot of the other party's list is applied from the
/// first unseen position onward, so a backlog present at subscribe time is
/// treated exactly like live appends. Candidates seen before the remote
/// description is set are queued until [`flush_pending`](Self::flush_pending).
#[derive(Debug, Default)]
pub struct IceExchanger {
    local_key: Option<String>,
    outbox: VecDeque<IceCandidate>,
    consumed: usize,
    pending_remote: VecDeque<IceCandidate>,
}

impl IceExchanger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_key(&self) -> Option<&str> {
        self.local_key.as_deref()
    }

    /// Remote items consumed so far.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn pending_remote(&self) -> usize {
        self.pending_remote.len()
    }

    /// Candidates discovered locally but not yet on the relay.
    pub fn unsent(&self) -> usize {
        self.outbox.len()
    }

    /// Publish a locally discovered candidate. It is held, behind anything
    /// still unsent, until the key is bound and the relay accepts it.
    pub async fn on_local_candidate(&mut self, channel: &dyn SignalingChannel, candidate: IceCandidate) {
        self.outbox.push_back(candidate);
        if self.local_key.is_none() {
            debug!("Holding local candidate until the session key is written");
            return;
        }
        self.flush_outbox(channel).await;
    }

    /// Set the list local candidates go to and flush anything held so far.
    pub async fn bind(&mut self, channel: &dyn SignalingChannel, key: String) {
        self.local_key = Some(key);
        self.flush_outbox(channel).await;
    }

    /// Publish held candidates in discovery order, stopping at the first
    /// relay failure so nothing is skipped or reordered.
    pub async fn flush_outbox(&mut self, channel: &dyn SignalingChannel) -> usize {
        let Some(key) = self.local_key.as_deref() else {
            return 0;
        };
        let mut published = 0;
        while let Some(candidate) = self.outbox.front() {
            let item = match serde_json::to_value(candidate) {
                Ok(item) => item,
                Err(e) => {
                    warn!("Dropping local candidate that cannot be encoded: {}", e);
                    self.outbox.pop_front();
                    continue;
                }
            };
            if let Err(e) = channel.append_to_list(key, item).await {
                warn!(
                    "Failed to publish local candidate to {} ({} held for retry): {}",
                    key,
                    self.outbox.len(),
                    e
                );
                break;
            }
            self.outbox.pop_front();
            published += 1;
        }
        if published > 0 {
            debug!("Published {} local candidates to {}", published, key);
        }
        published
    }

    /// Apply the unseen suffix of the remote list. Returns how many
    /// candidates reached the peer connection.
    pub async fn on_remote_snapshot(&mut self, peer: &dyn PeerConnection, snapshot: &Snapshot) -> usize {
        let items = candidate_items(snapshot);
        if items.len() <= self.consumed {
            if !items.is_empty() {
                debug!("Remote candidate list unchanged ({} items)", items.len());
            }
            return 0;
        }
        let total = items.len();
        let fresh: Vec<IceCandidate> = items.into_iter().skip(self.consumed).flatten().collect();
        self.consumed = total;

        self.pending_remote.extend(fresh);
        if !peer.has_remote_description().await {
            debug!(
                "Queueing remote candidates until the remote description is set ({} waiting)",
                self.pending_remote.len()
            );
            return 0;
        }
        self.flush_pending(peer).await
    }

    /// Apply queued remote candidates in arrival order. Call right after the
    /// remote description is set.
    pub async fn flush_pending(&mut self, peer: &dyn PeerConnection) -> usize {
        let mut applied = 0;
        while let Some(candidate) = self.pending_remote.pop_front() {
            applied += Self::apply(peer, &candidate).await;
        }
        applied
    }

    async fn apply(peer: &dyn PeerConnection, candidate: &IceCandidate) -> usize {
        match peer.add_ice_candidate(candidate).await {
            Ok(()) => 1,
            Err(e) => {
                // Duplicates and late arrivals are rejected by the connection.
                debug!("Remote candidate not applied: {}", e);
                0
            }
        }
    }
}
