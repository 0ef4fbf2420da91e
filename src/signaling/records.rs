use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use super::Snapshot;
use crate::error::SignalingError;

/// Identity of one call attempt on the relay: caller first, then callee.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Caller-first join, so both parties derive the same id without coordination.
    pub fn derive(caller: &str, callee: &str) -> Self {
        Self(format!("{}-{}", caller, callee))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key layout under the configured sessions root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    root: String,
}

impl SessionKeys {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn session(&self, id: &SessionId) -> String {
        format!("{}/{}", self.root, id)
    }

    pub fn candidates(&self, id: &SessionId, originator: &str) -> String {
        format!("{}/{}/candidates/{}", self.root, id, originator)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Opaque negotiation payload, round-tripped verbatim through the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Answer, sdp: sdp.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferRecord {
    #[serde(flatten)]
    pub description: SessionDescription,
    pub caller: String,
    pub callee: String,
    #[serde(default)]
    pub is_video: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl OfferRecord {
    pub fn new(description: SessionDescription, caller: &str, callee: &str, is_video: bool) -> Self {
        Self {
            description,
            caller: caller.to_string(),
            callee: callee.to_string(),
            is_video,
            call_id: Some(Uuid::new_v4()),
            created_at: Some(Utc::now()),
        }
    }

    /// Distinguishes successive offers written to the same session key.
    pub fn fingerprint(&self) -> String {
        match self.call_id {
            Some(id) => id.to_string(),
            None => self.description.sdp.clone(),
        }
    }
}

/// The session record. Candidate sub-lists live beside these fields and are
/// read separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<OfferRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
}

impl CallRecord {
    pub fn from_value(value: &Value) -> Result<Self, SignalingError> {
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn with_offer(offer: OfferRecord) -> Self {
        Self { offer: Some(offer), answer: None }
    }
}

/// One network reachability option, shaped like a browser's `toJSON()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// Every offer addressed to `callee` that has not been answered yet.
pub fn incoming_offers(root: &Value, callee: &str) -> Vec<(SessionId, OfferRecord)> {
    let Some(sessions) = root.as_object() else {
        return Vec::new();
    };
    sessions
        .iter()
        .filter_map(|(key, value)| {
            let record = CallRecord::from_value(value).ok()?;
            let offer = record.offer?;
            (offer.callee == callee && record.answer.is_none())
                .then(|| (SessionId::from(key.clone()), offer))
        })
        .collect()
}

/// Items of a candidate list in append order. Malformed entries keep their
/// slot as `None` so positions stay stable across snapshots.
pub fn candidate_items(snapshot: &Snapshot) -> Vec<Option<IceCandidate>> {
    let raw: Vec<&Value> = match snapshot {
        Some(Value::Array(items)) => items.iter().collect(),
        // Push-id keyed maps sort chronologically.
        Some(Value::Object(map)) => map.values().collect(),
        _ => Vec::new(),
    };
    raw.into_iter()
        .map(|item| match serde_json::from_value::<IceCandidate>(item.clone()) {
            Ok(candidate) => Some(candidate),
            Err(e) => {
                warn!("Skipping malformed candidate {}: {}", item, e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_id_is_caller_first() {
        assert_eq!(SessionId::derive("alice", "bob").as_str(), "alice-bob");
        assert_ne!(SessionId::derive("alice", "bob"), SessionId::derive("bob", "alice"));
    }

    #[test]
    fn keys_nest_candidates_under_session() {
        let keys = SessionKeys::new("calls");
        let id = SessionId::derive("a", "b");
        assert_eq!(keys.session(&id), "calls/a-b");
        assert_eq!(keys.candidates(&id, "a"), "calls/a-b/candidates/a");
    }

    #[test]
    fn offer_record_uses_browser_field_names() {
        let mut offer = OfferRecord::new(SessionDescription::offer("v=0"), "a", "b", true);
        offer.call_id = None;
        offer.created_at = None;
        let value = serde_json::to_value(CallRecord::with_offer(offer)).unwrap();
        assert_eq!(
            value,
            json!({ "offer": { "type": "offer", "sdp": "v=0", "caller": "a", "callee": "b", "isVideo": true } })
        );
    }

    #[test]
    fn record_ignores_candidate_subtree() {
        let value = json!({
            "offer": { "type": "offer", "sdp": "v=0", "caller": "a", "callee": "b", "isVideo": false },
            "answer": { "type": "answer", "sdp": "v=1" },
            "candidates": { "a": [{ "candidate": "candidate:1" }] }
        });
        let record = CallRecord::from_value(&value).unwrap();
        assert_eq!(record.answer, Some(SessionDescription::answer("v=1")));
        assert!(!record.offer.unwrap().is_video);
    }

    #[test]
    fn incoming_offers_skip_answered_and_foreign_sessions() {
        let root = json!({
            "a-me": { "offer": { "type": "offer", "sdp": "1", "caller": "a", "callee": "me" } },
            "b-me": {
                "offer": { "type": "offer", "sdp": "2", "caller": "b", "callee": "me" },
                "answer": { "type": "answer", "sdp": "3" }
            },
            "me-c": { "offer": { "type": "offer", "sdp": "4", "caller": "me", "callee": "c" } },
            "junk": 7
        });
        let offers = incoming_offers(&root, "me");
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].0.as_str(), "a-me");
        assert_eq!(offers[0].1.caller, "a");
    }

    #[test]
    fn candidate_items_keep_slots_for_malformed_entries() {
        let snapshot = Some(json!([
            { "candidate": "candidate:1", "sdpMid": "0", "sdpMLineIndex": 0 },
            { "bogus": true },
            { "candidate": "candidate:3" }
        ]));
        let items = candidate_items(&snapshot);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap().sdp_mline_index, Some(0));
        assert!(items[1].is_none());
        assert_eq!(items[2].as_ref().unwrap().candidate, "candidate:3");
    }

    #[test]
    fn fingerprint_falls_back_to_sdp() {
        let mut offer = OfferRecord::new(SessionDescription::offer("v=0"), "a", "b", false);
        assert_eq!(offer.fingerprint(), offer.call_id.unwrap().to_string());
        offer.call_id = None;
        assert_eq!(offer.fingerprint(), "v=0");
    }
}
