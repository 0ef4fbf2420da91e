use thiserror::Error;

use crate::call::CallStatus;

/// Failures raised by the platform media layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("access to {0} was denied")]
    PermissionDenied(String),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("capture failed: {0}")]
    Capture(String),
}

/// Failures raised by a signaling channel implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("signaling relay unavailable")]
    Unavailable,

    #[error("write to {key} rejected: {reason}")]
    Rejected { key: String, reason: String },

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SignalingError {
    fn from(e: serde_json::Error) -> Self {
        SignalingError::Serialization(e.to_string())
    }
}

/// Everything a call operation can surface to the application.
///
/// None of these are fatal: every path that produces one leaves the engine in
/// an inert `Idle` state (or the state it was in before the attempt).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("media access denied: {0}")]
    PermissionDenied(String),

    #[error("media device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("media capture failed: {0}")]
    Capture(String),

    #[error("signaling write failed: {0}")]
    SignalingWriteFailed(#[source] SignalingError),

    /// Duplicate offer/answer/candidate for a resolved session. Logged, never returned.
    #[error("stale session message ignored")]
    StaleSessionIgnored,

    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("no contact selected")]
    NoContact,

    #[error("cannot {op} while {state}")]
    InvalidState { op: &'static str, state: CallStatus },

    #[error("no pending incoming call")]
    NoPendingCall,

    #[error("no active peer connection")]
    NoPeerConnection,

    #[error("peer connection has no video sender")]
    NoVideoSender,

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("call engine stopped")]
    EngineClosed,
}

impl From<MediaError> for CallError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::PermissionDenied(what) => CallError::PermissionDenied(what),
            MediaError::DeviceUnavailable(what) => CallError::DeviceUnavailable(what),
            MediaError::Capture(reason) => CallError::Capture(reason),
        }
    }
}

impl From<SignalingError> for CallError {
    fn from(e: SignalingError) -> Self {
        CallError::SignalingWriteFailed(e)
    }
}
