pub mod engine;
pub mod ice;
pub mod machine;
pub mod negotiator;
pub mod state;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::CallError;
use crate::media::{DeviceSnapshot, MediaStream, RemoteStream};
use crate::signaling::SessionId;

pub use engine::{run_call_engine, spawn_call_engine};
pub use machine::{CallStateMachine, Collaborators};
pub use state::{ActiveCall, CallRole, CallState, IncomingCall};

/// Coarse lifecycle of the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    #[default]
    Idle,
    Calling,
    Receiving,
    InCall,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallStatus::Idle => "idle",
            CallStatus::Calling => "calling",
            CallStatus::Receiving => "receiving",
            CallStatus::InCall => "in-call",
        })
    }
}

/// What the application observes: the state value plus the current local and
/// remote stream handles.
#[derive(Debug, Clone, Default)]
pub struct CallSnapshot {
    pub status: CallStatus,
    pub contact: Option<String>,
    pub session: Option<SessionId>,
    /// The other party of the current or pending call.
    pub remote_party: Option<String>,
    pub is_video: bool,
    pub muted: bool,
    pub screen_sharing: bool,
    /// Media is flowing.
    pub connected: bool,
    pub local_stream: Option<MediaStream>,
    pub remote_stream: Option<RemoteStream>,
    pub devices: Arc<DeviceSnapshot>,
    /// Why the last call ended abnormally, if it did.
    pub last_failure: Option<CallError>,
}

pub type Reply<T> = oneshot::Sender<Result<T, CallError>>;

/// User intents sent to the engine.
#[derive(Debug)]
pub enum CallCommand {
    SetContact {
        contact: Option<String>,
        reply: Reply<()>,
    },
    SelectDevices {
        audio: Option<String>,
        video: Option<String>,
        reply: Reply<()>,
    },
    Place {
        video: bool,
        reply: Reply<SessionId>,
    },
    Answer {
        reply: Reply<()>,
    },
    Decline {
        reply: Reply<()>,
    },
    HangUp {
        reply: Reply<()>,
    },
    ToggleMute {
        reply: Reply<bool>,
    },
    StartScreenShare {
        reply: Reply<()>,
    },
    StopScreenShare {
        reply: Reply<()>,
    },
    RefreshDevices {
        reply: Reply<Arc<DeviceSnapshot>>,
    },
    Shutdown,
}
