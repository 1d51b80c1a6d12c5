use serde::Serialize;

use murmur_shared::{CallId, CallOutcome, CallRole, Profile};

use crate::error::CallError;

/// Local status of the live call. Idle is the absence of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Connecting,
    Ringing,
    Connected,
}

/// Snapshot of the live call for rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSessionView {
    /// `None` until the signaling record exists.
    pub call_id: Option<CallId>,
    pub peer: Profile,
    pub role: CallRole,
    pub status: SessionStatus,
    pub is_muted: bool,
    /// Seconds since the call connected.
    pub duration: u64,
}

/// Notifications broadcast to the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Ringing {
        call_id: CallId,
    },
    Connected {
        call_id: CallId,
    },
    Ended {
        call_id: Option<CallId>,
        outcome: CallOutcome,
        duration_secs: u64,
    },
    Failed {
        error: CallError,
    },
    RemoteAudio {
        track_id: String,
    },
    MuteChanged {
        muted: bool,
    },
}
