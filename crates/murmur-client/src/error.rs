use thiserror::Error;

use murmur_media::{MediaError, MicrophoneReason};
use murmur_store::StoreError;

/// Everything a call operation can fail with.
///
/// Setup failures always leave the manager idle with the microphone and
/// transport released.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No incoming call to answer")]
    NoIncomingCall,

    #[error("Microphone unavailable: {reason}")]
    MicrophoneUnavailable { reason: MicrophoneReason },

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Signaling store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Connection failed")]
    TransportFailed,

    /// The attempt was cancelled by `end_call` before it finished.
    #[error("Call attempt cancelled")]
    Aborted,
}

impl CallError {
    /// Text suitable for a transient notification.
    pub fn user_message(&self) -> &'static str {
        match self {
            CallError::AlreadyInCall => "You are already in a call.",
            CallError::NoIncomingCall => "The call is no longer available.",
            CallError::MicrophoneUnavailable { reason } => reason.user_message(),
            CallError::TransportFailed => "The connection was lost.",
            CallError::Aborted => "The call was cancelled.",
            CallError::Negotiation(_) | CallError::StoreUnavailable(_) => {
                "The call could not be connected. Please try again."
            }
        }
    }
}

impl From<MediaError> for CallError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::MicrophoneUnavailable(reason) => CallError::MicrophoneUnavailable { reason },
            MediaError::Negotiation(msg) | MediaError::WebRtc(msg) => CallError::Negotiation(msg),
            MediaError::SessionClosed => CallError::Aborted,
        }
    }
}

impl From<StoreError> for CallError {
    fn from(e: StoreError) -> Self {
        match e {
            // The record moved on without us (cancelled, answered elsewhere).
            StoreError::Rejected(_)
            | StoreError::RecordNotFound(_)
            | StoreError::NotPermitted { .. } => {
                CallError::Negotiation(e.to_string())
            }
            other => CallError::StoreUnavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_shared::{CallStatus, UpdateRejected};

    #[test]
    fn test_media_errors_map_into_taxonomy() {
        let err: CallError =
            MediaError::MicrophoneUnavailable(MicrophoneReason::PermissionDenied).into();
        assert_eq!(
            err,
            CallError::MicrophoneUnavailable {
                reason: MicrophoneReason::PermissionDenied
            }
        );
        assert_eq!(
            err.user_message(),
            MicrophoneReason::PermissionDenied.user_message()
        );
        assert_eq!(CallError::from(MediaError::SessionClosed), CallError::Aborted);
    }

    #[test]
    fn test_store_errors_map_into_taxonomy() {
        let offline: CallError = StoreError::Unavailable("offline".into()).into();
        assert!(matches!(offline, CallError::StoreUnavailable(_)));

        let rejected: CallError = StoreError::Rejected(UpdateRejected::InvalidTransition {
            from: CallStatus::Ended,
            to: CallStatus::Accepted,
        })
        .into();
        assert!(matches!(rejected, CallError::Negotiation(_)));
    }
}
