//! Types shared by every murmur crate: identifiers, the signaling record
//! exchanged through the shared store, and call history entries.

pub mod constants;
pub mod history;
pub mod protocol;
pub mod types;

pub use history::{CallDirection, CallLog, CallOutcome, CallType};
pub use protocol::{
    CallRecord, CallStatus, CandidatePayload, FieldUpdate, NewCallRecord, RecordUpdate,
    SdpKind, SessionDescription, UpdateRejected,
};
pub use types::{CallId, CallRole, Profile, UserId};
