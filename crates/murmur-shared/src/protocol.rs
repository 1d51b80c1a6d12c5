use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CallId, CallRole, Profile, UserId};

/// Lifecycle of a signaling record as seen by both parties.
///
/// Status only moves forward: `ringing -> {accepted | declined} -> ended`,
/// or `ringing -> ended` when the caller gives up.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Accepted,
    Declined,
    Ended,
}

impl CallStatus {
    /// Whether a record in `self` may be moved to `next`.
    ///
    /// `ended -> ended` is accepted so that both parties can hang up
    /// without coordinating.
    pub fn can_advance_to(self, next: CallStatus) -> bool {
        use CallStatus::*;
        matches!(
            (self, next),
            (Ringing, Accepted)
                | (Ringing, Declined)
                | (Ringing, Ended)
                | (Accepted, Ended)
                | (Declined, Ended)
                | (Ended, Ended)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Accepted => "accepted",
            CallStatus::Declined => "declined",
            CallStatus::Ended => "ended",
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Opaque session description (SDP offer or answer).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate produced by the transport layer.
///
/// Forwarded verbatim; nothing above the transport interprets it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct CandidatePayload(pub serde_json::Value);

/// The signaling envelope persisted in the shared store, one per call attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: CallId,
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub caller_name: String,
    pub receiver_name: String,
    pub caller_photo: String,
    pub receiver_photo: String,
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    #[serde(default)]
    pub caller_candidates: Vec<CandidatePayload>,
    #[serde(default)]
    pub receiver_candidates: Vec<CandidatePayload>,
    /// Server-assigned creation time.
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

impl CallRecord {
    /// Build the initial `ringing` record. `timestamp` comes from the store.
    pub fn ringing(id: CallId, new: NewCallRecord, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            caller_id: new.caller.id,
            receiver_id: new.receiver.id,
            caller_name: new.caller.name,
            receiver_name: new.receiver.name,
            caller_photo: new.caller.photo,
            receiver_photo: new.receiver.photo,
            status: CallStatus::Ringing,
            offer: Some(new.offer),
            answer: None,
            caller_candidates: Vec::new(),
            receiver_candidates: Vec::new(),
            timestamp,
            duration: None,
        }
    }

    pub fn caller(&self) -> Profile {
        Profile {
            id: self.caller_id.clone(),
            name: self.caller_name.clone(),
            photo: self.caller_photo.clone(),
        }
    }

    pub fn receiver(&self) -> Profile {
        Profile {
            id: self.receiver_id.clone(),
            name: self.receiver_name.clone(),
            photo: self.receiver_photo.clone(),
        }
    }

    /// The role `user` plays in this record, if any.
    pub fn role_of(&self, user: &UserId) -> Option<CallRole> {
        if &self.caller_id == user {
            Some(CallRole::Caller)
        } else if &self.receiver_id == user {
            Some(CallRole::Receiver)
        } else {
            None
        }
    }

    pub fn involves(&self, user: &UserId) -> bool {
        self.role_of(user).is_some()
    }

    pub fn candidates(&self, side: CallRole) -> &[CandidatePayload] {
        match side {
            CallRole::Caller => &self.caller_candidates,
            CallRole::Receiver => &self.receiver_candidates,
        }
    }

    /// Merge one update into this record.
    ///
    /// Enforces the forward-only status order and the set-once `answer`.
    pub fn apply(&mut self, update: &RecordUpdate) -> Result<(), UpdateRejected> {
        // Validate everything first so a rejected update leaves no partial write.
        let mut status = self.status;
        for field in update.fields() {
            match field {
                FieldUpdate::Status(next) => {
                    if !status.can_advance_to(*next) {
                        return Err(UpdateRejected::InvalidTransition {
                            from: status,
                            to: *next,
                        });
                    }
                    status = *next;
                }
                FieldUpdate::Answer(_) if self.answer.is_some() => {
                    return Err(UpdateRejected::AnswerAlreadySet);
                }
                FieldUpdate::Answer(_) if status != CallStatus::Accepted => {
                    return Err(UpdateRejected::AnswerBeforeAccepted);
                }
                _ => {}
            }
        }

        for field in update.fields() {
            match field {
                FieldUpdate::Status(next) => self.status = *next,
                FieldUpdate::Answer(answer) => self.answer = Some(answer.clone()),
                FieldUpdate::Duration(secs) => {
                    if self.duration.is_none() {
                        self.duration = Some(*secs);
                    }
                }
                FieldUpdate::AppendCandidate { side, candidate } => match side {
                    CallRole::Caller => self.caller_candidates.push(candidate.clone()),
                    CallRole::Receiver => self.receiver_candidates.push(candidate.clone()),
                },
            }
        }
        Ok(())
    }
}

/// Fields supplied by the caller when a call is placed.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCallRecord {
    pub caller: Profile,
    pub receiver: Profile,
    pub offer: SessionDescription,
}

/// One field-level change to a record.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    Status(CallStatus),
    Answer(SessionDescription),
    /// Final duration in seconds; written once.
    Duration(u64),
    /// Atomic append onto one party's candidate sequence.
    AppendCandidate {
        side: CallRole,
        candidate: CandidatePayload,
    },
}

impl FieldUpdate {
    /// Whether a party in `role` owns this field.
    pub fn permitted_for(&self, role: CallRole) -> bool {
        match self {
            FieldUpdate::Status(CallStatus::Accepted | CallStatus::Declined) => {
                role == CallRole::Receiver
            }
            FieldUpdate::Status(CallStatus::Ringing) => false,
            FieldUpdate::Status(CallStatus::Ended) => true,
            FieldUpdate::Answer(_) => role == CallRole::Receiver,
            FieldUpdate::Duration(_) => true,
            FieldUpdate::AppendCandidate { side, .. } => *side == role,
        }
    }
}

/// A partial update merged into an existing record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordUpdate {
    fields: Vec<FieldUpdate>,
}

impl RecordUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: CallStatus) -> Self {
        self.fields.push(FieldUpdate::Status(status));
        self
    }

    pub fn answer(mut self, answer: SessionDescription) -> Self {
        self.fields.push(FieldUpdate::Answer(answer));
        self
    }

    pub fn duration(mut self, secs: u64) -> Self {
        self.fields.push(FieldUpdate::Duration(secs));
        self
    }

    pub fn append_candidate(mut self, side: CallRole, candidate: CandidatePayload) -> Self {
        self.fields.push(FieldUpdate::AppendCandidate { side, candidate });
        self
    }

    pub fn fields(&self) -> &[FieldUpdate] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn permitted_for(&self, role: CallRole) -> bool {
        self.fields.iter().all(|f| f.permitted_for(role))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateRejected {
    #[error("status cannot move from {from} to {to}")]
    InvalidTransition { from: CallStatus, to: CallStatus },

    #[error("answer already set")]
    AnswerAlreadySet,

    #[error("answer written before the call was accepted")]
    AnswerBeforeAccepted,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> CallRecord {
        CallRecord::ringing(
            CallId::new(),
            NewCallRecord {
                caller: Profile::new("alice", "Alice", "a.png"),
                receiver: Profile::new("bob", "Bob", "b.png"),
                offer: SessionDescription::offer("v=0 offer"),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_status_order() {
        use CallStatus::*;
        assert!(Ringing.can_advance_to(Accepted));
        assert!(Ringing.can_advance_to(Ended));
        assert!(Declined.can_advance_to(Ended));
        assert!(Ended.can_advance_to(Ended));
        assert!(!Accepted.can_advance_to(Ringing));
        assert!(!Ended.can_advance_to(Accepted));
        assert!(!Declined.can_advance_to(Accepted));
    }

    #[test]
    fn test_wire_field_names() {
        let json = serde_json::to_value(record()).unwrap();
        assert_eq!(json["callerId"], "alice");
        assert_eq!(json["receiverPhoto"], "b.png");
        assert_eq!(json["status"], "ringing");
        assert_eq!(json["offer"]["type"], "offer");
        assert!(json.get("answer").is_none());
        assert!(json["callerCandidates"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_apply_accept_then_end() {
        let mut rec = record();
        rec.apply(
            &RecordUpdate::new()
                .status(CallStatus::Accepted)
                .answer(SessionDescription::answer("v=0 answer")),
        )
        .unwrap();
        assert_eq!(rec.status, CallStatus::Accepted);

        rec.apply(&RecordUpdate::new().status(CallStatus::Ended).duration(12))
            .unwrap();
        rec.apply(&RecordUpdate::new().status(CallStatus::Ended).duration(99))
            .unwrap();
        assert_eq!(rec.duration, Some(12));
    }

    #[test]
    fn test_apply_rejects_backward_and_second_answer() {
        let mut rec = record();
        rec.apply(&RecordUpdate::new().status(CallStatus::Ended))
            .unwrap();
        let err = rec
            .apply(&RecordUpdate::new().status(CallStatus::Accepted))
            .unwrap_err();
        assert!(matches!(err, UpdateRejected::InvalidTransition { .. }));

        let mut rec = record();
        rec.apply(
            &RecordUpdate::new()
                .status(CallStatus::Accepted)
                .answer(SessionDescription::answer("a")),
        )
        .unwrap();
        let err = rec
            .apply(
                &RecordUpdate::new()
                    .append_candidate(CallRole::Receiver, CandidatePayload(serde_json::json!({})))
                    .answer(SessionDescription::answer("b")),
            )
            .unwrap_err();
        assert_eq!(err, UpdateRejected::AnswerAlreadySet);
        // Rejected update must not have appended the candidate.
        assert!(rec.receiver_candidates.is_empty());
    }

    #[test]
    fn test_answer_requires_accepted() {
        let mut rec = record();
        let err = rec
            .apply(&RecordUpdate::new().answer(SessionDescription::answer("a")))
            .unwrap_err();
        assert_eq!(err, UpdateRejected::AnswerBeforeAccepted);
        assert_eq!(rec.status, CallStatus::Ringing);
        assert!(rec.answer.is_none());

        // Status listed after the answer does not count.
        let err = rec
            .apply(
                &RecordUpdate::new()
                    .answer(SessionDescription::answer("a"))
                    .status(CallStatus::Accepted),
            )
            .unwrap_err();
        assert_eq!(err, UpdateRejected::AnswerBeforeAccepted);
        assert_eq!(rec.status, CallStatus::Ringing);
    }

    #[test]
    fn test_write_permissions_follow_role() {
        let c = CandidatePayload(serde_json::json!({"candidate": "x"}));
        assert!(RecordUpdate::new()
            .append_candidate(CallRole::Caller, c.clone())
            .permitted_for(CallRole::Caller));
        assert!(!RecordUpdate::new()
            .append_candidate(CallRole::Caller, c)
            .permitted_for(CallRole::Receiver));
        assert!(!RecordUpdate::new()
            .answer(SessionDescription::answer("a"))
            .permitted_for(CallRole::Caller));
        assert!(RecordUpdate::new()
            .status(CallStatus::Ended)
            .permitted_for(CallRole::Caller));
    }
}
