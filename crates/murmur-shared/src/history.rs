//! Call history entries.
//!
//! A [`CallLog`] is frozen exactly once when a call terminates and is never
//! mutated afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{CallRecord, CallStatus};
use crate::types::{CallId, Profile, UserId};

/// Terminal outcome of a call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    Completed,
    Missed,
    Declined,
    Failed,
}

impl CallOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            CallOutcome::Completed => "completed",
            CallOutcome::Missed => "missed",
            CallOutcome::Declined => "declined",
            CallOutcome::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(CallOutcome::Completed),
            "missed" => Some(CallOutcome::Missed),
            "declined" => Some(CallOutcome::Declined),
            "failed" => Some(CallOutcome::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a call relative to the local user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

impl CallDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            CallDirection::Outgoing => "outgoing",
            CallDirection::Incoming => "incoming",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "outgoing" => Some(CallDirection::Outgoing),
            "incoming" => Some(CallDirection::Incoming),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    #[default]
    Audio,
}

impl CallType {
    pub fn as_str(self) -> &'static str {
        match self {
            CallType::Audio => "audio",
        }
    }
}

/// Immutable history entry for one terminated call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallLog {
    pub call_id: CallId,
    pub caller: Profile,
    pub receiver: Profile,
    pub direction: CallDirection,
    pub timestamp: DateTime<Utc>,
    pub duration_secs: u64,
    pub outcome: CallOutcome,
    pub call_type: CallType,
}

impl CallLog {
    /// The other party, from the local user's point of view.
    pub fn peer(&self) -> &Profile {
        match self.direction {
            CallDirection::Outgoing => &self.receiver,
            CallDirection::Incoming => &self.caller,
        }
    }

    /// Translate a shared signaling record into a history entry seen by
    /// `local`. Returns `None` if `local` is not a party to the record.
    pub fn from_record(record: &CallRecord, local: &UserId) -> Option<Self> {
        let direction = if &record.caller_id == local {
            CallDirection::Outgoing
        } else if &record.receiver_id == local {
            CallDirection::Incoming
        } else {
            return None;
        };

        let duration_secs = record.duration.unwrap_or(0);
        let outcome = match record.status {
            CallStatus::Declined => CallOutcome::Declined,
            CallStatus::Accepted => CallOutcome::Completed,
            CallStatus::Ended if duration_secs > 0 || record.answer.is_some() => {
                CallOutcome::Completed
            }
            CallStatus::Ended | CallStatus::Ringing => CallOutcome::Missed,
        };

        Some(Self {
            call_id: record.id.clone(),
            caller: record.caller(),
            receiver: record.receiver(),
            direction,
            timestamp: record.timestamp,
            duration_secs,
            outcome,
            call_type: CallType::Audio,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{NewCallRecord, RecordUpdate, SessionDescription};

    fn record() -> CallRecord {
        CallRecord::ringing(
            CallId::new(),
            NewCallRecord {
                caller: Profile::new("alice", "Alice", ""),
                receiver: Profile::new("bob", "Bob", ""),
                offer: SessionDescription::offer("o"),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_direction_relative_to_local_user() {
        let rec = record();
        let mine = CallLog::from_record(&rec, &UserId::new("alice")).unwrap();
        assert_eq!(mine.direction, CallDirection::Outgoing);
        assert_eq!(mine.peer().name, "Bob");

        let theirs = CallLog::from_record(&rec, &UserId::new("bob")).unwrap();
        assert_eq!(theirs.direction, CallDirection::Incoming);
        assert_eq!(theirs.peer().name, "Alice");

        assert!(CallLog::from_record(&rec, &UserId::new("carol")).is_none());
    }

    #[test]
    fn test_outcome_derivation() {
        let alice = UserId::new("alice");

        let mut rec = record();
        rec.apply(&RecordUpdate::new().status(CallStatus::Ended))
            .unwrap();
        assert_eq!(
            CallLog::from_record(&rec, &alice).unwrap().outcome,
            CallOutcome::Missed
        );

        let mut rec = record();
        rec.apply(&RecordUpdate::new().status(CallStatus::Declined))
            .unwrap();
        assert_eq!(
            CallLog::from_record(&rec, &alice).unwrap().outcome,
            CallOutcome::Declined
        );

        let mut rec = record();
        rec.apply(
            &RecordUpdate::new()
                .status(CallStatus::Accepted)
                .answer(SessionDescription::answer("a")),
        )
        .unwrap();
        rec.apply(&RecordUpdate::new().status(CallStatus::Ended).duration(42))
            .unwrap();
        let log = CallLog::from_record(&rec, &alice).unwrap();
        assert_eq!(log.outcome, CallOutcome::Completed);
        assert_eq!(log.duration_secs, 42);
    }

    #[test]
    fn test_outcome_parse() {
        for outcome in [
            CallOutcome::Completed,
            CallOutcome::Missed,
            CallOutcome::Declined,
            CallOutcome::Failed,
        ] {
            assert_eq!(CallOutcome::parse(outcome.as_str()), Some(outcome));
        }
        assert_eq!(CallOutcome::parse("busy"), None);
    }
}
