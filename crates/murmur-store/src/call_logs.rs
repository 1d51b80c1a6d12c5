use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::params;

use murmur_shared::{CallDirection, CallId, CallLog, CallOutcome, CallType, Profile, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};

const SELECT_COLUMNS: &str = "SELECT call_id, caller_id, caller_name, caller_photo,
        receiver_id, receiver_name, receiver_photo, direction, timestamp,
        duration_secs, outcome, call_type
 FROM call_logs";

impl Database {
    /// Persist a terminated call. Returns `false` if a log for the same call
    /// already exists; entries are never overwritten.
    pub fn insert_call_log(&self, log: &CallLog) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO call_logs (call_id, caller_id, caller_name, caller_photo,
                receiver_id, receiver_name, receiver_photo, direction, timestamp,
                duration_secs, outcome, call_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                log.call_id.to_string(),
                log.caller.id.as_str(),
                log.caller.name,
                log.caller.photo,
                log.receiver.id.as_str(),
                log.receiver.name,
                log.receiver.photo,
                log.direction.as_str(),
                log.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
                log.duration_secs as i64,
                log.outcome.as_str(),
                log.call_type.as_str(),
            ],
        )?;
        Ok(affected > 0)
    }

    /// Most recent calls first.
    pub fn recent_call_logs(&self, limit: u32) -> Result<Vec<CallLog>> {
        let mut stmt = self.conn().prepare(&format!(
            "{SELECT_COLUMNS} ORDER BY timestamp DESC, rowid DESC LIMIT ?1"
        ))?;

        let rows = stmt.query_map(params![limit], row_to_call_log)?;

        let mut logs = Vec::new();
        for row in rows {
            logs.push(row?);
        }
        Ok(logs)
    }

    pub fn get_call_log(&self, call_id: &CallId) -> Result<CallLog> {
        self.conn()
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE call_id = ?1"),
                params![call_id.to_string()],
                row_to_call_log,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn count_call_logs(&self) -> Result<u64> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM call_logs", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

fn row_to_call_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<CallLog> {
    let id_str: String = row.get(0)?;
    let direction_str: String = row.get(7)?;
    let ts_str: String = row.get(8)?;
    let duration: i64 = row.get(9)?;
    let outcome_str: String = row.get(10)?;

    let call_id = CallId::parse(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let direction = CallDirection::parse(&direction_str)
        .ok_or_else(|| conversion_error(7, format!("unknown direction {direction_str}")))?;

    let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
        })?;

    let outcome = CallOutcome::parse(&outcome_str)
        .ok_or_else(|| conversion_error(10, format!("unknown outcome {outcome_str}")))?;

    Ok(CallLog {
        call_id,
        caller: Profile {
            id: UserId::new(row.get::<_, String>(1)?),
            name: row.get(2)?,
            photo: row.get(3)?,
        },
        receiver: Profile {
            id: UserId::new(row.get::<_, String>(4)?),
            name: row.get(5)?,
            photo: row.get(6)?,
        },
        direction,
        timestamp,
        duration_secs: duration.max(0) as u64,
        outcome,
        call_type: CallType::Audio,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn log(offset_secs: i64, outcome: CallOutcome) -> CallLog {
        CallLog {
            call_id: CallId::new(),
            caller: Profile::new("alice", "Alice", "a.png"),
            receiver: Profile::new("bob", "Bob", "b.png"),
            direction: CallDirection::Outgoing,
            timestamp: Utc::now() + Duration::seconds(offset_secs),
            duration_secs: 17,
            outcome,
            call_type: CallType::Audio,
        }
    }

    #[test]
    fn test_insert_and_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("calls.db")).unwrap();

        let entry = log(0, CallOutcome::Completed);
        assert!(db.insert_call_log(&entry).unwrap());

        let fetched = db.get_call_log(&entry.call_id).unwrap();
        assert_eq!(fetched.caller, entry.caller);
        assert_eq!(fetched.duration_secs, 17);
        assert_eq!(fetched.outcome, CallOutcome::Completed);
        assert_eq!(
            fetched.timestamp.timestamp_micros(),
            entry.timestamp.timestamp_micros()
        );
    }

    #[test]
    fn test_duplicate_is_ignored() {
        let db = Database::open_in_memory().unwrap();
        let entry = log(0, CallOutcome::Missed);
        assert!(db.insert_call_log(&entry).unwrap());

        let mut again = entry.clone();
        again.outcome = CallOutcome::Failed;
        assert!(!db.insert_call_log(&again).unwrap());

        assert_eq!(db.count_call_logs().unwrap(), 1);
        assert_eq!(
            db.get_call_log(&entry.call_id).unwrap().outcome,
            CallOutcome::Missed
        );
    }

    #[test]
    fn test_recent_is_newest_first() {
        let db = Database::open_in_memory().unwrap();
        let old = log(-120, CallOutcome::Declined);
        let new = log(0, CallOutcome::Completed);
        db.insert_call_log(&new).unwrap();
        db.insert_call_log(&old).unwrap();

        let recent = db.recent_call_logs(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].call_id, new.call_id);

        assert_eq!(db.recent_call_logs(1).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_log() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.get_call_log(&CallId::new()),
            Err(StoreError::NotFound)
        ));
    }
}
