//! v001 -- Initial schema creation.
//!
//! Creates the `call_logs` table holding one frozen row per terminated call.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS call_logs (
    call_id        TEXT PRIMARY KEY NOT NULL,   -- UUID v4, one row per call
    caller_id      TEXT NOT NULL,
    caller_name    TEXT NOT NULL,
    caller_photo   TEXT NOT NULL,
    receiver_id    TEXT NOT NULL,
    receiver_name  TEXT NOT NULL,
    receiver_photo TEXT NOT NULL,
    direction      TEXT NOT NULL,               -- outgoing | incoming
    timestamp      TEXT NOT NULL,               -- RFC-3339, fixed micros width
    duration_secs  INTEGER NOT NULL DEFAULT 0,
    outcome        TEXT NOT NULL,               -- completed | missed | declined | failed
    call_type      TEXT NOT NULL DEFAULT 'audio'
);

CREATE INDEX IF NOT EXISTS idx_call_logs_ts
    ON call_logs(timestamp DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
