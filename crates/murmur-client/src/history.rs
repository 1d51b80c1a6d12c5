//! Call history: local SQLite log plus the live feed from the signaling
//! store.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use tracing::{debug, warn};

use murmur_shared::{CallLog, UserId};
use murmur_store::{Database, SignalingStore, StoreError, Subscription};

/// Appends finalized [`CallLog`]s and serves them back newest first.
#[derive(Clone)]
pub struct CallHistoryRecorder {
    db: Arc<Mutex<Database>>,
    store: Arc<dyn SignalingStore>,
    local: UserId,
}

impl CallHistoryRecorder {
    pub fn new(db: Database, store: Arc<dyn SignalingStore>, local: UserId) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            store,
            local,
        }
    }

    /// Store one entry. A second entry for the same call is ignored.
    pub fn record(&self, log: &CallLog) -> Result<(), StoreError> {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        if db.insert_call_log(log)? {
            debug!(
                call_id = %log.call_id,
                outcome = %log.outcome,
                duration = log.duration_secs,
                "Call logged"
            );
        } else {
            warn!(call_id = %log.call_id, "Call already logged, keeping first entry");
        }
        Ok(())
    }

    /// Most recent entries first.
    pub fn recent(&self, limit: usize) -> Result<Vec<CallLog>, StoreError> {
        let limit = u32::try_from(limit).unwrap_or(u32::MAX);
        self.db
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .recent_call_logs(limit)
    }

    /// Live history as seen by the signaling store, translated to the local
    /// user's point of view.
    pub async fn history(&self) -> Result<HistoryFeed, StoreError> {
        let sub = self.store.subscribe_history(&self.local).await?;
        Ok(HistoryFeed {
            sub,
            local: self.local.clone(),
        })
    }
}

/// Stream of history snapshots, newest first. Dropping it unsubscribes.
pub struct HistoryFeed {
    sub: Subscription<Vec<murmur_shared::CallRecord>>,
    local: UserId,
}

impl HistoryFeed {
    pub async fn next(&mut self) -> Option<Vec<CallLog>> {
        let records = self.sub.recv().await?;
        Some(translate(&records, &self.local))
    }
}

fn translate(records: &[murmur_shared::CallRecord], local: &UserId) -> Vec<CallLog> {
    records
        .iter()
        .filter_map(|r| CallLog::from_record(r, local))
        .collect()
}

impl Stream for HistoryFeed {
    type Item = Vec<CallLog>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        Pin::new(&mut this.sub)
            .poll_next(cx)
            .map(|records| records.map(|r| translate(&r, &this.local)))
    }
}
