//! In-process signaling store.
//!
//! Behaves like the hosted document store the clients talk to in
//! production: server-assigned timestamps, per-record ordered snapshots,
//! live query subscriptions and atomic candidate appends. Two call managers
//! sharing one [`MemorySignalingStore`] can complete a full call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use murmur_shared::{CallId, CallRecord, CallStatus, NewCallRecord, RecordUpdate, UserId};

use crate::error::{Result, StoreError};
use crate::signaling::{SignalingStore, Subscription};

struct StoredRecord {
    /// Creation order, used to break timestamp ties for "newest first".
    seq: u64,
    record: CallRecord,
}

enum QueryKind {
    Incoming,
    History,
}

struct QueryWatcher {
    user: UserId,
    kind: QueryKind,
    tx: UnboundedSender<Vec<CallRecord>>,
}

struct Inner {
    available: bool,
    /// Offset applied to server-assigned timestamps.
    clock_skew: chrono::Duration,
    next_seq: u64,
    records: HashMap<CallId, StoredRecord>,
    record_watchers: HashMap<CallId, Vec<UnboundedSender<Option<CallRecord>>>>,
    query_watchers: Vec<QueryWatcher>,
    /// Every accepted update, in write order.
    update_log: Vec<(CallId, RecordUpdate)>,
}

impl Inner {
    fn ensure_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(StoreError::Unavailable("store offline".into()))
        }
    }

    fn query(&self, user: &UserId, kind: &QueryKind) -> Vec<CallRecord> {
        let mut matching: Vec<&StoredRecord> = self
            .records
            .values()
            .filter(|stored| match kind {
                QueryKind::Incoming => {
                    &stored.record.receiver_id == user
                        && stored.record.status == CallStatus::Ringing
                }
                QueryKind::History => stored.record.involves(user),
            })
            .collect();
        matching.sort_by(|a, b| {
            b.record
                .timestamp
                .cmp(&a.record.timestamp)
                .then(b.seq.cmp(&a.seq))
        });
        matching.into_iter().map(|s| s.record.clone()).collect()
    }

    /// Push the current state of `id` to everyone watching it, plus the
    /// query watchers of both parties.
    fn notify(&mut self, id: &CallId, parties: &[UserId]) {
        let snapshot = self.records.get(id).map(|s| s.record.clone());
        if let Some(watchers) = self.record_watchers.get_mut(id) {
            watchers.retain(|tx| tx.send(snapshot.clone()).is_ok());
        }

        let mut watchers = std::mem::take(&mut self.query_watchers);
        watchers.retain(|w| {
            if !parties.contains(&w.user) {
                return !w.tx.is_closed();
            }
            w.tx.send(self.query(&w.user, &w.kind)).is_ok()
        });
        self.query_watchers = watchers;
    }
}

/// Shared, cloneable in-memory store.
#[derive(Clone)]
pub struct MemorySignalingStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemorySignalingStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                available: true,
                clock_skew: chrono::Duration::zero(),
                next_seq: 0,
                records: HashMap::new(),
                record_watchers: HashMap::new(),
                query_watchers: Vec::new(),
                update_log: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Simulate the backing service going offline (or coming back).
    pub fn set_available(&self, available: bool) {
        info!(available, "Signaling store availability changed");
        self.lock().available = available;
    }

    /// Shift the server clock used for new records. A negative skew makes
    /// freshly created records look old to the receiving side.
    pub fn set_clock_skew(&self, skew: chrono::Duration) {
        self.lock().clock_skew = skew;
    }

    /// Current copy of a record.
    pub fn record(&self, id: &CallId) -> Option<CallRecord> {
        self.lock().records.get(id).map(|s| s.record.clone())
    }

    /// Remove a record; watchers of that record receive `None`.
    pub fn delete_record(&self, id: &CallId) -> bool {
        let mut inner = self.lock();
        let Some(removed) = inner.records.remove(id) else {
            return false;
        };
        let parties = [removed.record.caller_id, removed.record.receiver_id];
        inner.notify(id, &parties);
        inner.record_watchers.remove(id);
        debug!(call_id = %id, "Deleted call record");
        true
    }

    /// Updates accepted so far, in write order.
    pub fn updates(&self) -> Vec<(CallId, RecordUpdate)> {
        self.lock().update_log.clone()
    }

    /// Number of records ever created.
    pub fn created_count(&self) -> u64 {
        self.lock().next_seq
    }

    fn subscribe_query(&self, user: &UserId, kind: QueryKind) -> Result<Subscription<Vec<CallRecord>>> {
        let mut inner = self.lock();
        inner.ensure_available()?;
        let (tx, sub) = Subscription::channel();
        let _ = tx.send(inner.query(user, &kind));
        inner.query_watchers.push(QueryWatcher {
            user: user.clone(),
            kind,
            tx,
        });
        Ok(sub)
    }
}

impl Default for MemorySignalingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingStore for MemorySignalingStore {
    async fn create_record(&self, new: NewCallRecord) -> Result<CallId> {
        let mut inner = self.lock();
        inner.ensure_available()?;

        let id = CallId::new();
        let record = CallRecord::ringing(id.clone(), new, Utc::now() + inner.clock_skew);
        let parties = [record.caller_id.clone(), record.receiver_id.clone()];
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.records.insert(id.clone(), StoredRecord { seq, record });

        debug!(call_id = %id, "Created call record");
        inner.notify(&id, &parties);
        Ok(id)
    }

    async fn update_record(&self, id: &CallId, update: RecordUpdate) -> Result<()> {
        let mut inner = self.lock();
        inner.ensure_available()?;

        let stored = inner
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::RecordNotFound(id.clone()))?;
        stored.record.apply(&update)?;
        let parties = [
            stored.record.caller_id.clone(),
            stored.record.receiver_id.clone(),
        ];

        inner.update_log.push((id.clone(), update));
        inner.notify(id, &parties);
        Ok(())
    }

    async fn subscribe(&self, id: &CallId) -> Result<Subscription<Option<CallRecord>>> {
        let mut inner = self.lock();
        inner.ensure_available()?;
        let (tx, sub) = Subscription::channel();
        let _ = tx.send(inner.records.get(id).map(|s| s.record.clone()));
        inner
            .record_watchers
            .entry(id.clone())
            .or_default()
            .push(tx);
        Ok(sub)
    }

    async fn subscribe_incoming(&self, user: &UserId) -> Result<Subscription<Vec<CallRecord>>> {
        self.subscribe_query(user, QueryKind::Incoming)
    }

    async fn subscribe_history(&self, user: &UserId) -> Result<Subscription<Vec<CallRecord>>> {
        self.subscribe_query(user, QueryKind::History)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_shared::{CallRole, CandidatePayload, Profile, SessionDescription, UpdateRejected};

    fn new_call(caller: &str, receiver: &str) -> NewCallRecord {
        NewCallRecord {
            caller: Profile::new(caller, caller.to_uppercase(), ""),
            receiver: Profile::new(receiver, receiver.to_uppercase(), ""),
            offer: SessionDescription::offer("v=0"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_delivers_initial_and_updates() {
        let store = MemorySignalingStore::new();
        let id = store.create_record(new_call("alice", "bob")).await.unwrap();

        let mut sub = store.subscribe(&id).await.unwrap();
        let first = sub.recv().await.unwrap().unwrap();
        assert_eq!(first.status, CallStatus::Ringing);
        assert!(first.answer.is_none());

        store
            .update_record(
                &id,
                RecordUpdate::new()
                    .status(CallStatus::Accepted)
                    .answer(SessionDescription::answer("v=0 a")),
            )
            .await
            .unwrap();
        let second = sub.recv().await.unwrap().unwrap();
        assert_eq!(second.status, CallStatus::Accepted);
        assert_eq!(second.answer.unwrap().sdp, "v=0 a");
    }

    #[tokio::test]
    async fn test_subscribe_unknown_record_yields_none() {
        let store = MemorySignalingStore::new();
        let mut sub = store.subscribe(&CallId::new()).await.unwrap();
        assert_eq!(sub.recv().await, Some(None));
    }

    #[tokio::test]
    async fn test_delete_delivers_none() {
        let store = MemorySignalingStore::new();
        let id = store.create_record(new_call("alice", "bob")).await.unwrap();
        let mut sub = store.subscribe(&id).await.unwrap();
        let _ = sub.recv().await;

        assert!(store.delete_record(&id));
        assert_eq!(sub.recv().await, Some(None));
        assert!(!store.delete_record(&id));
    }

    #[tokio::test]
    async fn test_incoming_query_newest_first_and_ringing_only() {
        let store = MemorySignalingStore::new();
        let mut sub = store.subscribe_incoming(&UserId::new("bob")).await.unwrap();
        assert!(sub.recv().await.unwrap().is_empty());

        let first = store.create_record(new_call("alice", "bob")).await.unwrap();
        assert_eq!(sub.recv().await.unwrap().len(), 1);
        let second = store.create_record(new_call("carol", "bob")).await.unwrap();
        let set = sub.recv().await.unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set[0].id, second);

        // A call to somebody else does not reach bob's watcher.
        store.create_record(new_call("alice", "dave")).await.unwrap();
        assert!(sub.try_recv().is_none());

        store
            .update_record(&first, RecordUpdate::new().status(CallStatus::Ended))
            .await
            .unwrap();
        let set = sub.recv().await.unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].id, second);
    }

    #[tokio::test]
    async fn test_history_includes_both_directions() {
        let store = MemorySignalingStore::new();
        store.create_record(new_call("alice", "bob")).await.unwrap();
        store.create_record(new_call("bob", "carol")).await.unwrap();
        store.create_record(new_call("carol", "dave")).await.unwrap();

        let mut sub = store.subscribe_history(&UserId::new("bob")).await.unwrap();
        let set = sub.recv().await.unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set[0].caller_id, UserId::new("bob"));
    }

    #[tokio::test]
    async fn test_concurrent_candidate_appends_are_not_lost() {
        let store = MemorySignalingStore::new();
        let id = store.create_record(new_call("alice", "bob")).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            let id = id.clone();
            let side = if i % 2 == 0 {
                CallRole::Caller
            } else {
                CallRole::Receiver
            };
            tasks.push(tokio::spawn(async move {
                store
                    .update_record(
                        &id,
                        RecordUpdate::new()
                            .append_candidate(side, CandidatePayload(serde_json::json!({ "n": i }))),
                    )
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let record = store.record(&id).unwrap();
        assert_eq!(record.caller_candidates.len(), 10);
        assert_eq!(record.receiver_candidates.len(), 10);
    }

    #[tokio::test]
    async fn test_rejects_backward_transition() {
        let store = MemorySignalingStore::new();
        let id = store.create_record(new_call("alice", "bob")).await.unwrap();
        store
            .update_record(&id, RecordUpdate::new().status(CallStatus::Declined))
            .await
            .unwrap();
        let err = store
            .update_record(&id, RecordUpdate::new().status(CallStatus::Accepted))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        assert_eq!(store.updates().len(), 1);
    }

    #[tokio::test]
    async fn test_answer_needs_accepted_status() {
        let store = MemorySignalingStore::new();
        let id = store.create_record(new_call("alice", "bob")).await.unwrap();
        let err = store
            .update_record(
                &id,
                RecordUpdate::new().answer(SessionDescription::answer("v=0 early")),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Rejected(UpdateRejected::AnswerBeforeAccepted)
        ));
        let record = store.record(&id).unwrap();
        assert_eq!(record.status, CallStatus::Ringing);
        assert!(record.answer.is_none());
        assert!(store.updates().is_empty());
    }

    #[tokio::test]
    async fn test_update_as_refuses_other_party_fields() {
        let store = MemorySignalingStore::new();
        let id = store.create_record(new_call("alice", "bob")).await.unwrap();

        let err = store
            .update_as(
                CallRole::Caller,
                &id,
                RecordUpdate::new().status(CallStatus::Declined),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::NotPermitted {
                role: CallRole::Caller,
                ..
            }
        ));
        assert!(store.updates().is_empty());

        store
            .update_as(
                CallRole::Receiver,
                &id,
                RecordUpdate::new().status(CallStatus::Declined),
            )
            .await
            .unwrap();
        assert_eq!(store.record(&id).unwrap().status, CallStatus::Declined);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemorySignalingStore::new();
        store.set_available(false);
        let err = store.create_record(new_call("alice", "bob")).await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(store.subscribe_incoming(&UserId::new("bob")).await.is_err());
        assert_eq!(store.created_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let store = MemorySignalingStore::new();
        let id = store.create_record(new_call("alice", "bob")).await.unwrap();
        let sub = store.subscribe(&id).await.unwrap();
        sub.unsubscribe();
        store
            .update_record(&id, RecordUpdate::new().status(CallStatus::Ended))
            .await
            .unwrap();
        assert!(store.lock().record_watchers[&id].is_empty());
    }

    #[tokio::test]
    async fn test_clock_skew_backdates_new_records() {
        let store = MemorySignalingStore::new();
        store.set_clock_skew(chrono::Duration::seconds(-120));
        let id = store.create_record(new_call("alice", "bob")).await.unwrap();
        let age = Utc::now() - store.record(&id).unwrap().timestamp;
        assert!(age >= chrono::Duration::seconds(119));
    }
}
