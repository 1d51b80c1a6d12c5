//! Incoming call watcher.
//!
//! Watches the signaling store for `ringing` records addressed to the local
//! user and surfaces at most one of them at a time, only while the call
//! manager is idle. A surfaced call is declined automatically if the user
//! does not respond in time.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use murmur_shared::{
    CallDirection, CallId, CallLog, CallOutcome, CallRecord, CallRole, CallStatus, CallType,
    Profile, RecordUpdate, SessionDescription,
};
use murmur_store::SignalingStore;

use crate::config::CallConfig;
use crate::error::CallError;
use crate::history::CallHistoryRecorder;
use crate::notify::Notifier;

/// The call currently offered to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncomingCall {
    pub call_id: CallId,
    pub caller: Profile,
    #[serde(skip)]
    pub offer: SessionDescription,
    pub timestamp: DateTime<Utc>,
}

impl IncomingCall {
    fn from_record(record: &CallRecord) -> Option<Self> {
        Some(Self {
            call_id: record.id.clone(),
            caller: record.caller(),
            offer: record.offer.clone()?,
            timestamp: record.timestamp,
        })
    }
}

struct Surfaced {
    call: IncomingCall,
    auto_decline: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct WatcherState {
    surfaced: Option<Surfaced>,
    /// Calls already surfaced once; never offered again.
    seen: HashSet<CallId>,
    /// Latest ringing set from the store, newest first.
    last: Vec<CallRecord>,
    task: Option<JoinHandle<()>>,
}

struct WatcherInner {
    local: Profile,
    store: Arc<dyn SignalingStore>,
    history: CallHistoryRecorder,
    notifier: Arc<dyn Notifier>,
    ring_timeout: Duration,
    auto_decline_timeout: Duration,
    idle: watch::Receiver<bool>,
    surface: watch::Sender<Option<IncomingCall>>,
    state: Mutex<WatcherState>,
}

#[derive(Clone)]
pub struct IncomingCallWatcher {
    inner: Arc<WatcherInner>,
}

impl IncomingCallWatcher {
    /// `idle` tracks whether the local call manager has no live call.
    pub fn new(
        local: Profile,
        store: Arc<dyn SignalingStore>,
        history: CallHistoryRecorder,
        notifier: Arc<dyn Notifier>,
        config: &CallConfig,
        idle: watch::Receiver<bool>,
    ) -> Self {
        let (surface, _) = watch::channel(None);
        Self {
            inner: Arc::new(WatcherInner {
                local,
                store,
                history,
                notifier,
                ring_timeout: config.ring_timeout,
                auto_decline_timeout: config.auto_decline_timeout,
                idle,
                surface,
                state: Mutex::new(WatcherState::default()),
            }),
        }
    }

    /// Subscribe to the store. Calling it again while running is a no-op.
    pub async fn start(&self) -> Result<(), CallError> {
        if self.inner.lock().task.is_some() {
            return Ok(());
        }

        let mut sub = self.inner.store.subscribe_incoming(&self.inner.local.id).await?;
        let inner = self.inner.clone();
        let mut idle = self.inner.idle.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    ringing = sub.recv() => {
                        let Some(ringing) = ringing else { break };
                        inner.on_ringing(ringing);
                    }
                    changed = idle.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *idle.borrow_and_update() {
                            let last = inner.lock().last.clone();
                            inner.on_ringing(last);
                        }
                    }
                }
            }
            debug!("Incoming call subscription closed");
        });

        let mut state = self.inner.lock();
        if state.task.is_some() {
            // Lost a race with a concurrent start.
            task.abort();
        } else {
            state.task = Some(task);
            info!(user = %self.inner.local.id.short(), "Watching for incoming calls");
        }
        Ok(())
    }

    /// Unsubscribe and drop any surfaced call without declining it.
    pub fn stop(&self) {
        let mut state = self.inner.lock();
        if let Some(task) = state.task.take() {
            task.abort();
        }
        if let Some(surfaced) = state.surfaced.take() {
            if let Some(timer) = surfaced.auto_decline {
                timer.abort();
            }
        }
        state.last.clear();
        self.inner.surface.send_replace(None);
    }

    pub fn current(&self) -> Option<IncomingCall> {
        self.inner.surface.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<IncomingCall>> {
        self.inner.surface.subscribe()
    }

    /// Claim the surfaced call, clearing the surface and cancelling its
    /// auto-decline. Only one caller ever gets a given call.
    pub fn take(&self) -> Option<IncomingCall> {
        self.inner.take(None, true)
    }

    /// Decline the surfaced call.
    pub async fn decline(&self) -> Result<(), CallError> {
        let call = self.take().ok_or(CallError::NoIncomingCall)?;
        info!(call_id = %call.call_id, "Declining incoming call");
        self.inner.resolve(call, CallOutcome::Declined).await
    }
}

impl WatcherInner {
    fn lock(&self) -> MutexGuard<'_, WatcherState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take(&self, only: Option<&CallId>, cancel_timer: bool) -> Option<IncomingCall> {
        let mut state = self.lock();
        let matches = match (&state.surfaced, only) {
            (Some(s), Some(id)) => &s.call.call_id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return None;
        }
        let surfaced = state.surfaced.take()?;
        if cancel_timer {
            if let Some(timer) = surfaced.auto_decline {
                timer.abort();
            }
        }
        self.surface.send_replace(None);
        Some(surfaced.call)
    }

    /// Write `declined` for a call the user (or the timer) turned down and
    /// log it with `outcome`.
    async fn resolve(&self, call: IncomingCall, outcome: CallOutcome) -> Result<(), CallError> {
        let result = self
            .store
            .update_as(
                CallRole::Receiver,
                &call.call_id,
                RecordUpdate::new().status(CallStatus::Declined),
            )
            .await;
        self.log(&call, outcome);
        result.map_err(|e| {
            warn!(call_id = %call.call_id, error = %e, "Failed to decline call");
            e.into()
        })
    }

    fn log(&self, call: &IncomingCall, outcome: CallOutcome) {
        let log = CallLog {
            call_id: call.call_id.clone(),
            caller: call.caller.clone(),
            receiver: self.local.clone(),
            direction: CallDirection::Incoming,
            timestamp: call.timestamp,
            duration_secs: 0,
            outcome,
            call_type: CallType::Audio,
        };
        if let Err(e) = self.history.record(&log) {
            warn!(call_id = %call.call_id, error = %e, "Failed to record call log");
        }
    }

    fn on_ringing(self: &Arc<Self>, ringing: Vec<CallRecord>) {
        let now = Utc::now();
        let mut withdrawn = None;
        let mut surfaced = None;

        {
            let mut state = self.lock();
            state.last = ringing.clone();
            // Ringing is never re-entered, so ids outside the set are done.
            state
                .seen
                .retain(|id| ringing.iter().any(|r| &r.id == id));

            if let Some(current) = &state.surfaced {
                if ringing.iter().any(|r| r.id == current.call.call_id) {
                    return;
                }
                // Caller cancelled or gave up while we were ringing.
                if let Some(gone) = state.surfaced.take() {
                    if let Some(timer) = gone.auto_decline {
                        timer.abort();
                    }
                    withdrawn = Some(gone.call);
                }
                self.surface.send_replace(None);
            }

            if *self.idle.borrow() {
                let candidate = ringing
                    .iter()
                    .filter(|r| !state.seen.contains(&r.id))
                    .filter_map(|r| self.deadline(r, now).map(|d| (r, d)))
                    .next();

                if let Some((record, delay)) = candidate {
                    if let Some(call) = IncomingCall::from_record(record) {
                        state.seen.insert(call.call_id.clone());
                        let timer = self.spawn_auto_decline(call.call_id.clone(), delay);
                        state.surfaced = Some(Surfaced {
                            call: call.clone(),
                            auto_decline: Some(timer),
                        });
                        self.surface.send_replace(Some(call.clone()));
                        surfaced = Some(call);
                    }
                }
            }
        }

        if let Some(call) = withdrawn {
            info!(call_id = %call.call_id, "Incoming call withdrawn by caller");
            self.log(&call, CallOutcome::Missed);
        }

        if let Some(call) = surfaced {
            info!(
                call_id = %call.call_id,
                caller = %call.caller.id.short(),
                "Surfacing incoming call"
            );
            if let Err(e) = self.notifier.notify_incoming_call(&call) {
                warn!(error = %e, "Incoming call notification failed");
            }
        }
    }

    /// Time left before `record` should be auto-declined, or `None` if it has
    /// already outlived the caller's ring window.
    fn deadline(&self, record: &CallRecord, now: DateTime<Utc>) -> Option<Duration> {
        let age = (now - record.timestamp).to_std().unwrap_or(Duration::ZERO);
        let remaining = self.ring_timeout.checked_sub(age)?;
        if remaining.is_zero() {
            debug!(call_id = %record.id, "Skipping stale ringing record");
            return None;
        }
        Some(remaining.min(self.auto_decline_timeout))
    }

    fn spawn_auto_decline(self: &Arc<Self>, call_id: CallId, delay: Duration) -> JoinHandle<()> {
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Whoever takes the call first owns the decline.
            let Some(call) = inner.take(Some(&call_id), false) else {
                return;
            };
            info!(call_id = %call.call_id, "Auto-declining unanswered call");
            let _ = inner.resolve(call, CallOutcome::Missed).await;
        })
    }
}
