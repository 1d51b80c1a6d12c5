//! Call session state machine.
//!
//! [`CallSessionManager`] owns the single live call of this client. It drives
//! the media backend through negotiation, listens to the call's signaling
//! record and to transport events, and resolves every exit path (hang-up,
//! decline, ring timeout, transport failure, setup error) through one
//! teardown routine so the microphone and transport are always released.
//!
//! Each call attempt gets a generation token. Every step that resumes after
//! an await re-checks the token; a mismatch means the call was ended in the
//! meantime and the step backs out, releasing whatever it had just created.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use murmur_media::{MediaBackend, PeerSession, TransportEvent};
use murmur_shared::{
    CallDirection, CallId, CallLog, CallOutcome, CallRecord, CallRole, CallStatus, CallType,
    CandidatePayload, NewCallRecord, Profile, RecordUpdate,
};
use murmur_store::{SignalingStore, Subscription};

use crate::config::CallConfig;
use crate::error::CallError;
use crate::events::{CallEvent, CallSessionView, SessionStatus};
use crate::history::CallHistoryRecorder;
use crate::incoming::{IncomingCall, IncomingCallWatcher};
use crate::notify::Notifier;
use crate::timer::CallTimer;

const EVENT_CAPACITY: usize = 64;

struct ActiveCall {
    token: u64,
    role: CallRole,
    peer: Profile,
    call_id: Option<CallId>,
    timestamp: DateTime<Utc>,
    status: SessionStatus,
    muted: bool,
    session: Option<Arc<dyn PeerSession>>,
    timer: CallTimer,
    /// Stops the per-call event loop.
    shutdown: watch::Sender<bool>,
    /// Remote description applied; remote candidates may follow.
    remote_applied: bool,
    /// Remote candidates already handed to the session.
    remote_candidates: usize,
}

impl ActiveCall {
    fn new(token: u64, role: CallRole, peer: Profile) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            token,
            role,
            peer,
            call_id: None,
            timestamp: Utc::now(),
            status: SessionStatus::Connecting,
            muted: false,
            session: None,
            timer: CallTimer::new(),
            shutdown,
            remote_applied: false,
            remote_candidates: 0,
        }
    }

    fn view(&self) -> CallSessionView {
        CallSessionView {
            call_id: self.call_id.clone(),
            peer: self.peer.clone(),
            role: self.role,
            status: self.status,
            is_muted: self.muted,
            duration: self.timer.elapsed_secs(),
        }
    }

    /// Outcome if the call were to end right now without a more specific cause.
    fn interrupted_outcome(&self) -> CallOutcome {
        if self.status == SessionStatus::Connected {
            CallOutcome::Completed
        } else {
            CallOutcome::Failed
        }
    }
}

enum Slot {
    Idle,
    Active(ActiveCall),
}

/// Channels handed from setup to the per-call event loop.
struct CallChannels {
    records: Subscription<Option<CallRecord>>,
    candidates: mpsc::UnboundedReceiver<CandidatePayload>,
    transport: mpsc::UnboundedReceiver<TransportEvent>,
    shutdown: watch::Receiver<bool>,
}

type OpenedSession = (
    Arc<dyn PeerSession>,
    mpsc::UnboundedReceiver<CandidatePayload>,
    mpsc::UnboundedReceiver<TransportEvent>,
);

struct Inner {
    local: Profile,
    store: Arc<dyn SignalingStore>,
    media: Arc<dyn MediaBackend>,
    history: CallHistoryRecorder,
    watcher: IncomingCallWatcher,
    config: CallConfig,
    slot: Mutex<Slot>,
    next_token: AtomicU64,
    idle: watch::Sender<bool>,
    view: watch::Sender<Option<CallSessionView>>,
    events: broadcast::Sender<CallEvent>,
}

/// The one call orchestrator for a signed-in user.
///
/// Cheap to clone; clones share the same call. Call [`init`](Self::init) once
/// the user session starts and [`dispose`](Self::dispose) when it ends.
#[derive(Clone)]
pub struct CallSessionManager {
    inner: Arc<Inner>,
}

impl CallSessionManager {
    pub fn new(
        local: Profile,
        store: Arc<dyn SignalingStore>,
        media: Arc<dyn MediaBackend>,
        history: CallHistoryRecorder,
        notifier: Arc<dyn Notifier>,
        config: CallConfig,
    ) -> Self {
        let (idle, idle_rx) = watch::channel(true);
        let (view, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let watcher = IncomingCallWatcher::new(
            local.clone(),
            store.clone(),
            history.clone(),
            notifier,
            &config,
            idle_rx,
        );

        Self {
            inner: Arc::new(Inner {
                local,
                store,
                media,
                history,
                watcher,
                config,
                slot: Mutex::new(Slot::Idle),
                next_token: AtomicU64::new(0),
                idle,
                view,
                events,
            }),
        }
    }

    /// Start watching for incoming calls.
    pub async fn init(&self) -> Result<(), CallError> {
        self.inner.watcher.start().await
    }

    /// End any live call and stop watching for incoming ones.
    pub async fn dispose(&self) {
        self.end_call().await;
        self.inner.watcher.stop();
        info!(user = %self.inner.local.id.short(), "Call manager disposed");
    }

    pub fn current(&self) -> Option<CallSessionView> {
        self.inner.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<CallSessionView>> {
        self.inner.view.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    /// The incoming call currently offered to the user, if any.
    pub fn incoming(&self) -> watch::Receiver<Option<IncomingCall>> {
        self.inner.watcher.subscribe()
    }

    pub fn history(&self) -> &CallHistoryRecorder {
        &self.inner.history
    }

    /// The configured number of most recent history entries, newest first.
    pub fn recent_calls(&self) -> Result<Vec<CallLog>, CallError> {
        Ok(self.inner.history.recent(self.inner.config.history_limit)?)
    }

    pub fn is_idle(&self) -> bool {
        matches!(*self.inner.lock(), Slot::Idle)
    }

    /// Place a call to `peer`. Returns once the call is ringing.
    pub async fn initiate_call(&self, peer: Profile) -> Result<CallId, CallError> {
        let token = self
            .inner
            .begin(|token| Ok(ActiveCall::new(token, CallRole::Caller, peer.clone())))?;
        info!(peer = %peer.id.short(), "Placing call");

        match self.inner.place_call(token, peer).await {
            Ok(call_id) => Ok(call_id),
            Err(e) => Err(self.inner.abort_setup(token, e).await),
        }
    }

    /// Answer the surfaced incoming call.
    pub async fn accept_call(&self) -> Result<CallId, CallError> {
        let mut incoming = None;
        let token = self.inner.begin(|token| {
            let taken = self.inner.watcher.take().ok_or(CallError::NoIncomingCall)?;
            let mut call = ActiveCall::new(token, CallRole::Receiver, taken.caller.clone());
            call.call_id = Some(taken.call_id.clone());
            call.timestamp = taken.timestamp;
            incoming = Some(taken);
            Ok(call)
        })?;
        let Some(incoming) = incoming else {
            return Err(CallError::NoIncomingCall);
        };
        info!(
            call_id = %incoming.call_id,
            caller = %incoming.caller.id.short(),
            "Accepting call"
        );

        match self.inner.answer_call(token, &incoming).await {
            Ok(()) => Ok(incoming.call_id),
            Err(e) => Err(self.inner.abort_setup(token, e).await),
        }
    }

    /// Turn down the surfaced incoming call.
    pub async fn decline_call(&self) -> Result<(), CallError> {
        self.inner.watcher.decline().await
    }

    /// Hang up. Safe to call at any point, including mid-negotiation and
    /// when there is no call.
    pub async fn end_call(&self) {
        let target = match &*self.inner.lock() {
            Slot::Active(call) => {
                let outcome = if call.status == SessionStatus::Connected {
                    CallOutcome::Completed
                } else {
                    CallOutcome::Missed
                };
                Some((call.token, outcome))
            }
            Slot::Idle => None,
        };

        match target {
            Some((token, outcome)) => {
                info!("Hanging up");
                self.inner.finish(token, outcome, None).await;
            }
            None => debug!("end_call with no active call"),
        }
    }

    /// Flip the local microphone gate. Returns the new state, or `None` when
    /// there is no call. Never touches the signaling store.
    pub fn toggle_mute(&self) -> Option<bool> {
        let (muted, session) = match &mut *self.inner.lock() {
            Slot::Active(call) => {
                call.muted = !call.muted;
                self.inner.publish(call);
                (call.muted, call.session.clone())
            }
            Slot::Idle => return None,
        };

        if let Some(session) = session {
            session.set_muted(muted);
        }
        info!(muted, "Mute toggled");
        self.inner.emit(CallEvent::MuteChanged { muted });
        Some(muted)
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` against the live call if it is still generation `token`.
    fn with_call<R>(&self, token: u64, f: impl FnOnce(&mut ActiveCall) -> R) -> Option<R> {
        match &mut *self.lock() {
            Slot::Active(call) if call.token == token => Some(f(call)),
            _ => None,
        }
    }

    fn ensure_current(&self, token: u64) -> Result<(), CallError> {
        self.with_call(token, |_| ()).ok_or(CallError::Aborted)
    }

    fn publish(&self, call: &ActiveCall) {
        self.view.send_replace(Some(call.view()));
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    /// Claim the idle slot for a new call. `make` runs under the lock and
    /// may veto the call.
    fn begin(
        &self,
        make: impl FnOnce(u64) -> Result<ActiveCall, CallError>,
    ) -> Result<u64, CallError> {
        let mut slot = self.lock();
        if let Slot::Active(_) = &*slot {
            return Err(CallError::AlreadyInCall);
        }

        let token = self.next_token.fetch_add(1, Ordering::SeqCst) + 1;
        let call = make(token)?;

        self.publish(&call);
        *slot = Slot::Active(call);
        self.idle.send_replace(false);
        Ok(token)
    }

    /// Record the session on the live call, or tear it down if the call is
    /// already gone.
    async fn attach(&self, token: u64, session: &Arc<dyn PeerSession>) -> Result<(), CallError> {
        let muted = self.with_call(token, |call| {
            call.session = Some(session.clone());
            call.muted
        });
        match muted {
            Some(muted) => {
                if muted {
                    session.set_muted(true);
                }
                Ok(())
            }
            None => {
                session.teardown().await;
                Err(CallError::Aborted)
            }
        }
    }

    /// Microphone plus a fresh transport session, attached to the live call.
    async fn open_session(&self, token: u64) -> Result<OpenedSession, CallError> {
        let audio = self.media.request_local_audio().await?;
        self.ensure_current(token)?;

        let (candidates_tx, candidates) = mpsc::unbounded_channel();
        let (events_tx, transport) = mpsc::unbounded_channel();
        let session = self
            .media
            .create_session(audio, candidates_tx, events_tx)
            .await?;
        self.attach(token, &session).await?;
        Ok((session, candidates, transport))
    }

    async fn place_call(self: &Arc<Self>, token: u64, peer: Profile) -> Result<CallId, CallError> {
        let (session, candidates, transport) = self.open_session(token).await?;

        let offer = session.create_offer().await?;
        self.ensure_current(token)?;

        let call_id = self
            .store
            .create_record(NewCallRecord {
                caller: self.local.clone(),
                receiver: peer.clone(),
                offer,
            })
            .await?;

        let registered = self.with_call(token, |call| {
            call.call_id = Some(call_id.clone());
            self.publish(call);
        });
        if registered.is_none() {
            // Hung up while the record was being written.
            self.mark_ended(CallRole::Caller, &call_id, 0).await;
            return Err(CallError::Aborted);
        }

        let records = self.store.subscribe(&call_id).await?;
        let shutdown = self
            .with_call(token, |call| {
                call.status = SessionStatus::Ringing;
                self.publish(call);
                call.shutdown.subscribe()
            })
            .ok_or(CallError::Aborted)?;

        info!(call_id = %call_id, peer = %peer.id.short(), "Ringing");
        self.emit(CallEvent::Ringing {
            call_id: call_id.clone(),
        });

        tokio::spawn(self.clone().run(
            token,
            CallRole::Caller,
            call_id.clone(),
            CallChannels {
                records,
                candidates,
                transport,
                shutdown,
            },
        ));
        Ok(call_id)
    }

    async fn answer_call(self: &Arc<Self>, token: u64, incoming: &IncomingCall) -> Result<(), CallError> {
        let (session, candidates, transport) = self.open_session(token).await?;

        session.apply_remote_description(&incoming.offer).await?;
        let answer = session.create_answer().await?;
        self.ensure_current(token)?;

        // Subscribe first so a hang-up racing the answer is not missed.
        let records = self.store.subscribe(&incoming.call_id).await?;
        self.write(
            CallRole::Receiver,
            &incoming.call_id,
            RecordUpdate::new()
                .status(CallStatus::Accepted)
                .answer(answer),
        )
        .await?;

        let shutdown = self
            .with_call(token, |call| {
                call.remote_applied = true;
                call.shutdown.subscribe()
            })
            .ok_or(CallError::Aborted)?;
        self.mark_connected(token);

        tokio::spawn(self.clone().run(
            token,
            CallRole::Receiver,
            incoming.call_id.clone(),
            CallChannels {
                records,
                candidates,
                transport,
                shutdown,
            },
        ));
        Ok(())
    }

    /// Collapse a setup failure: release everything and go idle. Returns
    /// the error to surface.
    async fn abort_setup(&self, token: u64, e: CallError) -> CallError {
        if self.ensure_current(token).is_err() {
            // Already ended by someone else; whatever failed was fallout.
            debug!(error = %e, "Call setup interrupted");
            return CallError::Aborted;
        }
        error!(error = %e, "Call setup failed");
        self.finish(token, CallOutcome::Failed, Some(e.clone())).await;
        e
    }

    /// Per-call loop: signaling snapshots, transport events, outgoing
    /// candidates, the ring deadline and timer ticks, all processed in order.
    async fn run(self: Arc<Self>, token: u64, role: CallRole, call_id: CallId, channels: CallChannels) {
        let CallChannels {
            mut records,
            mut candidates,
            mut transport,
            mut shutdown,
        } = channels;
        let Some(mut ticks) = self.with_call(token, |call| call.timer.subscribe()) else {
            return;
        };
        let ring_deadline = Instant::now() + self.config.ring_timeout;

        loop {
            let ringing = role == CallRole::Caller
                && self.with_call(token, |call| call.status == SessionStatus::Ringing) == Some(true);

            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                // Queued snapshots win over the ring deadline, so an answer
                // that already arrived is never reported as missed.
                snapshot = records.recv() => match snapshot {
                    Some(snapshot) => self.on_snapshot(token, role, snapshot).await,
                    None => {
                        warn!(call_id = %call_id, "Record subscription closed");
                        let err = CallError::StoreUnavailable("subscription closed".into());
                        self.finish(token, CallOutcome::Failed, Some(err)).await;
                    }
                },
                Some(event) = transport.recv() => {
                    self.on_transport(token, event).await;
                }
                Some(candidate) = candidates.recv() => {
                    self.forward_candidate(role, &call_id, candidate).await;
                }
                _ = sleep_until(ring_deadline), if ringing => {
                    self.on_ring_timeout(token).await;
                }
                Ok(()) = ticks.changed() => {
                    let _ = ticks.borrow_and_update();
                    self.with_call(token, |call| self.publish(call));
                }
            }

            if self.ensure_current(token).is_err() {
                break;
            }
        }
        debug!(call_id = %call_id, "Call loop stopped");
    }

    async fn on_ring_timeout(&self, token: u64) {
        let still_ringing =
            self.with_call(token, |call| call.status == SessionStatus::Ringing) == Some(true);
        if still_ringing {
            info!("No answer, giving up");
            self.finish(token, CallOutcome::Missed, None).await;
        }
    }

    async fn forward_candidate(&self, role: CallRole, call_id: &CallId, candidate: CandidatePayload) {
        debug!(call_id = %call_id, %role, "Forwarding local candidate");
        let update = RecordUpdate::new().append_candidate(role, candidate);
        if let Err(e) = self.write(role, call_id, update).await {
            warn!(call_id = %call_id, error = %e, "Failed to forward candidate");
        }
    }

    async fn on_transport(&self, token: u64, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.mark_connected(token),
            TransportEvent::Failed => {
                error!("Transport failed");
                self.finish(token, CallOutcome::Failed, Some(CallError::TransportFailed))
                    .await;
            }
            TransportEvent::Disconnected | TransportEvent::Closed => {
                debug!(?event, "Transport state changed");
            }
            TransportEvent::RemoteTrack(audio) => {
                if self.ensure_current(token).is_ok() {
                    debug!(track = %audio.track_id, "Remote audio attached");
                    self.emit(CallEvent::RemoteAudio {
                        track_id: audio.track_id,
                    });
                }
            }
        }
    }

    async fn on_snapshot(&self, token: u64, role: CallRole, snapshot: Option<CallRecord>) {
        let Some(record) = snapshot else {
            warn!("Call record disappeared");
            let outcome = self
                .with_call(token, |call| call.interrupted_outcome())
                .unwrap_or(CallOutcome::Failed);
            self.finish(token, outcome, None).await;
            return;
        };
        debug!(call_id = %record.id, status = %record.status, "Record snapshot");

        let Some(outcome) = self.with_call(token, |call| {
            call.timestamp = record.timestamp;
            call.interrupted_outcome()
        }) else {
            return;
        };

        match (role, record.status) {
            (CallRole::Caller, CallStatus::Declined) => {
                info!(call_id = %record.id, "Call declined");
                self.finish(token, CallOutcome::Declined, None).await;
                return;
            }
            (_, CallStatus::Ended) => {
                info!(call_id = %record.id, "Remote side ended the call");
                self.finish(token, outcome, None).await;
                return;
            }
            (CallRole::Caller, CallStatus::Accepted) => {
                if let Some(answer) = &record.answer {
                    let session = self
                        .with_call(token, |call| {
                            if call.remote_applied {
                                None
                            } else {
                                call.remote_applied = true;
                                call.session.clone()
                            }
                        })
                        .flatten();

                    if let Some(session) = session {
                        if let Err(e) = session.apply_remote_description(answer).await {
                            error!(call_id = %record.id, error = %e, "Failed to apply answer");
                            self.finish(token, CallOutcome::Failed, Some(e.into())).await;
                            return;
                        }
                        self.mark_connected(token);
                    }
                }
            }
            _ => {}
        }

        self.apply_remote_candidates(token, role, &record).await;
    }

    async fn apply_remote_candidates(&self, token: u64, role: CallRole, record: &CallRecord) {
        let pending = self
            .with_call(token, |call| {
                if !call.remote_applied {
                    return None;
                }
                let remote = record.candidates(role.remote());
                let fresh = remote.get(call.remote_candidates..).unwrap_or_default().to_vec();
                call.remote_candidates = remote.len();
                call.session.clone().map(|session| (session, fresh))
            })
            .flatten();

        let Some((session, fresh)) = pending else {
            return;
        };
        for candidate in &fresh {
            debug!(call_id = %record.id, "Applying remote candidate");
            session.apply_remote_candidate(candidate).await;
        }
    }

    fn mark_connected(&self, token: u64) {
        let connected = self
            .with_call(token, |call| {
                if call.status == SessionStatus::Connected {
                    return None;
                }
                call.status = SessionStatus::Connected;
                call.timer.start();
                self.publish(call);
                call.call_id.clone()
            })
            .flatten();

        if let Some(call_id) = connected {
            info!(call_id = %call_id, "Call connected");
            self.emit(CallEvent::Connected { call_id });
        }
    }

    /// Write `update` on behalf of `role`. Fields owned by the other party
    /// are never written.
    async fn write(
        &self,
        role: CallRole,
        call_id: &CallId,
        update: RecordUpdate,
    ) -> Result<(), CallError> {
        self.store.update_as(role, call_id, update).await?;
        Ok(())
    }

    async fn mark_ended(&self, role: CallRole, call_id: &CallId, duration: u64) {
        let mut update = RecordUpdate::new().status(CallStatus::Ended);
        if duration > 0 {
            update = update.duration(duration);
        }
        if let Err(e) = self.write(role, call_id, update).await {
            warn!(call_id = %call_id, error = %e, "Failed to mark call ended");
        }
    }

    /// The single teardown path. Only the first caller for a given token does
    /// anything; later ones return `false`.
    async fn finish(&self, token: u64, outcome: CallOutcome, error: Option<CallError>) -> bool {
        let mut call = {
            let mut slot = self.lock();
            match &*slot {
                Slot::Active(call) if call.token == token => {}
                _ => return false,
            }
            match std::mem::replace(&mut *slot, Slot::Idle) {
                Slot::Active(call) => call,
                Slot::Idle => return false,
            }
        };

        call.timer.stop();
        let duration = call.timer.elapsed_secs();
        let _ = call.shutdown.send(true);

        if let Some(session) = call.session.take() {
            session.teardown().await;
        }

        if let Some(call_id) = &call.call_id {
            // A declined record is already final.
            if outcome != CallOutcome::Declined {
                self.mark_ended(call.role, call_id, duration).await;
            }

            let (caller, receiver, direction) = match call.role {
                CallRole::Caller => (self.local.clone(), call.peer.clone(), CallDirection::Outgoing),
                CallRole::Receiver => (call.peer.clone(), self.local.clone(), CallDirection::Incoming),
            };
            let log = CallLog {
                call_id: call_id.clone(),
                caller,
                receiver,
                direction,
                timestamp: call.timestamp,
                duration_secs: duration,
                outcome,
                call_type: CallType::Audio,
            };
            if let Err(e) = self.history.record(&log) {
                warn!(call_id = %call_id, error = %e, "Failed to record call log");
            }
        }

        // A new call may already have claimed the slot while we tore down.
        if let Slot::Idle = &*self.lock() {
            self.view.send_replace(None);
            self.idle.send_replace(true);
        }

        info!(
            call_id = ?call.call_id,
            outcome = %outcome,
            duration,
            "Call ended"
        );
        if let Some(error) = error {
            self.emit(CallEvent::Failed { error });
        }
        self.emit(CallEvent::Ended {
            call_id: call.call_id.clone(),
            outcome,
            duration_secs: duration,
        });
        true
    }
}
