//! Scripted media backend for exercising the call state machine without
//! audio devices or a network.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, Notify};

use murmur_media::{
    CandidateSink, LocalAudio, MediaBackend, MediaError, MicrophoneReason, PeerSession,
    TransportEvent, TransportEvents,
};
use murmur_shared::{CandidatePayload, SdpKind, SessionDescription};

#[derive(Default)]
struct Script {
    mic_error: Option<MicrophoneReason>,
    offer_gate: Option<Arc<Notify>>,
    sessions: Vec<Arc<FakeSession>>,
}

#[derive(Clone, Default)]
pub struct FakeMedia {
    label: &'static str,
    script: Arc<Mutex<Script>>,
    opened: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl FakeMedia {
    /// `label` tags the candidates this side emits.
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            ..Default::default()
        }
    }

    pub fn fail_microphone(&self, reason: MicrophoneReason) {
        self.script.lock().unwrap().mic_error = Some(reason);
    }

    /// Hold every `create_offer` until the returned gate is notified.
    pub fn gate_offers(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.script.lock().unwrap().offer_gate = Some(gate.clone());
        gate
    }

    pub fn sessions(&self) -> Vec<Arc<FakeSession>> {
        self.script.lock().unwrap().sessions.clone()
    }

    pub fn session(&self) -> Arc<FakeSession> {
        self.sessions().last().cloned().expect("no session created")
    }

    /// Microphones opened and not yet released.
    pub fn live_microphones(&self) -> usize {
        self.opened.load(Ordering::SeqCst) - self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaBackend for FakeMedia {
    async fn request_local_audio(&self) -> Result<LocalAudio, MediaError> {
        if let Some(reason) = self.script.lock().unwrap().mic_error {
            return Err(MediaError::MicrophoneUnavailable(reason));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        let released = self.released.clone();
        let (_frames, rx) = mpsc::channel(1);
        Ok(LocalAudio::new(rx, Arc::new(AtomicBool::new(false)), move || {
            released.fetch_add(1, Ordering::SeqCst);
        }))
    }

    async fn create_session(
        &self,
        audio: LocalAudio,
        candidates: CandidateSink,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerSession>, MediaError> {
        let gate = self.script.lock().unwrap().offer_gate.clone();
        let session = Arc::new(FakeSession {
            label: self.label,
            candidates,
            events,
            gate,
            audio: Mutex::new(Some(audio)),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            log: Mutex::new(Vec::new()),
            muted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.script.lock().unwrap().sessions.push(session.clone());
        Ok(session)
    }
}

pub struct FakeSession {
    label: &'static str,
    candidates: CandidateSink,
    events: TransportEvents,
    gate: Option<Arc<Notify>>,
    audio: Mutex<Option<LocalAudio>>,
    local: Mutex<Option<SdpKind>>,
    remote: Mutex<Option<SdpKind>>,
    log: Mutex<Vec<String>>,
    muted: AtomicBool,
    closed: AtomicBool,
}

impl FakeSession {
    /// Inject a transport event as if the peer connection produced it.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Every call made on the session, in order.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.log().iter().filter(|e| e.as_str() == entry).count()
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn push(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    fn set_local(&self, kind: SdpKind) -> SessionDescription {
        *self.local.lock().unwrap() = Some(kind);
        // Gathering starts once a local description is in place.
        let _ = self.candidates.send(CandidatePayload(json!({
            "candidate": format!("candidate:{}", self.label),
            "sdpMid": "0",
        })));
        let sdp = format!("v=0 {}", self.label);
        match kind {
            SdpKind::Offer => SessionDescription::offer(sdp),
            SdpKind::Answer => SessionDescription::answer(sdp),
        }
    }
}

#[async_trait]
impl PeerSession for FakeSession {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.is_closed() {
            return Err(MediaError::SessionClosed);
        }
        self.push("create_offer".into());
        Ok(self.set_local(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        if self.is_closed() {
            return Err(MediaError::SessionClosed);
        }
        if *self.remote.lock().unwrap() != Some(SdpKind::Offer) {
            return Err(MediaError::Negotiation("no remote offer".into()));
        }
        self.push("create_answer".into());
        Ok(self.set_local(SdpKind::Answer))
    }

    async fn apply_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), MediaError> {
        if self.is_closed() {
            return Err(MediaError::SessionClosed);
        }
        if description.kind == SdpKind::Answer && *self.local.lock().unwrap() != Some(SdpKind::Offer)
        {
            return Err(MediaError::Negotiation("answer without local offer".into()));
        }
        self.push(format!("remote:{}", description.sdp));
        *self.remote.lock().unwrap() = Some(description.kind);
        Ok(())
    }

    async fn apply_remote_candidate(&self, candidate: &CandidatePayload) {
        if self.is_closed() {
            return;
        }
        let text = candidate.0["candidate"].as_str().unwrap_or_default().to_string();
        self.push(format!("remote_candidate:{text}"));
    }

    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    async fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.push("teardown".into());
        self.audio.lock().unwrap().take();
        self.emit(TransportEvent::Closed);
    }
}
