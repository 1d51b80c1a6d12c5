//! Transport negotiator seam.
//!
//! The call state machine drives a peer-to-peer session through
//! [`MediaBackend`] and [`PeerSession`] and hears back through a single
//! [`TransportEvent`] channel. Local connectivity candidates are pushed into a
//! caller-supplied [`CandidateSink`]; nothing here knows about the signaling
//! store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use murmur_shared::{CandidatePayload, SessionDescription};

/// Why the microphone could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MicrophoneReason {
    PermissionDenied,
    DeviceNotFound,
    DeviceBusy,
    ConstraintsUnsatisfiable,
    InsecureContext,
}

impl MicrophoneReason {
    /// Actionable text for the user.
    pub fn user_message(self) -> &'static str {
        match self {
            Self::PermissionDenied => {
                "Microphone access was denied. Allow microphone access in your system settings and try again."
            }
            Self::DeviceNotFound => "No microphone was found. Connect a microphone and try again.",
            Self::DeviceBusy => {
                "The microphone is in use by another application. Close it and try again."
            }
            Self::ConstraintsUnsatisfiable => {
                "The microphone does not support the required audio format."
            }
            Self::InsecureContext => "Calls require a secure connection.",
        }
    }
}

impl std::fmt::Display for MicrophoneReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PermissionDenied => "permission denied",
            Self::DeviceNotFound => "device not found",
            Self::DeviceBusy => "device busy",
            Self::ConstraintsUnsatisfiable => "constraints unsatisfiable",
            Self::InsecureContext => "insecure context",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Microphone unavailable: {0}")]
    MicrophoneUnavailable(MicrophoneReason),

    /// Malformed or out-of-order session description.
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Session already closed")]
    SessionClosed,

    #[error("WebRTC error: {0}")]
    WebRtc(String),
}

/// Where local connectivity candidates go once discovered.
pub type CandidateSink = mpsc::UnboundedSender<CandidatePayload>;

/// The single listener registered for a session's events.
pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// Inbound remote media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAudio {
    pub track_id: String,
}

/// Everything a session reports back to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Failed,
    Closed,
    RemoteTrack(RemoteAudio),
}

/// A live microphone capture.
///
/// Owns the device for as long as it exists; dropping it stops every track.
pub struct LocalAudio {
    frames: Option<mpsc::Receiver<Vec<f32>>>,
    muted: Arc<AtomicBool>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LocalAudio {
    /// `release` runs exactly once, when the capture is released or dropped.
    pub fn new(
        frames: mpsc::Receiver<Vec<f32>>,
        muted: Arc<AtomicBool>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            frames: Some(frames),
            muted,
            release: Some(Box::new(release)),
        }
    }

    /// Hand the captured frames to whoever sends them.
    pub fn take_frames(&mut self) -> Option<mpsc::Receiver<Vec<f32>>> {
        self.frames.take()
    }

    pub fn mute_flag(&self) -> Arc<AtomicBool> {
        self.muted.clone()
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Stop capturing. Safe to call more than once.
    pub fn release(&mut self) {
        self.frames = None;
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for LocalAudio {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for LocalAudio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAudio")
            .field("muted", &self.is_muted())
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// Factory for microphone captures and peer sessions.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    async fn request_local_audio(&self) -> Result<LocalAudio, MediaError>;

    /// Allocate one session. Local candidates are pushed into `candidates`
    /// only after a local description has been set.
    async fn create_session(
        &self,
        audio: LocalAudio,
        candidates: CandidateSink,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerSession>, MediaError>;
}

/// One peer-to-peer audio session.
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Build an offer and install it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    /// Build an answer and install it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn apply_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), MediaError>;

    /// Best-effort; failures are logged and dropped.
    async fn apply_remote_candidate(&self, candidate: &CandidatePayload);

    /// Gate outbound audio. No renegotiation.
    fn set_muted(&self, muted: bool);

    /// Close the transport, stop capture, detach playback. Idempotent.
    async fn teardown(&self);
}
