//! Audio capture and playback, PCMU framing and the WebRTC transport for calls.

pub mod audio;
pub mod pcmu;
pub mod transport;
pub mod webrtc_peer;

pub use audio::{open_microphone, AudioConfig, AudioPlayback};
pub use transport::{
    CandidateSink, LocalAudio, MediaBackend, MediaError, MicrophoneReason, PeerSession,
    RemoteAudio, TransportEvent, TransportEvents,
};
pub use webrtc_peer::{IceServerConfig, WebRtcBackend, WebRtcSession};
