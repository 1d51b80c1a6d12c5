use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use murmur_shared::{CandidatePayload, SdpKind, SessionDescription};

use crate::audio::{open_microphone, AudioConfig, AudioPlayback};
use crate::pcmu;
use crate::transport::{
    CandidateSink, LocalAudio, MediaBackend, MediaError, PeerSession, RemoteAudio,
    TransportEvent, TransportEvents,
};

/// One STUN or TURN entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    fn to_rtc(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

fn webrtc_err(e: impl std::fmt::Display) -> MediaError {
    MediaError::WebRtc(e.to_string())
}

fn negotiation_err(e: impl std::fmt::Display) -> MediaError {
    MediaError::Negotiation(e.to_string())
}

/// Real media backend: cpal for the microphone and speaker, webrtc-rs for
/// the transport. Audio is carried as PCMU.
pub struct WebRtcBackend {
    ice_servers: Vec<IceServerConfig>,
    audio: AudioConfig,
}

impl WebRtcBackend {
    pub fn new(ice_servers: Vec<IceServerConfig>, audio: AudioConfig) -> Self {
        Self { ice_servers, audio }
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        let registry =
            register_default_interceptors(Registry::new(), &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.iter().map(IceServerConfig::to_rtc).collect(),
            ..Default::default()
        };

        let pc = api.new_peer_connection(config).await.map_err(webrtc_err)?;
        Ok(Arc::new(pc))
    }
}

#[async_trait]
impl MediaBackend for WebRtcBackend {
    async fn request_local_audio(&self) -> Result<LocalAudio, MediaError> {
        open_microphone(&self.audio).await
    }

    async fn create_session(
        &self,
        mut audio: LocalAudio,
        candidates: CandidateSink,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerSession>, MediaError> {
        let pc = self.new_peer_connection().await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: pcmu::SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_owned(),
            "murmur".to_owned(),
        ));

        let rtp_sender = match pc
            .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
        {
            Ok(sender) => sender,
            Err(e) => {
                let _ = pc.close().await;
                return Err(webrtc_err(e));
            }
        };

        // RTCP has to be read for the interceptors to work.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while let Ok((_, _)) = rtp_sender.read(&mut buf).await {}
        });

        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidates.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete");
                    return;
                };
                match candidate.to_json().map(|init| serde_json::to_value(init)) {
                    Ok(Ok(value)) => {
                        let _ = sink.send(CandidatePayload(value));
                    }
                    Ok(Err(e)) => warn!(error = %e, "Failed to serialize ICE candidate"),
                    Err(e) => warn!(error = %e, "Failed to encode ICE candidate"),
                }
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(?state, "Peer connection state changed");
            let event = match state {
                RTCPeerConnectionState::Connected => Some(TransportEvent::Connected),
                RTCPeerConnectionState::Disconnected => Some(TransportEvent::Disconnected),
                RTCPeerConnectionState::Failed => Some(TransportEvent::Failed),
                RTCPeerConnectionState::Closed => Some(TransportEvent::Closed),
                _ => None,
            };
            if let Some(event) = event {
                let _ = state_events.send(event);
            }
            Box::pin(async {})
        }));

        let track_events = events;
        let playback_config = self.audio.clone();
        let track_shutdown = shutdown_rx.clone();
        pc.on_track(Box::new(
            move |remote: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                let config = playback_config.clone();
                let shutdown = track_shutdown.clone();
                Box::pin(async move {
                    let track_id = remote.id();
                    info!(track = %track_id, "Remote audio track received");
                    let _ = events.send(TransportEvent::RemoteTrack(RemoteAudio { track_id }));
                    tokio::spawn(play_remote(remote, config, shutdown));
                })
            },
        ));

        let muted = audio.mute_flag();
        if let Some(frames) = audio.take_frames() {
            tokio::spawn(send_local(frames, track, self.audio.clone(), shutdown_rx));
        }

        Ok(Arc::new(WebRtcSession {
            pc,
            audio: Mutex::new(Some(audio)),
            muted,
            closed: AtomicBool::new(false),
            shutdown: shutdown_tx,
        }))
    }
}

fn resample_factor(config: &AudioConfig) -> usize {
    (config.sample_rate / pcmu::SAMPLE_RATE).max(1) as usize
}

async fn send_local(
    mut frames: mpsc::Receiver<Vec<f32>>,
    track: Arc<TrackLocalStaticSample>,
    config: AudioConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let factor = resample_factor(&config);
    let duration = Duration::from_millis(config.frame_size_ms as u64);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                let payload = pcmu::encode(&pcmu::downsample(&frame, factor));
                let sample = Sample {
                    data: Bytes::from(payload),
                    duration,
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    debug!(error = %e, "Failed to write audio sample");
                }
            }
        }
    }
    debug!("Local audio sender stopped");
}

async fn play_remote(
    remote: Arc<TrackRemote>,
    config: AudioConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let playback = match AudioPlayback::open(&config).await {
        Ok(playback) => Some(playback),
        Err(e) => {
            // Keep draining so the transport does not back up.
            warn!(error = %e, "Playback unavailable, remote audio will be discarded");
            None
        }
    };
    let factor = resample_factor(&config);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            packet = remote.read_rtp() => match packet {
                Ok((packet, _)) => {
                    if let Some(playback) = &playback {
                        playback.push(pcmu::upsample(&pcmu::decode(&packet.payload), factor));
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Remote track ended");
                    break;
                }
            },
        }
    }
}

/// A single webrtc-rs peer connection carrying one PCMU track each way.
pub struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    audio: Mutex<Option<LocalAudio>>,
    muted: Arc<AtomicBool>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl WebRtcSession {
    fn ensure_open(&self) -> Result<(), MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MediaError::SessionClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerSession for WebRtcSession {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        self.ensure_open()?;
        let offer = self.pc.create_offer(None).await.map_err(negotiation_err)?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(negotiation_err)?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        self.ensure_open()?;
        let answer = self.pc.create_answer(None).await.map_err(negotiation_err)?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(negotiation_err)?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn apply_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), MediaError> {
        self.ensure_open()?;
        let remote = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp.clone()),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp.clone()),
        }
        .map_err(negotiation_err)?;

        self.pc
            .set_remote_description(remote)
            .await
            .map_err(negotiation_err)
    }

    async fn apply_remote_candidate(&self, candidate: &CandidatePayload) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let init: RTCIceCandidateInit = match serde_json::from_value(candidate.0.clone()) {
            Ok(init) => init,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed remote candidate");
                return;
            }
        };
        if let Err(e) = self.pc.add_ice_candidate(init).await {
            warn!(error = %e, "Failed to add remote candidate");
        }
    }

    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    async fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);

        let audio = self
            .audio
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(audio);

        if let Err(e) = self.pc.close().await {
            warn!(error = %e, "Error closing peer connection");
        }
        debug!("Peer session torn down");
    }
}
