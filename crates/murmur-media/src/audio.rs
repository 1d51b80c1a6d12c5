use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::transport::{LocalAudio, MediaError, MicrophoneReason};

#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
            frame_size_ms: 20,
        }
    }
}

impl AudioConfig {
    pub fn frame_size_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_size_ms as usize) / 1000
    }

    fn stream_config(&self) -> cpal::StreamConfig {
        cpal::StreamConfig {
            channels: self.channels,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        }
    }
}

/// Map a backend error string onto a reason the user can act on.
fn classify_backend_error(description: &str) -> MicrophoneReason {
    let lower = description.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        MicrophoneReason::PermissionDenied
    } else if lower.contains("secure") {
        MicrophoneReason::InsecureContext
    } else {
        MicrophoneReason::DeviceBusy
    }
}

fn build_error_reason(err: &cpal::BuildStreamError) -> MicrophoneReason {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => MicrophoneReason::DeviceBusy,
        cpal::BuildStreamError::StreamConfigNotSupported
        | cpal::BuildStreamError::InvalidArgument => MicrophoneReason::ConstraintsUnsatisfiable,
        other => classify_backend_error(&other.to_string()),
    }
}

fn play_error_reason(err: &cpal::PlayStreamError) -> MicrophoneReason {
    match err {
        cpal::PlayStreamError::DeviceNotAvailable => MicrophoneReason::DeviceBusy,
        other => classify_backend_error(&other.to_string()),
    }
}

/// Build and start the input stream. Runs on the capture thread, since
/// `cpal::Stream` must stay on the thread that created it.
fn build_capture_stream(
    config: &AudioConfig,
    frame_tx: mpsc::Sender<Vec<f32>>,
    muted: Arc<AtomicBool>,
) -> Result<cpal::Stream, MicrophoneReason> {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(MicrophoneReason::DeviceNotFound)?;

    info!(device = ?device.name(), "Using input device");

    let frame_size = config.frame_size_samples();
    let mut buffer = Vec::with_capacity(frame_size);

    let stream = device
        .build_input_stream(
            &config.stream_config(),
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                if muted.load(Ordering::Relaxed) {
                    // Send silence when muted so the remote side stays in sync
                    buffer.extend(std::iter::repeat(0.0f32).take(data.len()));
                } else {
                    buffer.extend_from_slice(data);
                }
                while buffer.len() >= frame_size {
                    let frame: Vec<f32> = buffer.drain(..frame_size).collect();
                    if frame_tx.try_send(frame).is_err() {
                        debug!("Audio frame channel full, dropping frame");
                    }
                }
            },
            move |err| {
                error!("Audio input error: {err}");
            },
            None,
        )
        .map_err(|e| {
            warn!(error = %e, "Failed to build input stream");
            build_error_reason(&e)
        })?;

    stream.play().map_err(|e| {
        warn!(error = %e, "Failed to start input stream");
        play_error_reason(&e)
    })?;

    Ok(stream)
}

/// Open the default microphone.
///
/// The stream lives on a dedicated thread until the returned [`LocalAudio`]
/// is released or dropped, at which point the device is closed.
pub async fn open_microphone(config: &AudioConfig) -> Result<LocalAudio, MediaError> {
    let (frame_tx, frame_rx) = mpsc::channel::<Vec<f32>>(64);
    let muted = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), MicrophoneReason>>();
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

    let config = config.clone();
    let muted_cb = muted.clone();
    std::thread::Builder::new()
        .name("murmur-capture".into())
        .spawn(move || match build_capture_stream(&config, frame_tx, muted_cb) {
            Ok(stream) => {
                let _ = ready_tx.send(Ok(()));
                // Blocks until released (or the sender is dropped).
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Audio capture stopped");
            }
            Err(reason) => {
                let _ = ready_tx.send(Err(reason));
            }
        })
        .map_err(|e| MediaError::WebRtc(format!("failed to spawn capture thread: {e}")))?;

    match ready_rx.await {
        Ok(Ok(())) => {
            debug!("Audio capture started");
            Ok(LocalAudio::new(frame_rx, muted, move || {
                let _ = stop_tx.send(());
            }))
        }
        Ok(Err(reason)) => Err(MediaError::MicrophoneUnavailable(reason)),
        Err(_) => Err(MediaError::MicrophoneUnavailable(MicrophoneReason::DeviceBusy)),
    }
}

/// Speaker output for the remote party's audio.
///
/// Dropping it closes the output stream.
pub struct AudioPlayback {
    frames: std_mpsc::Sender<Vec<f32>>,
    stop: std_mpsc::Sender<()>,
}

impl AudioPlayback {
    pub async fn open(config: &AudioConfig) -> Result<Self, MediaError> {
        let (frames_tx, frames_rx) = std_mpsc::channel::<Vec<f32>>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let config = config.clone();
        std::thread::Builder::new()
            .name("murmur-playback".into())
            .spawn(move || match build_playback_stream(&config, frames_rx) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    let _ = stop_rx.recv();
                    drop(stream);
                    debug!("Audio playback stopped");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| MediaError::WebRtc(format!("failed to spawn playback thread: {e}")))?;

        match ready_rx.await {
            Ok(Ok(())) => {
                debug!("Audio playback started");
                Ok(Self {
                    frames: frames_tx,
                    stop: stop_tx,
                })
            }
            Ok(Err(e)) => Err(MediaError::WebRtc(e)),
            Err(_) => Err(MediaError::WebRtc("playback thread exited".into())),
        }
    }

    /// Queue one frame at the playback rate.
    pub fn push(&self, frame: Vec<f32>) {
        let _ = self.frames.send(frame);
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        let _ = self.stop.send(());
    }
}

fn build_playback_stream(
    config: &AudioConfig,
    frames_rx: std_mpsc::Receiver<Vec<f32>>,
) -> Result<cpal::Stream, String> {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| "no output device available".to_string())?;

    info!(device = ?device.name(), "Using output device");

    let mut play_buffer: std::collections::VecDeque<f32> = std::collections::VecDeque::new();

    let stream = device
        .build_output_stream(
            &config.stream_config(),
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                // Drain available frames into play buffer
                while let Ok(frame) = frames_rx.try_recv() {
                    play_buffer.extend(frame.iter());
                }

                for sample in data.iter_mut() {
                    *sample = play_buffer.pop_front().unwrap_or(0.0);
                }
            },
            move |err| {
                error!("Audio output error: {err}");
            },
            None,
        )
        .map_err(|e| e.to_string())?;

    stream.play().map_err(|e| e.to_string())?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size() {
        assert_eq!(AudioConfig::default().frame_size_samples(), 960);
    }

    #[test]
    fn test_build_error_mapping() {
        assert_eq!(
            build_error_reason(&cpal::BuildStreamError::DeviceNotAvailable),
            MicrophoneReason::DeviceBusy
        );
        assert_eq!(
            build_error_reason(&cpal::BuildStreamError::StreamConfigNotSupported),
            MicrophoneReason::ConstraintsUnsatisfiable
        );
    }

    #[test]
    fn test_backend_error_classification() {
        assert_eq!(
            classify_backend_error("Permission denied by the user"),
            MicrophoneReason::PermissionDenied
        );
        assert_eq!(
            classify_backend_error("device is being used exclusively"),
            MicrophoneReason::DeviceBusy
        );
    }
}
