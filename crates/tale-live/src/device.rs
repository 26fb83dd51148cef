//! Microphone capture with CPAL and speaker playback with Rodio.
//!
//! Both device handles are `!Send`, so each lives on its own thread and the adapters talk to
//! it over channels.

use crate::audio::{AudioConfig, AudioSource, PlaybackSink};
use crate::error::{LiveError, LiveResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::mpsc as std_mpsc;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Default input device, chunked to `AudioConfig::chunk_size`.
pub struct MicCapture {
    config: AudioConfig,
    stop_tx: Option<std_mpsc::Sender<()>>,
}

impl MicCapture {
    pub fn new(config: AudioConfig) -> Self {
        Self {
            config,
            stop_tx: None,
        }
    }

    /// List available input devices
    pub fn list_input_devices() -> LiveResult<Vec<String>> {
        let devices = cpal::default_host()
            .input_devices()
            .map_err(|e| LiveError::AudioDevice(e.to_string()))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

fn build_input_stream(
    config: &AudioConfig,
    chunks: mpsc::UnboundedSender<Vec<f32>>,
) -> LiveResult<cpal::Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| LiveError::AudioDevice("No input device available".to_string()))?;
    info!(
        target: "tale::live",
        device = %device.name().unwrap_or_else(|_| "Unknown".to_string()),
        rate = config.capture_sample_rate,
        "microphone selected"
    );
    let default_config = device.default_input_config()?;
    let stream_config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(config.capture_sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    tracing::debug!(target: "tale::live", ?default_config, "device default input config");

    let chunk_size = config.chunk_size.max(1);
    let mut pending = Vec::with_capacity(chunk_size);
    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            for &sample in data {
                pending.push(sample);
                if pending.len() >= chunk_size {
                    let chunk = std::mem::replace(&mut pending, Vec::with_capacity(chunk_size));
                    // receiver gone means the session closed; stop() follows shortly
                    let _ = chunks.send(chunk);
                }
            }
        },
        move |err| {
            warn!(target: "tale::live", "audio input stream error: {}", err);
        },
        None,
    )?;
    stream.play()?;
    Ok(stream)
}

impl AudioSource for MicCapture {
    fn start(&mut self, chunks: mpsc::UnboundedSender<Vec<f32>>) -> LiveResult<()> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<LiveResult<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let config = self.config.clone();
        std::thread::Builder::new()
            .name("tale-mic".to_string())
            .spawn(move || {
                let stream = match build_input_stream(&config, chunks) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // blocks until stop() or the adapter is dropped
                let _ = stop_rx.recv();
                drop(stream);
                info!(target: "tale::live", "microphone released");
            })
            .map_err(|e| LiveError::AudioDevice(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| LiveError::AudioDevice("capture thread exited".to_string()))??;
        self.stop_tx = Some(stop_tx);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Default output device.
pub struct SpeakerPlayback {
    handle: rodio::OutputStreamHandle,
    sink: Mutex<rodio::Sink>,
    sample_rate: u32,
    _keepalive: std_mpsc::Sender<()>,
}

impl SpeakerPlayback {
    pub fn new(config: &AudioConfig) -> LiveResult<Self> {
        let (handle_tx, handle_rx) = std_mpsc::channel();
        let (keepalive, hold) = std_mpsc::channel::<()>();
        std::thread::Builder::new()
            .name("tale-speaker".to_string())
            .spawn(move || match rodio::OutputStream::try_default() {
                Ok((stream, handle)) => {
                    let _ = handle_tx.send(Ok(handle));
                    // returns once every keepalive sender is dropped
                    let _ = hold.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = handle_tx.send(Err(LiveError::AudioDevice(e.to_string())));
                }
            })
            .map_err(|e| LiveError::AudioDevice(e.to_string()))?;

        let handle = handle_rx
            .recv()
            .map_err(|_| LiveError::AudioDevice("playback thread exited".to_string()))??;
        let sink =
            rodio::Sink::try_new(&handle).map_err(|e| LiveError::AudioDevice(e.to_string()))?;
        info!(target: "tale::live", rate = config.playback_sample_rate, "speaker ready");
        Ok(Self {
            handle,
            sink: Mutex::new(sink),
            sample_rate: config.playback_sample_rate,
            _keepalive: keepalive,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, rodio::Sink> {
        self.sink.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl PlaybackSink for SpeakerPlayback {
    fn enqueue(&self, samples: Vec<f32>) {
        self.lock()
            .append(rodio::buffer::SamplesBuffer::new(1, self.sample_rate, samples));
    }

    fn flush(&self) {
        let mut sink = self.lock();
        sink.stop();
        // a stopped sink stays stopped; swap in a fresh one
        match rodio::Sink::try_new(&self.handle) {
            Ok(fresh) => *sink = fresh,
            Err(e) => warn!(target: "tale::live", "could not recreate playback sink: {}", e),
        }
    }

    fn is_playing(&self) -> bool {
        !self.lock().empty()
    }
}
