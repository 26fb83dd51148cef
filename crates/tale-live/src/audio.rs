//! Playback and capture ports.
//!
//! The session only sees these traits. [`BufferedPlayback`] and [`MemorySource`] serve headless
//! runs and tests; the `device` feature adds speaker and microphone adapters.

use crate::error::LiveResult;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Audio format on both sides of the session
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Microphone sample rate in Hz (default: 16000)
    pub capture_sample_rate: u32,

    /// Model audio sample rate in Hz (default: 24000)
    pub playback_sample_rate: u32,

    /// Samples per outbound chunk (default: 480, 30ms at 16kHz)
    pub chunk_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: 16000,
            playback_sample_rate: 24000,
            chunk_size: 480,
        }
    }
}

/// Where decoded model audio goes.
pub trait PlaybackSink: Send + Sync {
    /// Append one frame behind everything already queued.
    fn enqueue(&self, samples: Vec<f32>);

    /// Drop everything queued and stop the current sound (barge-in).
    fn flush(&self);

    fn is_playing(&self) -> bool;
}

/// Microphone, or anything that produces chunks in capture order.
pub trait AudioSource: Send {
    fn start(&mut self, chunks: mpsc::UnboundedSender<Vec<f32>>) -> LiveResult<()>;

    /// Stop capturing and release the device. Safe to call more than once.
    fn stop(&mut self);
}

/// FIFO playback queue drained by whoever renders audio.
#[derive(Debug, Default)]
pub struct BufferedPlayback {
    queue: Mutex<VecDeque<Vec<f32>>>,
    flushes: Mutex<usize>,
}

impl BufferedPlayback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next frame to render.
    pub fn next_frame(&self) -> Option<Vec<f32>> {
        self.lock().pop_front()
    }

    pub fn queued(&self) -> usize {
        self.lock().len()
    }

    /// How many times the queue was flushed.
    pub fn flush_count(&self) -> usize {
        *self.flushes.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Vec<f32>>> {
        self.queue.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl PlaybackSink for BufferedPlayback {
    fn enqueue(&self, samples: Vec<f32>) {
        self.lock().push_back(samples);
    }

    fn flush(&self) {
        self.lock().clear();
        *self.flushes.lock().unwrap_or_else(|p| p.into_inner()) += 1;
    }

    fn is_playing(&self) -> bool {
        !self.lock().is_empty()
    }
}

/// Source that replays fixed chunks, then stays open until stopped.
#[derive(Debug, Default)]
pub struct MemorySource {
    chunks: Vec<Vec<f32>>,
    sender: Option<mpsc::UnboundedSender<Vec<f32>>>,
    stopped: Arc<AtomicBool>,
}

impl MemorySource {
    pub fn new(chunks: Vec<Vec<f32>>) -> Self {
        Self {
            chunks,
            ..Default::default()
        }
    }

    /// Flag observers can poll to see whether `stop` ran.
    pub fn stopped_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stopped)
    }
}

impl AudioSource for MemorySource {
    fn start(&mut self, chunks: mpsc::UnboundedSender<Vec<f32>>) -> LiveResult<()> {
        for chunk in self.chunks.drain(..) {
            if chunks.send(chunk).is_err() {
                break;
            }
        }
        self.sender = Some(chunks);
        Ok(())
    }

    fn stop(&mut self) {
        self.sender = None;
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_config_defaults() {
        let config = AudioConfig::default();
        assert_eq!(config.capture_sample_rate, 16000);
        assert_eq!(config.playback_sample_rate, 24000);
        assert_eq!(config.chunk_size, 480);
    }

    #[test]
    fn buffered_playback_keeps_arrival_order() {
        let playback = BufferedPlayback::new();
        playback.enqueue(vec![0.1]);
        playback.enqueue(vec![0.2]);
        assert!(playback.is_playing());
        assert_eq!(playback.next_frame(), Some(vec![0.1]));
        assert_eq!(playback.next_frame(), Some(vec![0.2]));
        assert!(!playback.is_playing());
    }

    #[test]
    fn flush_drops_everything_queued() {
        let playback = BufferedPlayback::new();
        for i in 0..3 {
            playback.enqueue(vec![i as f32]);
        }
        playback.flush();
        assert_eq!(playback.queued(), 0);
        assert_eq!(playback.flush_count(), 1);
        assert_eq!(playback.next_frame(), None);
    }

    #[tokio::test]
    async fn memory_source_replays_then_closes_on_stop() {
        let mut source = MemorySource::new(vec![vec![0.5], vec![-0.5]]);
        let stopped = source.stopped_flag();
        let (tx, mut rx) = mpsc::unbounded_channel();
        source.start(tx).unwrap();
        assert_eq!(rx.recv().await, Some(vec![0.5]));
        assert_eq!(rx.recv().await, Some(vec![-0.5]));

        source.stop();
        source.stop();
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(rx.recv().await, None);
    }
}
