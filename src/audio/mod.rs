//! Audio capture module
//!
//! The [`Recorder`] trait is the seam between the session coordinator and the
//! capture hardware: the daemon uses the cpal implementation, tests use the
//! scripted in-memory one. A recorder owns the capture graph and the scratch
//! file; levels flow out through a single-slot watch channel so the overlay
//! sees at most one pending update per frame.

pub mod device;
pub mod recorder;
pub mod scripted;

pub use device::{enumerate_devices, AudioDevice, DeviceRegistry, DevicesChanged};
pub use recorder::CpalRecorder;

use crate::error::AudioError;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// Capture sample rate (mono float, converted to 16-bit on upload)
pub const SAMPLE_RATE: u32 = 44_100;

/// Recordings shorter than this are treated as accidental hotkey presses
pub const MIN_RECORDING_SECS: f32 = 0.3;

/// A recording in progress (or just finished): where the PCM lives and how
/// it is shaped. Exactly one handle exists at a time; the byte counter grows
/// monotonically while the capture callback appends.
#[derive(Debug, Clone)]
pub struct RecordingHandle {
    pub path: PathBuf,
    pub sample_rate: u32,
    pub channels: u16,
    pub started_at: Instant,
    bytes: Arc<AtomicU64>,
}

impl RecordingHandle {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            sample_rate: SAMPLE_RATE,
            channels: 1,
            started_at: Instant::now(),
            bytes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Seconds of audio captured so far
    pub fn duration_secs(&self) -> f32 {
        // 4 bytes per f32 sample, mono
        self.bytes_written() as f32 / 4.0 / self.sample_rate as f32
    }
}

/// Capability trait for audio capture, so tests can substitute an in-memory
/// implementation that emits scripted level samples and synthesized PCM.
#[async_trait::async_trait]
pub trait Recorder: Send {
    /// Start capturing from `device` into the scratch file. Fails with
    /// `PermissionDenied` without microphone access and `DeviceUnavailable`
    /// when neither the device nor the default input can be started.
    async fn start(&mut self, device: AudioDevice) -> Result<RecordingHandle, AudioError>;

    /// Flush and close the scratch file. Idempotent: returns `Ok(None)` when
    /// nothing was recording.
    async fn stop(&mut self) -> Result<Option<RecordingHandle>, AudioError>;

    /// Rebuild the capture graph against another device. When a recording is
    /// active the scratch file keeps appending across the switch.
    async fn set_device(&mut self, device: AudioDevice) -> Result<(), AudioError>;

    /// Coalescing level feed, normalized to [0, 1]
    fn levels(&self) -> watch::Receiver<f32>;

    fn is_recording(&self) -> bool;
}

/// Root-mean-square of a sample buffer
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Normalize an RMS value to a 0..1 meter level over an 80 dB range.
pub fn level_from_rms(rms: f32) -> f32 {
    if rms <= 0.0 {
        return 0.0;
    }
    ((20.0 * rms.log10() + 80.0) / 80.0).clamp(0.0, 1.0)
}
