//! In-memory recorder for tests
//!
//! Emits scripted level samples and writes synthesized PCM to the scratch
//! path without touching audio hardware. Honors the same start/fallback
//! contract as the cpal recorder so the coordinator can be exercised
//! end-to-end.

use super::{AudioDevice, Recorder, RecordingHandle, SAMPLE_RATE};
use crate::error::AudioError;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Scripted recorder; build with the `with_*` methods.
pub struct ScriptedRecorder {
    path: PathBuf,
    samples: Vec<f32>,
    levels: Vec<f32>,
    failing_uids: Vec<String>,
    deny_permission: bool,
    handle: Option<RecordingHandle>,
    level_tx: Arc<watch::Sender<f32>>,
    level_rx: watch::Receiver<f32>,
    device_log: Arc<Mutex<Vec<AudioDevice>>>,
}

impl ScriptedRecorder {
    pub fn new(path: PathBuf) -> Self {
        let (level_tx, level_rx) = watch::channel(0.0);
        Self {
            path,
            // One second of a quiet 440 Hz tone by default
            samples: sine(440.0, 1.0, 0.2),
            levels: vec![0.4, 0.6, 0.5],
            failing_uids: Vec::new(),
            deny_permission: false,
            handle: None,
            level_tx: Arc::new(level_tx),
            level_rx,
            device_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// PCM written to the scratch file on start
    pub fn with_samples(mut self, samples: Vec<f32>) -> Self {
        self.samples = samples;
        self
    }

    /// Level values replayed through the watch channel while recording
    pub fn with_levels(mut self, levels: Vec<f32>) -> Self {
        self.levels = levels;
        self
    }

    /// Make a specific device UID refuse to start
    pub fn with_failing_device(mut self, uid: impl Into<String>) -> Self {
        self.failing_uids.push(uid.into());
        self
    }

    /// Simulate a missing microphone permission
    pub fn with_permission_denied(mut self) -> Self {
        self.deny_permission = true;
        self
    }

    /// Every device a capture stream was (re)built against, in order
    pub fn device_log(&self) -> Arc<Mutex<Vec<AudioDevice>>> {
        self.device_log.clone()
    }

    fn write_scratch_file(&self) -> Result<(), AudioError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AudioError::Io(e.to_string()))?;
        }
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(&self.path, spec)
            .map_err(|e| AudioError::Io(e.to_string()))?;
        for &s in &self.samples {
            writer
                .write_sample(s)
                .map_err(|e| AudioError::Io(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| AudioError::Io(e.to_string()))?;
        Ok(())
    }

    fn attach(&mut self, device: AudioDevice) -> Result<(), AudioError> {
        if self.failing_uids.contains(&device.uid) {
            return Err(AudioError::DeviceUnavailable(device.name));
        }
        self.device_log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(device);
        for &level in &self.levels {
            let _ = self.level_tx.send(level);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Recorder for ScriptedRecorder {
    async fn start(&mut self, device: AudioDevice) -> Result<RecordingHandle, AudioError> {
        if self.deny_permission {
            return Err(AudioError::PermissionDenied);
        }

        // Same one-retry fallback the cpal recorder performs.
        if let Err(e) = self.attach(device.clone()) {
            if device.is_default() {
                return Err(e);
            }
            self.attach(AudioDevice::default_input())
                .map_err(|_| AudioError::DeviceUnavailable(device.name))?;
        }

        self.write_scratch_file()?;
        let handle = RecordingHandle::new(self.path.clone());
        handle.add_bytes(self.samples.len() as u64 * 4);
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    async fn stop(&mut self) -> Result<Option<RecordingHandle>, AudioError> {
        let _ = self.level_tx.send(0.0);
        Ok(self.handle.take())
    }

    async fn set_device(&mut self, device: AudioDevice) -> Result<(), AudioError> {
        if self.handle.is_some() {
            if let Err(e) = self.attach(device.clone()) {
                if device.is_default() {
                    return Err(e);
                }
                self.attach(AudioDevice::default_input())
                    .map_err(|_| AudioError::DeviceUnavailable(device.name))?;
            }
        }
        Ok(())
    }

    fn levels(&self) -> watch::Receiver<f32> {
        self.level_rx.clone()
    }

    fn is_recording(&self) -> bool {
        self.handle.is_some()
    }
}

/// Synthesize a sine tone (mono, capture rate)
pub fn sine(freq: f32, secs: f32, amplitude: f32) -> Vec<f32> {
    let n = (secs * SAMPLE_RATE as f32) as usize;
    (0..n)
        .map(|i| {
            (i as f32 * freq * 2.0 * std::f32::consts::PI / SAMPLE_RATE as f32).sin() * amplitude
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_writes_scratch_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recording.caf");
        let mut rec = ScriptedRecorder::new(path.clone());

        let handle = rec.start(AudioDevice::default_input()).await.unwrap();
        assert!(path.exists());
        assert!(handle.bytes_written() > 0);
        assert!(rec.is_recording());

        let stopped = rec.stop().await.unwrap();
        assert!(stopped.is_some());
        assert!(!rec.is_recording());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = ScriptedRecorder::new(dir.path().join("recording.caf"));

        rec.start(AudioDevice::default_input()).await.unwrap();
        assert!(rec.stop().await.unwrap().is_some());
        assert!(rec.stop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failing_device_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = ScriptedRecorder::new(dir.path().join("recording.caf"))
            .with_failing_device("flaky-bt");
        let log = rec.device_log();

        let device = AudioDevice {
            uid: "flaky-bt".into(),
            name: "Flaky Bluetooth".into(),
            channels: 1,
        };
        rec.start(device).await.unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].is_default());
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec =
            ScriptedRecorder::new(dir.path().join("recording.caf")).with_permission_denied();

        let err = rec.start(AudioDevice::default_input()).await.unwrap_err();
        assert!(matches!(err, AudioError::PermissionDenied));
    }

    #[tokio::test]
    async fn test_levels_are_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = ScriptedRecorder::new(dir.path().join("recording.caf"))
            .with_levels(vec![0.25, 0.75]);
        let rx = rec.levels();

        rec.start(AudioDevice::default_input()).await.unwrap();
        // The watch channel coalesces; the last scripted value sticks.
        assert!((*rx.borrow() - 0.75).abs() < f32::EPSILON);
    }
}
