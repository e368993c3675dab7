//! cpal-based recorder
//!
//! cpal::Stream is not Send, so the stream lives on a dedicated thread and is
//! commanded over channels. The hound writer is shared with the capture
//! callback and survives stream rebuilds: a mid-recording device switch keeps
//! appending to the same scratch file.

use super::{level_from_rms, rms, AudioDevice, Recorder, RecordingHandle, SAMPLE_RATE};
use crate::error::AudioError;
use crate::permissions::{Permission, PermissionGate};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::{oneshot, watch};

/// Wireless devices renegotiate their audio profile on open; give them time.
const WIRELESS_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// How long to wait for the stream thread to come up or acknowledge a stop
const STREAM_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

type SharedWriter = Arc<Mutex<Option<hound::WavWriter<BufWriter<File>>>>>;

enum StreamCommand {
    Stop(oneshot::Sender<()>),
}

/// Handle to the dedicated capture thread
struct StreamWorker {
    cmd_tx: std::sync::mpsc::Sender<StreamCommand>,
    thread: Option<thread::JoinHandle<()>>,
}

/// Recorder implementation over cpal
pub struct CpalRecorder {
    permissions: PermissionGate,
    path: PathBuf,
    writer: SharedWriter,
    handle: Option<RecordingHandle>,
    worker: Option<StreamWorker>,
    level_tx: Arc<watch::Sender<f32>>,
    level_rx: watch::Receiver<f32>,
}

impl CpalRecorder {
    /// `path` is the scratch file, truncated on every new recording.
    pub fn new(permissions: PermissionGate, path: PathBuf) -> Self {
        let (level_tx, level_rx) = watch::channel(0.0);
        Self {
            permissions,
            path,
            writer: Arc::new(Mutex::new(None)),
            handle: None,
            worker: None,
            level_tx: Arc::new(level_tx),
            level_rx,
        }
    }

    /// Build and start the capture stream, falling back to the system default
    /// device on failure (once).
    async fn spawn_stream_with_fallback(&mut self, device: AudioDevice) -> Result<(), AudioError> {
        if !device.is_default() {
            try_set_system_default(&device);
        }
        if device.is_wireless() {
            tracing::debug!("wireless device '{}', waiting before start", device.name);
            tokio::time::sleep(WIRELESS_SETTLE_DELAY).await;
        }

        match self.spawn_stream(device.clone()).await {
            Ok(()) => Ok(()),
            Err(e) if !device.is_default() => {
                tracing::warn!(
                    "failed to start capture on '{}' ({e}), retrying on the system default",
                    device.name
                );
                self.spawn_stream(AudioDevice::default_input())
                    .await
                    .map_err(|_| AudioError::DeviceUnavailable(device.name))
            }
            Err(e) => {
                tracing::error!("failed to start capture on the system default: {e}");
                Err(AudioError::DeviceUnavailable(device.name))
            }
        }
    }

    /// Spawn the capture thread and wait for its startup handshake.
    async fn spawn_stream(&mut self, device: AudioDevice) -> Result<(), AudioError> {
        let (cmd_tx, cmd_rx) = std::sync::mpsc::channel::<StreamCommand>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), AudioError>>();

        let writer = self.writer.clone();
        let handle = self
            .handle
            .clone()
            .ok_or_else(|| AudioError::Stream("no active recording handle".to_string()))?;
        let level_tx = self.level_tx.clone();

        let thread = thread::spawn(move || {
            run_capture_thread(device, writer, handle, level_tx, ready_tx, cmd_rx);
        });

        let worker = StreamWorker {
            cmd_tx,
            thread: Some(thread),
        };

        match tokio::time::timeout(STREAM_HANDSHAKE_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                self.worker = Some(worker);
                Ok(())
            }
            Ok(Ok(Err(e))) => {
                join_worker(worker).await;
                Err(e)
            }
            Ok(Err(_)) | Err(_) => {
                join_worker(worker).await;
                Err(AudioError::Stream(
                    "capture thread did not start in time".to_string(),
                ))
            }
        }
    }

    /// Stop the capture thread, leaving the writer untouched.
    async fn teardown_stream(&mut self) {
        if let Some(worker) = self.worker.take() {
            let (ack_tx, ack_rx) = oneshot::channel();
            if worker.cmd_tx.send(StreamCommand::Stop(ack_tx)).is_ok() {
                let _ = tokio::time::timeout(STREAM_HANDSHAKE_TIMEOUT, ack_rx).await;
            }
            join_worker(worker).await;
        }
        let _ = self.level_tx.send(0.0);
    }

    /// Finalize the writer and clear all recording state.
    fn close_writer(&mut self) -> Result<(), AudioError> {
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        self.handle = None;
        if let Some(writer) = writer {
            writer
                .finalize()
                .map_err(|e| AudioError::Io(format!("failed to finalize recording: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Recorder for CpalRecorder {
    async fn start(&mut self, device: AudioDevice) -> Result<RecordingHandle, AudioError> {
        if self.is_recording() {
            return Err(AudioError::Stream("a recording is already active".to_string()));
        }
        if !self.permissions.granted(Permission::Microphone) {
            self.permissions.request(Permission::Microphone);
            return Err(AudioError::PermissionDenied);
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AudioError::Io(format!("failed to create {parent:?}: {e}")))?;
        }

        // Truncates any previous scratch file.
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let writer = hound::WavWriter::create(&self.path, spec)
            .map_err(|e| AudioError::Io(format!("failed to open {:?}: {e}", self.path)))?;
        *self
            .writer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(writer);

        let handle = RecordingHandle::new(self.path.clone());
        self.handle = Some(handle.clone());

        if let Err(e) = self.spawn_stream_with_fallback(device).await {
            // Leave nothing half-torn-down.
            let _ = self.close_writer();
            return Err(e);
        }

        tracing::info!("recording started ({:?})", self.path);
        Ok(handle)
    }

    async fn stop(&mut self) -> Result<Option<RecordingHandle>, AudioError> {
        if self.worker.is_none() && self.handle.is_none() {
            return Ok(None);
        }

        self.teardown_stream().await;

        let handle = self.handle.clone();
        self.close_writer()?;
        if let Some(ref h) = handle {
            tracing::info!(
                "recording stopped ({:.1}s, {} bytes)",
                h.duration_secs(),
                h.bytes_written()
            );
        }
        Ok(handle)
    }

    async fn set_device(&mut self, device: AudioDevice) -> Result<(), AudioError> {
        let recording = self.is_recording();
        self.teardown_stream().await;

        if recording {
            tracing::info!("switching capture to '{}' mid-recording", device.name);
            if let Err(e) = self.spawn_stream_with_fallback(device).await {
                let _ = self.close_writer();
                return Err(e);
            }
        }
        Ok(())
    }

    fn levels(&self) -> watch::Receiver<f32> {
        self.level_rx.clone()
    }

    fn is_recording(&self) -> bool {
        self.worker.is_some() && self.handle.is_some()
    }
}

async fn join_worker(worker: StreamWorker) {
    let StreamWorker { cmd_tx, thread } = worker;
    // Dropping the command channel unblocks a thread still waiting in recv.
    drop(cmd_tx);
    if let Some(thread) = thread {
        let _ = tokio::task::spawn_blocking(move || thread.join()).await;
    }
}

/// Body of the dedicated capture thread: resolve the device, build and play
/// the stream, report startup, then block until told to stop.
fn run_capture_thread(
    device: AudioDevice,
    writer: SharedWriter,
    handle: RecordingHandle,
    level_tx: Arc<watch::Sender<f32>>,
    ready_tx: oneshot::Sender<Result<(), AudioError>>,
    cmd_rx: std::sync::mpsc::Receiver<StreamCommand>,
) {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    let host = cpal::default_host();
    let cpal_device = if device.is_default() {
        match host.default_input_device() {
            Some(d) => d,
            None => {
                let _ = ready_tx.send(Err(AudioError::DeviceUnavailable("default".to_string())));
                return;
            }
        }
    } else {
        match find_input_device(&host, &device.uid) {
            Ok(d) => d,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        }
    };

    let supported = match cpal_device.default_input_config() {
        Ok(c) => c,
        Err(e) => {
            let _ = ready_tx.send(Err(AudioError::Stream(e.to_string())));
            return;
        }
    };

    let source_rate = supported.sample_rate().0;
    let source_channels = supported.channels() as usize;
    let sample_format = supported.sample_format();
    let stream_config = cpal::StreamConfig {
        channels: supported.channels(),
        sample_rate: supported.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    };

    tracing::debug!(
        "capture config: {} Hz, {} channel(s), {:?}",
        source_rate,
        source_channels,
        sample_format
    );

    let err_fn = |err| tracing::warn!("audio stream error: {err}");
    let sink = SampleSink {
        writer,
        handle,
        level_tx,
        source_rate,
        source_channels,
    };

    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(&cpal_device, &stream_config, sink, err_fn),
        cpal::SampleFormat::I16 => build_stream::<i16>(&cpal_device, &stream_config, sink, err_fn),
        cpal::SampleFormat::U16 => build_stream::<u16>(&cpal_device, &stream_config, sink, err_fn),
        format => {
            let _ = ready_tx.send(Err(AudioError::Stream(format!(
                "unsupported sample format: {format:?}"
            ))));
            return;
        }
    };

    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(AudioError::Stream(e.to_string())));
        return;
    }

    let _ = ready_tx.send(Ok(()));
    tracing::debug!("capture thread running");

    if let Ok(StreamCommand::Stop(ack)) = cmd_rx.recv() {
        drop(stream);
        let _ = ack.send(());
    }
    tracing::debug!("capture thread stopped");
}

/// Everything the capture callback needs
struct SampleSink {
    writer: SharedWriter,
    handle: RecordingHandle,
    level_tx: Arc<watch::Sender<f32>>,
    source_rate: u32,
    source_channels: usize,
}

/// Build an input stream for a specific sample type
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sink: SampleSink,
    err_fn: impl Fn(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    use cpal::traits::DeviceTrait;

    let SampleSink {
        writer,
        handle,
        level_tx,
        source_rate,
        source_channels,
    } = sink;

    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                // Convert to f32 and mix to mono
                let mono: Vec<f32> = data
                    .chunks(source_channels)
                    .map(|frame| {
                        let sum: f32 = frame
                            .iter()
                            .map(|&s| <f32 as cpal::FromSample<T>>::from_sample_(s))
                            .sum();
                        sum / source_channels as f32
                    })
                    .collect();

                let samples = if source_rate != SAMPLE_RATE {
                    resample(&mono, source_rate, SAMPLE_RATE)
                } else {
                    mono
                };

                if let Ok(mut guard) = writer.lock() {
                    if let Some(ref mut w) = *guard {
                        for &s in &samples {
                            if w.write_sample(s).is_err() {
                                // The writer surfaces the error again on
                                // finalize; keep the callback non-blocking.
                                break;
                            }
                        }
                        handle.add_bytes(samples.len() as u64 * 4);
                    }
                }

                let _ = level_tx.send(level_from_rms(rms(&samples)));
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::Stream(e.to_string()))?;

    Ok(stream)
}

/// Find an input device by UID: exact match first, then substring
/// (case-insensitive).
fn find_input_device(host: &cpal::Host, uid: &str) -> Result<cpal::Device, AudioError> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let devices: Vec<cpal::Device> = host
        .input_devices()
        .map_err(|e| AudioError::Stream(e.to_string()))?
        .collect();

    for device in &devices {
        if device.name().map(|n| n == uid).unwrap_or(false) {
            return host
                .input_devices()
                .map_err(|e| AudioError::Stream(e.to_string()))?
                .find(|d| d.name().map(|n| n == uid).unwrap_or(false))
                .ok_or_else(|| AudioError::DeviceUnavailable(uid.to_string()));
        }
    }

    let needle = uid.to_lowercase();
    for device in devices {
        if let Ok(name) = device.name() {
            if name.to_lowercase().contains(&needle) {
                tracing::debug!("matched device '{}' by substring for '{}'", name, uid);
                return Ok(device);
            }
        }
    }

    Err(AudioError::DeviceUnavailable(uid.to_string()))
}

/// Linear interpolation resampling
pub(crate) fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let new_len = (samples.len() as f64 * ratio).ceil() as usize;
    let mut output = Vec::with_capacity(new_len);

    for i in 0..new_len {
        let src_idx = i as f64 / ratio;
        let idx = src_idx.floor() as usize;
        let frac = (src_idx - idx as f64) as f32;

        let sample = if idx + 1 < samples.len() {
            samples[idx] * (1.0 - frac) + samples[idx + 1] * frac
        } else {
            samples.get(idx).copied().unwrap_or(0.0)
        };

        output.push(sample);
    }

    output
}

/// Best-effort attempt to move the OS default input to the selected device.
/// Many sandboxes forbid this; every failure is ignored.
fn try_set_system_default(device: &AudioDevice) {
    #[cfg(target_os = "linux")]
    {
        match std::process::Command::new("pactl")
            .args(["set-default-source", &device.uid])
            .status()
        {
            Ok(status) if status.success() => {
                tracing::debug!("set system default input to '{}'", device.name)
            }
            _ => tracing::debug!("could not set system default input (ignored)"),
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = device;
    }
}
