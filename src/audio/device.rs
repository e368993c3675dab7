//! Audio input device registry
//!
//! Devices are identified by a stable UID (the platform device name, which
//! survives reconnects). A synthetic `default` sentinel means "follow the OS
//! default input". The registry re-enumerates on a short interval and emits a
//! change event when devices appear or disappear, which is how hot-unplug of
//! the selected microphone is detected.

use crate::config::{SettingsSection, SettingsStore};
use crate::error::AudioError;
use std::time::Duration;
use tokio::sync::broadcast;

/// Re-enumeration interval for hot-plug detection
const WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// An audio input device, compared by UID
#[derive(Debug, Clone)]
pub struct AudioDevice {
    /// Stable identifier across reboots and reconnects
    pub uid: String,
    /// Human-readable name
    pub name: String,
    /// Input channel count, always >= 1
    pub channels: u16,
}

impl AudioDevice {
    /// UID of the synthetic "follow the OS default" device
    pub const DEFAULT_UID: &'static str = "default";

    /// The sentinel that follows the OS default input
    pub fn default_input() -> Self {
        Self {
            uid: Self::DEFAULT_UID.to_string(),
            name: "System Default".to_string(),
            channels: 1,
        }
    }

    pub fn is_default(&self) -> bool {
        self.uid == Self::DEFAULT_UID
    }

    /// Wireless devices need a settle delay before the stream starts
    pub fn is_wireless(&self) -> bool {
        let name = self.name.to_lowercase();
        name.contains("airpods") || name.contains("bluetooth")
    }
}

impl PartialEq for AudioDevice {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl Eq for AudioDevice {}

/// Hot-plug notification: which devices appeared and disappeared
#[derive(Debug, Clone)]
pub struct DevicesChanged {
    pub added: Vec<AudioDevice>,
    pub removed: Vec<AudioDevice>,
}

/// Enumerate capture devices with at least one input channel
pub fn enumerate_devices() -> Result<Vec<AudioDevice>, AudioError> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| AudioError::Stream(e.to_string()))?;

    let mut result = Vec::new();
    for device in devices {
        let Ok(name) = device.name() else { continue };
        let Ok(config) = device.default_input_config() else {
            continue;
        };
        if config.channels() >= 1 {
            result.push(AudioDevice {
                uid: name.clone(),
                name,
                channels: config.channels(),
            });
        }
    }
    Ok(result)
}

/// Registry over the enumerable devices plus the persisted selection.
///
/// Cheap to clone; clones share the change bus and the settings store.
#[derive(Clone)]
pub struct DeviceRegistry {
    settings: SettingsStore,
    tx: broadcast::Sender<DevicesChanged>,
}

impl DeviceRegistry {
    pub fn new(settings: SettingsStore) -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { settings, tx }
    }

    /// Current capture devices (the sentinel is not included)
    pub fn devices(&self) -> Result<Vec<AudioDevice>, AudioError> {
        enumerate_devices()
    }

    /// Persist the user's device choice by UID
    pub fn select(&self, uid: &str) -> Result<(), crate::error::JustWhisperError> {
        let uid = uid.to_string();
        self.settings.update(SettingsSection::Audio, move |c| {
            c.audio.device = uid;
        })
    }

    /// Resolve the persisted UID against the present devices. An absent UID
    /// falls back to the default sentinel and overwrites the stored choice.
    pub fn resolve_selected(&self) -> AudioDevice {
        let stored = self.settings.snapshot().audio.device;
        let devices = enumerate_devices().unwrap_or_default();
        let resolved = resolve(&stored, &devices);
        if resolved.is_default() && stored != AudioDevice::DEFAULT_UID {
            tracing::warn!(
                "configured device '{}' not present, falling back to the system default",
                stored
            );
            let _ = self.select(AudioDevice::DEFAULT_UID);
        }
        resolved
    }

    /// Subscribe to hot-plug notifications
    pub fn subscribe(&self) -> broadcast::Receiver<DevicesChanged> {
        self.tx.subscribe()
    }

    /// Publish a change to all subscribers. The watcher task calls this;
    /// tests use it to simulate hot-plug events.
    pub fn notify(&self, change: DevicesChanged) {
        let _ = self.tx.send(change);
    }

    /// Background watcher: re-enumerate every 2 s and broadcast the diff
    /// whenever the device set changes.
    pub fn spawn_watcher(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(WATCH_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut known = enumerate_devices().unwrap_or_default();
            loop {
                interval.tick().await;
                let current = match enumerate_devices() {
                    Ok(devices) => devices,
                    Err(e) => {
                        tracing::debug!("device enumeration failed: {e}");
                        continue;
                    }
                };
                let change = diff(&known, &current);
                if !change.added.is_empty() || !change.removed.is_empty() {
                    tracing::info!(
                        "audio devices changed: +{} -{}",
                        change.added.len(),
                        change.removed.len()
                    );
                    known = current;
                    registry.notify(change);
                }
            }
        })
    }
}

/// Resolve a stored UID against an enumerated device list
pub fn resolve(uid: &str, devices: &[AudioDevice]) -> AudioDevice {
    if uid == AudioDevice::DEFAULT_UID {
        return AudioDevice::default_input();
    }
    devices
        .iter()
        .find(|d| d.uid == uid)
        .cloned()
        .unwrap_or_else(AudioDevice::default_input)
}

/// Compute the added/removed sets between two enumerations (by UID)
pub fn diff(before: &[AudioDevice], after: &[AudioDevice]) -> DevicesChanged {
    let added = after
        .iter()
        .filter(|d| !before.iter().any(|b| b.uid == d.uid))
        .cloned()
        .collect();
    let removed = before
        .iter()
        .filter(|d| !after.iter().any(|a| a.uid == d.uid))
        .cloned()
        .collect();
    DevicesChanged { added, removed }
}
