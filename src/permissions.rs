//! Microphone and input-monitoring permission gate
//!
//! Both privileges are granted asynchronously by the OS, sometimes minutes
//! after the user opens the privacy panel. The gate never blocks callers:
//! components read the current status from a watch channel, and a background
//! poller re-probes every 2 seconds while anything is missing, flipping the
//! channel when a grant lands.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// How often missing permissions are re-checked
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Privileges the app depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Microphone,
    InputMonitoring,
}

/// Result of probing a permission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    /// The OS has not asked the user yet
    Undecided,
    Granted,
    Denied,
}

/// Platform checks behind a trait so tests can script grant sequences
pub trait PermissionProbe: Send + Sync {
    fn probe(&self, permission: Permission) -> PermissionStatus;

    /// Trigger whatever makes the OS show its consent prompt
    fn prompt(&self, permission: Permission);

    /// Deep-link the user to the system privacy panel
    fn open_settings(&self, permission: Permission);
}

/// Probe implementation against the real OS
pub struct SystemProbe;

impl PermissionProbe for SystemProbe {
    fn probe(&self, permission: Permission) -> PermissionStatus {
        match permission {
            Permission::Microphone => {
                // Being able to read the default input config implies capture
                // access on every platform we support.
                use cpal::traits::{DeviceTrait, HostTrait};
                let host = cpal::default_host();
                match host.default_input_device() {
                    Some(device) => match device.default_input_config() {
                        Ok(_) => PermissionStatus::Granted,
                        Err(e) => {
                            tracing::debug!("microphone probe failed: {e}");
                            PermissionStatus::Denied
                        }
                    },
                    None => PermissionStatus::Denied,
                }
            }
            Permission::InputMonitoring => input_monitoring_status(),
        }
    }

    fn prompt(&self, permission: Permission) {
        match permission {
            Permission::Microphone => {
                // Touching the capture device is what makes the OS raise its
                // consent dialog on first run.
                std::thread::spawn(|| {
                    use cpal::traits::{DeviceTrait, HostTrait};
                    if let Some(device) = cpal::default_host().default_input_device() {
                        let _ = device.default_input_config();
                    }
                });
            }
            Permission::InputMonitoring => self.open_settings(permission),
        }
    }

    fn open_settings(&self, permission: Permission) {
        #[cfg(target_os = "macos")]
        {
            let pane = match permission {
                Permission::Microphone => {
                    "x-apple.systempreferences:com.apple.preference.security?Privacy_Microphone"
                }
                Permission::InputMonitoring => {
                    "x-apple.systempreferences:com.apple.preference.security?Privacy_ListenEvent"
                }
            };
            let _ = std::process::Command::new("open").arg(pane).status();
        }
        #[cfg(not(target_os = "macos"))]
        {
            match permission {
                Permission::Microphone => {
                    tracing::warn!("microphone access denied; check your sound settings")
                }
                Permission::InputMonitoring => tracing::warn!(
                    "input monitoring unavailable; add yourself to the 'input' group: sudo usermod -aG input $USER"
                ),
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn input_monitoring_status() -> PermissionStatus {
    // Global key interception needs read access to the kernel input devices,
    // which membership in the 'input' group provides.
    match std::fs::read_dir("/dev/input") {
        Ok(entries) => {
            let readable = entries
                .filter_map(|e| e.ok())
                .any(|e| std::fs::File::open(e.path()).is_ok());
            if readable {
                PermissionStatus::Granted
            } else {
                PermissionStatus::Denied
            }
        }
        Err(_) => PermissionStatus::Denied,
    }
}

#[cfg(not(target_os = "linux"))]
fn input_monitoring_status() -> PermissionStatus {
    // No reliable query API; the event tap itself reports failure and the
    // controller retries, so optimism is safe here.
    PermissionStatus::Granted
}

/// Shared permission state with change notifications.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct PermissionGate {
    probe: Arc<dyn PermissionProbe>,
    mic_tx: Arc<watch::Sender<bool>>,
    input_tx: Arc<watch::Sender<bool>>,
}

impl PermissionGate {
    pub fn new(probe: Arc<dyn PermissionProbe>) -> Self {
        let mic = probe.probe(Permission::Microphone) == PermissionStatus::Granted;
        let input = probe.probe(Permission::InputMonitoring) == PermissionStatus::Granted;
        let (mic_tx, _) = watch::channel(mic);
        let (input_tx, _) = watch::channel(input);
        Self {
            probe,
            mic_tx: Arc::new(mic_tx),
            input_tx: Arc::new(input_tx),
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemProbe))
    }

    fn sender(&self, permission: Permission) -> &watch::Sender<bool> {
        match permission {
            Permission::Microphone => &self.mic_tx,
            Permission::InputMonitoring => &self.input_tx,
        }
    }

    /// Current status, never blocking
    pub fn granted(&self, permission: Permission) -> bool {
        *self.sender(permission).borrow()
    }

    /// Watch for grant flips
    pub fn watch(&self, permission: Permission) -> watch::Receiver<bool> {
        self.sender(permission).subscribe()
    }

    /// Idempotent request: prompts when the OS has not asked the user yet,
    /// otherwise deep-links to the privacy panel. Already-granted is a no-op.
    pub fn request(&self, permission: Permission) {
        match self.probe.probe(permission) {
            PermissionStatus::Granted => {
                self.sender(permission).send_if_modified(|g| {
                    let changed = !*g;
                    *g = true;
                    changed
                });
            }
            PermissionStatus::Undecided => self.probe.prompt(permission),
            PermissionStatus::Denied => self.probe.open_settings(permission),
        }
    }

    fn refresh(&self, permission: Permission) -> bool {
        let granted = self.probe.probe(permission) == PermissionStatus::Granted;
        self.sender(permission).send_if_modified(|g| {
            let changed = *g != granted;
            *g = granted;
            changed
        });
        granted
    }

    /// Background poller: while any permission is missing, re-probe every
    /// 2 s and flip the watch channel when a grant lands. Exits once both
    /// are granted.
    pub fn spawn_poller(&self) -> tokio::task::JoinHandle<()> {
        let gate = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let mic = gate.granted(Permission::Microphone)
                    || gate.refresh(Permission::Microphone);
                let input = gate.granted(Permission::InputMonitoring)
                    || gate.refresh(Permission::InputMonitoring);
                if mic && input {
                    tracing::debug!("all permissions granted, poller exiting");
                    break;
                }
            }
        })
    }
}
