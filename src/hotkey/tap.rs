//! rdev-based keyboard tap
//!
//! `rdev::grab` owns its thread for the lifetime of the process and the
//! callback cannot be unhooked from outside, so teardown is logical: every
//! installed tap carries a generation number, and a callback whose
//! generation has been retired passes every event through untouched. The OS
//! can also disable a tap it finds suspicious; when the grab call returns,
//! the thread re-enables it once, and a second failure makes the supervisor
//! tear down and rebuild from scratch.

use super::{decide, Intent, KeyMap};
use crate::config::SettingsStore;
use crate::permissions::{Permission, PermissionGate};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Retry interval while input monitoring is missing
const PERMISSION_RETRY: Duration = Duration::from_secs(2);

/// Pause before a full rebuild after the in-thread re-enable failed
const REBUILD_DELAY: Duration = Duration::from_millis(200);

/// Owns the tap lifecycle and the intent channel into the coordinator.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct HotkeyController {
    settings: SettingsStore,
    permissions: PermissionGate,
    intents_tx: mpsc::UnboundedSender<Intent>,
    /// Mirror of the coordinator's recording state, written via
    /// [`set_recording`](Self::set_recording); the tap thread only reads it.
    recording: Arc<AtomicBool>,
    enabled: Arc<AtomicBool>,
    /// Current tap generation; callbacks from older generations are retired
    generation: Arc<AtomicU64>,
    rebuild_tx: mpsc::UnboundedSender<()>,
    rebuild_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<()>>>>,
}

impl HotkeyController {
    pub fn new(
        settings: SettingsStore,
        permissions: PermissionGate,
    ) -> (Self, mpsc::UnboundedReceiver<Intent>) {
        let (intents_tx, intents_rx) = mpsc::unbounded_channel();
        let (rebuild_tx, rebuild_rx) = mpsc::unbounded_channel();
        let enabled = settings.snapshot().enabled;
        let controller = Self {
            settings,
            permissions,
            intents_tx,
            recording: Arc::new(AtomicBool::new(false)),
            enabled: Arc::new(AtomicBool::new(enabled)),
            generation: Arc::new(AtomicU64::new(0)),
            rebuild_tx,
            rebuild_rx: Arc::new(Mutex::new(Some(rebuild_rx))),
        };
        (controller, intents_rx)
    }

    /// Coordinator callback keeping the tap's recording mirror current
    pub fn set_recording(&self, active: bool) {
        self.recording.store(active, Ordering::SeqCst);
    }

    /// Apply the global enable flag: clearing it retires the live tap,
    /// setting it installs a fresh one.
    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::SeqCst);
        if was == enabled {
            return;
        }
        if enabled {
            tracing::info!("hotkeys enabled, reinstalling tap");
            self.install();
        } else {
            tracing::info!("hotkeys disabled, retiring tap");
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Re-read the key bindings and swap the tap over to them
    pub fn rebind(&self) {
        if self.enabled.load(Ordering::SeqCst) {
            self.install();
        }
    }

    /// Start the controller: wait (politely) for input monitoring, install
    /// the tap, then serve rebuild requests from failed grabs.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let controller = self.clone();
        let mut rebuild_rx = self
            .rebuild_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .expect("BUG: HotkeyController::start called twice");

        tokio::spawn(async move {
            if !controller.permissions.granted(Permission::InputMonitoring) {
                tracing::info!("waiting for input monitoring permission");
                controller.permissions.request(Permission::InputMonitoring);
                let mut interval = tokio::time::interval(PERMISSION_RETRY);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                while !controller.permissions.granted(Permission::InputMonitoring) {
                    interval.tick().await;
                }
                tracing::info!("input monitoring granted");
            }

            if controller.enabled.load(Ordering::SeqCst) {
                controller.install();
            }

            while rebuild_rx.recv().await.is_some() {
                if !controller.enabled.load(Ordering::SeqCst) {
                    continue;
                }
                tracing::warn!("keyboard tap died, rebuilding");
                tokio::time::sleep(REBUILD_DELAY).await;
                controller.install();
            }
        })
    }

    /// Install a new tap generation on its own OS thread
    fn install(&self) {
        let keys = match KeyMap::from_config(&self.settings.snapshot().hotkey) {
            Ok(keys) => keys,
            Err(e) => {
                tracing::error!("invalid hotkey config ({e}), using defaults");
                KeyMap::default()
            }
        };

        let my_gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = self.generation.clone();
        let enabled = self.enabled.clone();
        let recording = self.recording.clone();
        let intents_tx = self.intents_tx.clone();
        let rebuild_tx = self.rebuild_tx.clone();

        std::thread::spawn(move || {
            // One in-place re-enable attempt before asking for a rebuild.
            for attempt in 0..2 {
                if generation.load(Ordering::SeqCst) != my_gen {
                    return;
                }
                if attempt > 0 {
                    tracing::warn!("keyboard tap disabled by the OS, re-enabling");
                }

                let generation = generation.clone();
                let enabled = enabled.clone();
                let recording = recording.clone();
                let intents_tx = intents_tx.clone();

                let result = rdev::grab(move |event: rdev::Event| -> Option<rdev::Event> {
                    if generation.load(Ordering::SeqCst) != my_gen
                        || !enabled.load(Ordering::SeqCst)
                    {
                        return Some(event);
                    }
                    if let rdev::EventType::KeyPress(key) = event.event_type {
                        if let Some((intent, swallow)) =
                            decide(key, &keys, recording.load(Ordering::SeqCst))
                        {
                            let _ = intents_tx.send(intent);
                            if swallow {
                                return None;
                            }
                        }
                    }
                    Some(event)
                });

                match result {
                    Ok(()) => {
                        // Clean exit only happens when the grab was retired.
                        return;
                    }
                    Err(e) => {
                        tracing::warn!("keyboard grab failed: {e:?}");
                    }
                }
            }

            // Two strikes: hand the problem to the supervisor.
            if generation.load(Ordering::SeqCst) == my_gen {
                let _ = rebuild_tx.send(());
            }
        });

        tracing::debug!("keyboard tap generation {my_gen} installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn controller() -> (HotkeyController, mpsc::UnboundedReceiver<Intent>) {
        let settings = SettingsStore::in_memory(Config::default());
        let probe = Arc::new(crate::permissions::SystemProbe);
        HotkeyController::new(settings, crate::permissions::PermissionGate::new(probe))
    }

    #[test]
    fn test_recording_mirror() {
        let (ctrl, _rx) = controller();
        assert!(!ctrl.recording.load(Ordering::SeqCst));
        ctrl.set_recording(true);
        assert!(ctrl.recording.load(Ordering::SeqCst));
        ctrl.set_recording(false);
        assert!(!ctrl.recording.load(Ordering::SeqCst));
    }

    #[test]
    fn test_disable_retires_generation() {
        let (ctrl, _rx) = controller();
        let before = ctrl.generation.load(Ordering::SeqCst);
        ctrl.set_enabled(false);
        assert!(ctrl.generation.load(Ordering::SeqCst) > before);
        assert!(!ctrl.enabled.load(Ordering::SeqCst));
    }

    #[test]
    fn test_set_enabled_is_level_triggered() {
        let (ctrl, _rx) = controller();
        ctrl.set_enabled(false);
        let after_disable = ctrl.generation.load(Ordering::SeqCst);
        // Re-disabling must not retire anything further.
        ctrl.set_enabled(false);
        assert_eq!(ctrl.generation.load(Ordering::SeqCst), after_disable);
    }
}
