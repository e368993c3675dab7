//! Global hotkey controller
//!
//! Three monitored keys, by contract with the session coordinator:
//! - the primary key toggles recording via `StartOrStop`
//! - the copy-only key (while recording) stops and copies without pasting,
//!   and is swallowed so the focused app never sees it
//! - Escape (while recording) cancels, and is swallowed
//!
//! The tap itself runs on a dedicated OS thread (see [`tap`]); intents cross
//! into the coordinator over a channel. The controller keeps its own
//! `is_recording` mirror, updated by the coordinator, so the tap thread
//! never blocks on application state.

pub mod tap;

pub use tap::HotkeyController;

use crate::error::HotkeyError;

/// What the user asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    StartOrStop,
    StopCopyOnly,
    Cancel,
}

/// The keys one tap generation watches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyMap {
    pub primary: rdev::Key,
    pub copy_only: rdev::Key,
}

impl Default for KeyMap {
    fn default() -> Self {
        Self {
            primary: rdev::Key::Function,
            copy_only: rdev::Key::ControlLeft,
        }
    }
}

impl KeyMap {
    pub fn from_config(cfg: &crate::config::HotkeyConfig) -> Result<Self, HotkeyError> {
        Ok(Self {
            primary: parse_key(&cfg.primary)?,
            copy_only: parse_key(&cfg.copy_only)?,
        })
    }
}

/// Map a config key name to an rdev key
pub fn parse_key(name: &str) -> Result<rdev::Key, HotkeyError> {
    use rdev::Key;
    let key = match name {
        "Function" | "Fn" => Key::Function,
        "ControlLeft" => Key::ControlLeft,
        "ControlRight" => Key::ControlRight,
        "ShiftLeft" => Key::ShiftLeft,
        "ShiftRight" => Key::ShiftRight,
        "MetaLeft" => Key::MetaLeft,
        "MetaRight" => Key::MetaRight,
        "Alt" => Key::Alt,
        "AltGr" => Key::AltGr,
        "Escape" => Key::Escape,
        "ScrollLock" => Key::ScrollLock,
        "Pause" => Key::Pause,
        "CapsLock" => Key::CapsLock,
        "F1" => Key::F1,
        "F2" => Key::F2,
        "F3" => Key::F3,
        "F4" => Key::F4,
        "F5" => Key::F5,
        "F6" => Key::F6,
        "F7" => Key::F7,
        "F8" => Key::F8,
        "F9" => Key::F9,
        "F10" => Key::F10,
        "F11" => Key::F11,
        "F12" => Key::F12,
        other => return Err(HotkeyError::UnknownKey(other.to_string())),
    };
    Ok(key)
}

/// Decide what a key press means. Returns the intent plus whether the event
/// must be swallowed so the host OS never delivers it.
///
/// The copy-only and cancel keys are ordinary keys the rest of the time;
/// they only act (and are only swallowed) while a recording is active.
pub fn decide(key: rdev::Key, keys: &KeyMap, is_recording: bool) -> Option<(Intent, bool)> {
    if key == keys.primary {
        return Some((Intent::StartOrStop, false));
    }
    if is_recording {
        if key == keys.copy_only {
            return Some((Intent::StopCopyOnly, true));
        }
        if key == rdev::Key::Escape {
            return Some((Intent::Cancel, true));
        }
    }
    None
}
