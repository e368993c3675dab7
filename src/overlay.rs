//! Overlay view model
//!
//! Observable state for the floating indicator. The model never calls UI
//! code: renderers hold a watch receiver and sample on their own schedule,
//! which also gives the coalescing the audio thread needs (at most one
//! pending level update per frame). Appearance changes are applied as a
//! whole snapshot on each show rather than mutated in place.

use crate::config::{OverlayConfig, OverlayPosition};
use std::sync::Arc;
use tokio::sync::watch;

/// Severity of a transient overlay message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Info,
    Error,
    Success,
}

/// What the overlay is showing
#[derive(Debug, Clone, PartialEq)]
pub enum OverlayState {
    Idle,
    Recording { level: f32 },
    Thinking,
    Message { kind: MessageKind, text: String },
}

/// RGBA background color
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    /// Parse "#RRGGBB" or "#RRGGBBAA"
    pub fn from_hex(s: &str) -> Option<Self> {
        let hex = s.trim().strip_prefix('#')?;
        let parse = |range: std::ops::Range<usize>| u8::from_str_radix(hex.get(range)?, 16).ok();
        match hex.len() {
            6 => Some(Self {
                r: parse(0..2)?,
                g: parse(2..4)?,
                b: parse(4..6)?,
                a: 0xff,
            }),
            8 => Some(Self {
                r: parse(0..2)?,
                g: parse(2..4)?,
                b: parse(4..6)?,
                a: parse(6..8)?,
            }),
            _ => None,
        }
    }
}

/// Snapshot of everything the overlay window needs to reconfigure itself
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayAppearance {
    pub position: OverlayPosition,
    pub background: Rgba,
    pub opacity: f32,
}

impl Default for OverlayAppearance {
    fn default() -> Self {
        Self::from_config(&OverlayConfig::default())
    }
}

impl OverlayAppearance {
    pub fn from_config(cfg: &OverlayConfig) -> Self {
        let background = Rgba::from_hex(&cfg.background).unwrap_or(Rgba {
            r: 0x1e,
            g: 0x1e,
            b: 0x1e,
            a: 0xe6,
        });
        Self {
            position: cfg.position,
            background,
            opacity: cfg.opacity.clamp(0.3, 1.0),
        }
    }
}

/// Observable overlay model. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct OverlayModel {
    state_tx: Arc<watch::Sender<OverlayState>>,
    appearance_tx: Arc<watch::Sender<OverlayAppearance>>,
}

impl OverlayModel {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(OverlayState::Idle);
        let (appearance_tx, _) = watch::channel(OverlayAppearance::default());
        Self {
            state_tx: Arc::new(state_tx),
            appearance_tx: Arc::new(appearance_tx),
        }
    }

    pub fn set_idle(&self) {
        self.state_tx.send_replace(OverlayState::Idle);
    }

    pub fn set_recording(&self, level: f32) {
        self.state_tx
            .send_replace(OverlayState::Recording { level });
    }

    pub fn set_thinking(&self) {
        self.state_tx.send_replace(OverlayState::Thinking);
    }

    pub fn set_message(&self, kind: MessageKind, text: impl Into<String>) {
        self.state_tx.send_replace(OverlayState::Message {
            kind,
            text: text.into(),
        });
    }

    /// Reapply the whole appearance snapshot (done on every show, which is
    /// what makes preference edits live)
    pub fn apply_appearance(&self, appearance: OverlayAppearance) {
        self.appearance_tx.send_replace(appearance);
    }

    pub fn state(&self) -> OverlayState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<OverlayState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_appearance(&self) -> watch::Receiver<OverlayAppearance> {
        self.appearance_tx.subscribe()
    }
}

impl Default for OverlayModel {
    fn default() -> Self {
        Self::new()
    }
}
