//! JustWhisper: hotkey voice-to-text with remote transcription
//!
//! This library provides the core functionality for:
//! - Intercepting a global hotkey toggle via an OS keyboard tap (rdev)
//! - Capturing microphone audio via cpal with live level metering
//! - Uploading recordings to a Whisper-family endpoint (Azure or OpenAI)
//! - Cleaning transcripts (spoken commands, fillers, optional LLM pass)
//! - Delivering the result via clipboard + synthesized paste keystroke
//!
//! # Architecture
//!
//! ```text
//!   Hotkey tap ──intents──▶ Session Coordinator ◀──levels── Recorder
//!   (OS thread)            (single-flight state       (audio thread,
//!                           machine, owns all          writes the
//!                           cancellation)              scratch file)
//!                              │
//!            stop ─▶ read PCM ─▶ Speech Client ─▶ Cleaner ─▶ Output Sink
//!                               (remote Whisper)  (rules /   (clipboard +
//!                                                  LLM)       paste)
//! ```
//!
//! The coordinator owns every state transition; the tap and audio threads
//! only ever talk to it through channels. The overlay UI consumes the
//! observable view model in [`overlay`] and renders on its own schedule.

pub mod audio;
pub mod clean;
pub mod cli;
pub mod config;
pub mod error;
pub mod hotkey;
pub mod logring;
pub mod output;
pub mod overlay;
pub mod permissions;
pub mod session;
pub mod speech;

pub use cli::{Cli, Commands};
pub use config::{load_config, Config, SettingsStore};
pub use error::{JustWhisperError, Result};
pub use session::{SessionCoordinator, SessionPhase};
