//! Error types for justwhisper
//!
//! Uses thiserror for ergonomic error definitions with clear messages
//! that guide users toward fixing common issues.

use thiserror::Error;

/// Top-level error type for the justwhisper application
#[derive(Error, Debug)]
pub enum JustWhisperError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Hotkey error: {0}")]
    Hotkey(#[from] HotkeyError),

    #[error("Audio capture error: {0}")]
    Audio(#[from] AudioError),

    #[error("Transcription error: {0}")]
    Speech(#[from] SpeechError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors related to the global keyboard tap
#[derive(Error, Debug)]
pub enum HotkeyError {
    #[error(
        "Input monitoring permission missing.\n  Grant access in your system's privacy settings, then restart."
    )]
    PermissionDenied,

    #[error("Unknown key name: '{0}'. See the [hotkey] section of the default config for valid names.")]
    UnknownKey(String),

    #[error("Keyboard tap failed: {0}")]
    Tap(String),
}

/// Errors related to audio capture
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Microphone permission denied. Grant access in your system's privacy settings.")]
    PermissionDenied,

    #[error("Audio device unavailable: '{0}'. List devices with: justwhisper devices")]
    DeviceUnavailable(String),

    #[error("Recording file error: {0}")]
    Io(String),

    #[error("Audio stream error: {0}")]
    Stream(String),
}

/// Errors surfaced by the remote speech client
#[derive(Error, Debug, Clone)]
pub enum SpeechError {
    #[error("Missing credential: '{0}' is not configured")]
    MissingCredential(&'static str),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Server returned HTTP {status}")]
    Http { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Audio conversion failed: {0}")]
    AudioConversion(String),

    #[error("Could not parse transcription response: {0}")]
    ResponseParse(String),
}

/// Errors related to delivering text to the focused application
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Clipboard write failed: {0}")]
    Clipboard(String),

    #[error("Paste keystroke failed: {0}")]
    Keystroke(String),
}

/// Result type alias using JustWhisperError
pub type Result<T> = std::result::Result<T, JustWhisperError>;
