// Command-line interface definitions for justwhisper
//
// This module is separate from main.rs so the definitions stay reusable by
// packaging tooling (man page / completion generation).

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "justwhisper")]
#[command(author, version, about = "Hotkey voice-to-text with remote Whisper transcription")]
#[command(long_about = "
JustWhisper records microphone audio while a global hotkey toggle is active,
sends it to a remote Whisper-family endpoint, cleans the transcript, and
pastes the result into whichever application holds keyboard focus.

SETUP:
  1. Run: justwhisper config   (writes a commented default config on first run)
  2. Put your provider API key under [speech] in the config file
  3. Run: justwhisper          (starts the daemon)

USAGE:
  Tap the primary hotkey (default: Fn) to start recording, tap again to
  transcribe and paste. While recording, left Control copies the transcript
  to the clipboard instead of pasting, and Escape cancels.
")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<std::path::PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    pub quiet: bool,

    /// Always copy to the clipboard, never synthesize a paste
    #[arg(long)]
    pub copy_only: bool,

    /// Override the primary hotkey (e.g. Function, F13, ScrollLock)
    #[arg(long, value_name = "KEY")]
    pub hotkey: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run as daemon (default if no command specified)
    Daemon,

    /// List audio capture devices
    Devices,

    /// Transcribe an audio file through the configured provider and print the result
    Transcribe {
        /// Path to a WAV file
        file: std::path::PathBuf,
    },

    /// Show the effective configuration
    Config,
}
