//! Configuration loading and the observable settings store
//!
//! Configuration is loaded in layers:
//! 1. Built-in defaults
//! 2. Config file (~/.config/justwhisper/config.toml)
//! 3. CLI arguments (highest priority)
//!
//! Every component reads immutable snapshots; writes go through
//! [`SettingsStore::update`], which persists the file before returning and
//! broadcasts exactly one change event per write. Subscribers consume the
//! events on the coordinator's context, never in the writer's.

use crate::error::JustWhisperError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// Default configuration file content
pub const DEFAULT_CONFIG: &str = r#"# JustWhisper Configuration
#
# Location: ~/.config/justwhisper/config.toml
# All settings can be overridden via CLI flags

# Master switch. When false the keyboard tap is torn down and the
# hotkeys do nothing until it is re-enabled.
enabled = true

[hotkey]
# Primary key: toggles recording on/off.
# Common choices: Function, F13-F24, ScrollLock, Pause
primary = "Function"

# Copy-only key: while recording, stops and copies the transcript to the
# clipboard without pasting. Swallowed so the focused app never sees it.
copy_only = "ControlLeft"

# Escape always cancels an in-flight recording or transcription.

[audio]
# Capture device UID ("default" follows the OS default input)
# List devices with: justwhisper devices
device = "default"

[speech]
# Transcription provider: "openai" or "azure"
provider = "openai"

# API key for the selected provider
api_key = ""

# --- OpenAI settings ---
model = "whisper-1"
base_url = "https://api.openai.com/v1"

# --- Azure settings ---
# endpoint = "https://my-resource.openai.azure.com"
# deployment = "whisper"
endpoint = ""
deployment = ""
api_version = "2024-06-01"

[chat]
# Optional chat-completion provider used for LLM transcript enhancement
# and intelligent word replacements. Leave api_key empty to disable.
provider = "openai"
api_key = ""
model = "gpt-4o-mini"
base_url = "https://api.openai.com/v1"
endpoint = ""
deployment = ""
api_version = "2024-06-01"

# Run the transcript through the chat model instead of the rule-based
# cleaner. Falls back to the rules silently when the call fails.
enhance = false

[cleaner]
# Rule-based transcript cleanup. Each stage can be toggled independently.
remove_fillers = true
line_break_commands = true
punctuation_commands = true
formatting_commands = true
self_correction = true
auto_capitalize = true
word_replacements = true

# Apply the replacement dictionary through the chat model (fuzzy matching)
# instead of exact word-boundary matching. Needs a configured chat provider.
intelligent_replacements = false

[overlay]
# Corner of the screen for the recording indicator:
# top-left, top-right, bottom-left, bottom-right, center
position = "bottom-right"

# Background as #RRGGBB or #RRGGBBAA
background = "#1e1e1ee6"

# Opacity, clamped to 0.3 .. 1.0
opacity = 0.9

[replacements]
# Case-insensitive, word-boundary phrase replacements applied to every
# transcript. Keys are lowercased on load.
"jason" = "JSON"
"get hub" = "GitHub"
"versus code" = "VS Code"
"pie thon" = "Python"
"#;

/// Replacement pairs seeded into a fresh config file
const DEFAULT_REPLACEMENTS: &[(&str, &str)] = &[
    ("jason", "JSON"),
    ("get hub", "GitHub"),
    ("versus code", "VS Code"),
    ("pie thon", "Python"),
];

fn default_true() -> bool {
    true
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Master switch for the hotkey tap
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub hotkey: HotkeyConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub speech: SpeechConfig,

    #[serde(default)]
    pub chat: ChatConfig,

    #[serde(default)]
    pub cleaner: CleanerConfig,

    #[serde(default)]
    pub overlay: OverlayConfig,

    /// Word replacements, lowercased search phrase -> replacement
    #[serde(default)]
    pub replacements: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            hotkey: HotkeyConfig::default(),
            audio: AudioConfig::default(),
            speech: SpeechConfig::default(),
            chat: ChatConfig::default(),
            cleaner: CleanerConfig::default(),
            overlay: OverlayConfig::default(),
            replacements: HashMap::new(),
        }
    }
}

/// Hotkey configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HotkeyConfig {
    /// Primary key name (rdev key name): toggles recording
    #[serde(default = "default_primary_key")]
    pub primary: String,

    /// Copy-only key name: stop + copy without pasting (while recording)
    #[serde(default = "default_copy_only_key")]
    pub copy_only: String,
}

fn default_primary_key() -> String {
    "Function".to_string()
}

fn default_copy_only_key() -> String {
    "ControlLeft".to_string()
}

impl Default for HotkeyConfig {
    fn default() -> Self {
        Self {
            primary: default_primary_key(),
            copy_only: default_copy_only_key(),
        }
    }
}

/// Audio capture configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    /// Capture device UID, or "default" for the OS default input
    #[serde(default = "default_device")]
    pub device: String,
}

fn default_device() -> String {
    "default".to_string()
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
        }
    }
}

/// Which provider family a remote endpoint belongs to
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    OpenAi,
    Azure,
}

/// Remote transcription provider settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpeechConfig {
    #[serde(default)]
    pub provider: ProviderKind,

    #[serde(default)]
    pub api_key: String,

    /// OpenAI model name
    #[serde(default = "default_speech_model")]
    pub model: String,

    /// OpenAI API base URL
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    /// Azure resource endpoint
    #[serde(default)]
    pub endpoint: String,

    /// Azure deployment name
    #[serde(default)]
    pub deployment: String,

    /// Azure API version
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

fn default_speech_model() -> String {
    "whisper-1".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_version() -> String {
    "2024-06-01".to_string()
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenAi,
            api_key: String::new(),
            model: default_speech_model(),
            base_url: default_openai_base_url(),
            endpoint: String::new(),
            deployment: String::new(),
            api_version: default_api_version(),
        }
    }
}

/// Remote chat-completion provider settings (LLM enhancement)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatConfig {
    #[serde(default)]
    pub provider: ProviderKind,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_chat_model")]
    pub model: String,

    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub endpoint: String,

    #[serde(default)]
    pub deployment: String,

    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Run transcripts through the chat model instead of the rule pipeline
    #[serde(default)]
    pub enhance: bool,
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenAi,
            api_key: String::new(),
            model: default_chat_model(),
            base_url: default_openai_base_url(),
            endpoint: String::new(),
            deployment: String::new(),
            api_version: default_api_version(),
            enhance: false,
        }
    }
}

/// Flags for the rule-based transcript cleaner
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct CleanerConfig {
    #[serde(default = "default_true")]
    pub remove_fillers: bool,

    #[serde(default = "default_true")]
    pub line_break_commands: bool,

    #[serde(default = "default_true")]
    pub punctuation_commands: bool,

    #[serde(default = "default_true")]
    pub formatting_commands: bool,

    #[serde(default = "default_true")]
    pub self_correction: bool,

    #[serde(default = "default_true")]
    pub auto_capitalize: bool,

    #[serde(default = "default_true")]
    pub word_replacements: bool,

    #[serde(default)]
    pub intelligent_replacements: bool,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            remove_fillers: true,
            line_break_commands: true,
            punctuation_commands: true,
            formatting_commands: true,
            self_correction: true,
            auto_capitalize: true,
            word_replacements: true,
            intelligent_replacements: false,
        }
    }
}

/// Overlay anchor position
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OverlayPosition {
    TopLeft,
    TopRight,
    BottomLeft,
    #[default]
    BottomRight,
    Center,
}

/// Overlay appearance configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OverlayConfig {
    #[serde(default)]
    pub position: OverlayPosition,

    /// Background as #RRGGBB or #RRGGBBAA
    #[serde(default = "default_background")]
    pub background: String,

    /// Window opacity, clamped to [0.3, 1.0]
    #[serde(default = "default_opacity")]
    pub opacity: f32,
}

fn default_background() -> String {
    "#1e1e1ee6".to_string()
}

fn default_opacity() -> f32 {
    0.9
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            position: OverlayPosition::default(),
            background: default_background(),
            opacity: default_opacity(),
        }
    }
}

impl Config {
    /// Default config file path (~/.config/justwhisper/config.toml)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("justwhisper").join("config.toml"))
    }

    /// Application data directory (~/.local/share/justwhisper on Linux)
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("justwhisper")
    }

    /// Path of the recording scratch file, overwritten on each recording
    pub fn recording_path() -> PathBuf {
        Self::data_dir().join("recording.caf")
    }

    /// Create the config and data directories if missing
    pub fn ensure_directories() -> std::io::Result<()> {
        if let Some(path) = Self::default_path() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::create_dir_all(Self::data_dir())
    }

    /// Normalize after deserialization: lowercase replacement keys, drop the
    /// empty placeholder pair, clamp the overlay opacity.
    fn normalize(mut self) -> Self {
        self.replacements = self
            .replacements
            .into_iter()
            .filter(|(k, _)| !k.trim().is_empty())
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        self.overlay.opacity = self.overlay.opacity.clamp(0.3, 1.0);
        self
    }

    /// Seed the default replacement dictionary (first run)
    fn with_seed_replacements(mut self) -> Self {
        if self.replacements.is_empty() {
            self.replacements = DEFAULT_REPLACEMENTS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
        }
        self
    }
}

/// Load configuration from the given path, or the default location.
///
/// When no config file exists yet, the commented default file is written out
/// (first-run scaffolding) and its parsed form, including the replacement
/// seeds, is returned.
pub fn load_config(path: Option<&Path>) -> Result<Config, JustWhisperError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match Config::default_path() {
            Some(p) => p,
            None => {
                tracing::warn!("no config directory available, using built-in defaults");
                return Ok(Config::default().with_seed_replacements());
            }
        },
    };

    if !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                JustWhisperError::Config(format!("failed to create config directory: {e}"))
            })?;
        }
        std::fs::write(&path, DEFAULT_CONFIG)
            .map_err(|e| JustWhisperError::Config(format!("failed to write {path:?}: {e}")))?;
        tracing::info!("created default config at {:?}", path);
    }

    let contents = std::fs::read_to_string(&path)
        .map_err(|e| JustWhisperError::Config(format!("failed to read {path:?}: {e}")))?;

    let config: Config = toml::from_str(&contents)
        .map_err(|e| JustWhisperError::Config(format!("invalid config {path:?}: {e}")))?;

    Ok(config.normalize())
}

/// Sections of the configuration, used to scope change notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsSection {
    General,
    Hotkey,
    Audio,
    Speech,
    Chat,
    Cleaner,
    Overlay,
    Replacements,
}

/// Observable, persistent settings store.
///
/// Cheap to clone; clones share state. `update` is durable: the config file
/// is written and renamed into place before the call returns, and a single
/// change event is broadcast afterwards.
#[derive(Clone)]
pub struct SettingsStore {
    inner: Arc<RwLock<Config>>,
    path: Option<PathBuf>,
    tx: broadcast::Sender<SettingsSection>,
}

impl SettingsStore {
    pub fn new(config: Config, path: Option<PathBuf>) -> Self {
        let (tx, _) = broadcast::channel(32);
        Self {
            inner: Arc::new(RwLock::new(config)),
            path,
            tx,
        }
    }

    /// In-memory store for tests
    pub fn in_memory(config: Config) -> Self {
        Self::new(config, None)
    }

    /// Copy-on-read snapshot of the full configuration
    pub fn snapshot(&self) -> Config {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Apply a mutation, persist it durably, then broadcast one change event.
    pub fn update(
        &self,
        section: SettingsSection,
        f: impl FnOnce(&mut Config),
    ) -> Result<(), JustWhisperError> {
        let snapshot = {
            let mut guard = self
                .inner
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            f(&mut guard);
            guard.clone()
        };

        if let Some(ref path) = self.path {
            persist(path, &snapshot)?;
        }

        // Receivers may not exist yet; that is fine.
        let _ = self.tx.send(section);
        Ok(())
    }

    /// Subscribe to change events. Consume on the coordinator's context.
    pub fn subscribe(&self) -> broadcast::Receiver<SettingsSection> {
        self.tx.subscribe()
    }
}

/// Write the config next to its final path, fsync, then rename into place.
fn persist(path: &Path, config: &Config) -> Result<(), JustWhisperError> {
    let serialized = toml::to_string_pretty(config)
        .map_err(|e| JustWhisperError::Config(format!("failed to serialize config: {e}")))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| JustWhisperError::Config(format!("failed to create {parent:?}: {e}")))?;
    }

    let tmp = path.with_extension("toml.tmp");
    {
        let mut file = std::fs::File::create(&tmp)
            .map_err(|e| JustWhisperError::Config(format!("failed to create {tmp:?}: {e}")))?;
        file.write_all(serialized.as_bytes())
            .map_err(|e| JustWhisperError::Config(format!("failed to write {tmp:?}: {e}")))?;
        file.sync_all()
            .map_err(|e| JustWhisperError::Config(format!("failed to sync {tmp:?}: {e}")))?;
    }
    std::fs::rename(&tmp, path)
        .map_err(|e| JustWhisperError::Config(format!("failed to replace {path:?}: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_parses() {
        let config: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        let config = config.normalize();

        assert!(config.enabled);
        assert_eq!(config.hotkey.primary, "Function");
        assert_eq!(config.hotkey.copy_only, "ControlLeft");
        assert_eq!(config.audio.device, "default");
        assert_eq!(config.speech.provider, ProviderKind::OpenAi);
        assert_eq!(config.speech.model, "whisper-1");
        assert!(config.cleaner.remove_fillers);
        assert!(!config.cleaner.intelligent_replacements);
        assert_eq!(config.overlay.position, OverlayPosition::BottomRight);
    }

    #[test]
    fn test_default_config_seeds_replacements() {
        let config: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        let config = config.normalize();

        assert_eq!(config.replacements.get("jason").unwrap(), "JSON");
        assert_eq!(config.replacements.get("get hub").unwrap(), "GitHub");
        assert_eq!(config.replacements.len(), 4);
    }

    #[test]
    fn test_replacement_keys_lowercased() {
        let toml_src = r#"
            [replacements]
            "Near Chat" = "Ner chat"
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        let config = config.normalize();

        assert_eq!(config.replacements.get("near chat").unwrap(), "Ner chat");
        assert!(!config.replacements.contains_key("Near Chat"));
    }

    #[test]
    fn test_opacity_clamped() {
        let toml_src = "[overlay]\nopacity = 0.05\n";
        let config: Config = toml::from_str(toml_src).unwrap();
        assert!((config.normalize().overlay.opacity - 0.3).abs() < f32::EPSILON);

        let toml_src = "[overlay]\nopacity = 2.0\n";
        let config: Config = toml::from_str(toml_src).unwrap();
        assert!((config.normalize().overlay.opacity - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.enabled);
        assert_eq!(config.speech.base_url, "https://api.openai.com/v1");
        assert_eq!(config.chat.model, "gpt-4o-mini");
    }

    #[test]
    fn test_store_broadcasts_one_event_per_write() {
        let store = SettingsStore::in_memory(Config::default());
        let mut rx = store.subscribe();

        store
            .update(SettingsSection::Cleaner, |c| {
                c.cleaner.remove_fillers = false;
            })
            .unwrap();

        assert_eq!(rx.try_recv().unwrap(), SettingsSection::Cleaner);
        assert!(rx.try_recv().is_err());
        assert!(!store.snapshot().cleaner.remove_fillers);
    }

    #[test]
    fn test_store_snapshot_is_copy_on_read() {
        let store = SettingsStore::in_memory(Config::default());
        let before = store.snapshot();

        store
            .update(SettingsSection::Audio, |c| {
                c.audio.device = "usb-mic".to_string();
            })
            .unwrap();

        // The earlier snapshot is unaffected by the write.
        assert_eq!(before.audio.device, "default");
        assert_eq!(store.snapshot().audio.device, "usb-mic");
    }

    #[test]
    fn test_store_persists_before_returning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let store = SettingsStore::new(Config::default(), Some(path.clone()));

        store
            .update(SettingsSection::Speech, |c| {
                c.speech.api_key = "sk-test".to_string();
            })
            .unwrap();

        let reloaded: Config = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reloaded.speech.api_key, "sk-test");
    }

    #[test]
    fn test_load_config_writes_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = load_config(Some(&path)).unwrap();
        assert!(path.exists());
        assert!(config.enabled);
        assert!(!config.replacements.is_empty());
    }
}
