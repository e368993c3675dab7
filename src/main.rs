//! JustWhisper - hotkey voice-to-text daemon
//!
//! Run with `justwhisper` or `justwhisper daemon` to start the daemon.
//! Use `justwhisper devices` to list capture devices and
//! `justwhisper transcribe <file>` to transcribe a WAV file directly.

use clap::Parser;
use justwhisper::audio::{enumerate_devices, CpalRecorder};
use justwhisper::clean::enhance::{ChatCompleter, HttpChatClient};
use justwhisper::clean::TranscriptCleaner;
use justwhisper::config::{Config, SettingsSection, SettingsStore};
use justwhisper::hotkey::HotkeyController;
use justwhisper::logring::LogRing;
use justwhisper::output::SystemSink;
use justwhisper::overlay::OverlayModel;
use justwhisper::permissions::{Permission, PermissionGate};
use justwhisper::speech::{SpeechClient, SpeechProviderConfig, Transcriber};
use justwhisper::{Cli, Commands, SessionCoordinator};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("justwhisper={log_level},warn"))),
        )
        .with_target(false)
        .init();

    let config_path = cli.config.clone().or_else(Config::default_path);
    let mut config = justwhisper::load_config(cli.config.as_deref())?;

    if let Some(ref hotkey) = cli.hotkey {
        config.hotkey.primary = hotkey.clone();
    }

    match cli.command.unwrap_or(Commands::Daemon) {
        Commands::Daemon => run_daemon(config, config_path, cli.copy_only).await?,
        Commands::Devices => list_devices(&config)?,
        Commands::Transcribe { file } => transcribe_file(config, &file).await?,
        Commands::Config => show_config(&config),
    }

    Ok(())
}

async fn run_daemon(
    config: Config,
    config_path: Option<PathBuf>,
    copy_only: bool,
) -> anyhow::Result<()> {
    tracing::info!("starting justwhisper daemon");
    Config::ensure_directories()?;

    let settings = SettingsStore::new(config, config_path);
    let log = LogRing::new();

    let permissions = PermissionGate::system();
    if !permissions.granted(Permission::Microphone) {
        permissions.request(Permission::Microphone);
    }
    if !permissions.granted(Permission::InputMonitoring) {
        permissions.request(Permission::InputMonitoring);
    }
    let _permission_poller = permissions.spawn_poller();

    let registry = justwhisper::audio::DeviceRegistry::new(settings.clone());
    let _device_watcher = registry.spawn_watcher();

    let recorder = CpalRecorder::new(permissions.clone(), Config::recording_path());
    let transcriber: Arc<dyn Transcriber> =
        Arc::new(SpeechClient::new(settings.clone(), log.clone())?);
    let chat: Option<Arc<dyn ChatCompleter>> =
        Some(Arc::new(HttpChatClient::new(settings.clone())?));
    let overlay = OverlayModel::new();

    let (controller, intents_rx) = HotkeyController::new(settings.clone(), permissions.clone());
    let _tap_supervisor = controller.start();

    // Settings edits flow to the tap: the enable flag tears it down or
    // reinstalls it, hotkey edits swap the bindings.
    let _settings_wiring = {
        let controller = controller.clone();
        let settings = settings.clone();
        let mut rx = settings.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(SettingsSection::General) => {
                        controller.set_enabled(settings.snapshot().enabled);
                    }
                    Ok(SettingsSection::Hotkey) => controller.rebind(),
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    let coordinator = SessionCoordinator::new(
        settings.clone(),
        registry,
        Box::new(recorder),
        transcriber,
        chat,
        Arc::new(SystemSink),
        overlay,
        log,
    )
    .with_copy_only(copy_only)
    .with_recording_listener({
        let controller = controller.clone();
        move |active| controller.set_recording(active)
    });

    let hotkey_cfg = settings.snapshot().hotkey;
    tracing::info!(
        "ready: tap {} to record, {} to copy without pasting, Escape to cancel",
        hotkey_cfg.primary,
        hotkey_cfg.copy_only
    );

    let coordinator_task = tokio::spawn(coordinator.run(intents_rx));

    shutdown_signal().await;
    tracing::info!("shutting down");
    coordinator_task.abort();
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn list_devices(config: &Config) -> anyhow::Result<()> {
    let devices = enumerate_devices()?;
    if devices.is_empty() {
        println!("No audio input devices found.");
        return Ok(());
    }

    println!("Audio input devices:");
    for device in devices {
        let marker = if device.uid == config.audio.device {
            " (selected)"
        } else {
            ""
        };
        println!(
            "  {} [{} ch]{}",
            device.name, device.channels, marker
        );
    }
    if config.audio.device == "default" {
        println!("\nFollowing the system default input.");
    }
    Ok(())
}

async fn transcribe_file(config: Config, path: &PathBuf) -> anyhow::Result<()> {
    let provider = SpeechProviderConfig::from_config(&config.speech);
    provider.validate()?;

    println!("Loading audio file: {path:?}");
    let samples = justwhisper::speech::wav::read_samples(path)?;
    println!(
        "Transcribing {:.1}s of audio via {}...",
        samples.len() as f32 / justwhisper::audio::SAMPLE_RATE as f32,
        provider.label()
    );

    let log = LogRing::new();
    let settings = SettingsStore::in_memory(config.clone());
    let client = SpeechClient::new(settings, log)?;
    let raw = client.transcribe_with(&samples, &provider).await?;

    let cleaner = TranscriptCleaner::new(config.cleaner, config.replacements);
    println!("\n{}", cleaner.clean(&raw));
    Ok(())
}

fn show_config(config: &Config) {
    println!("Current Configuration\n");
    println!("enabled = {}", config.enabled);

    println!("\n[hotkey]");
    println!("  primary = {:?}", config.hotkey.primary);
    println!("  copy_only = {:?}", config.hotkey.copy_only);

    println!("\n[audio]");
    println!("  device = {:?}", config.audio.device);

    println!("\n[speech]");
    println!("  provider = {:?}", config.speech.provider);
    println!("  api_key set = {}", !config.speech.api_key.is_empty());
    match config.speech.provider {
        justwhisper::config::ProviderKind::OpenAi => {
            println!("  model = {:?}", config.speech.model);
            println!("  base_url = {:?}", config.speech.base_url);
        }
        justwhisper::config::ProviderKind::Azure => {
            println!("  endpoint = {:?}", config.speech.endpoint);
            println!("  deployment = {:?}", config.speech.deployment);
            println!("  api_version = {:?}", config.speech.api_version);
        }
    }

    println!("\n[chat]");
    println!("  enhance = {}", config.chat.enhance);
    println!("  api_key set = {}", !config.chat.api_key.is_empty());

    println!("\n[cleaner]");
    println!("  remove_fillers = {}", config.cleaner.remove_fillers);
    println!("  line_break_commands = {}", config.cleaner.line_break_commands);
    println!("  punctuation_commands = {}", config.cleaner.punctuation_commands);
    println!("  formatting_commands = {}", config.cleaner.formatting_commands);
    println!("  self_correction = {}", config.cleaner.self_correction);
    println!("  auto_capitalize = {}", config.cleaner.auto_capitalize);
    println!("  word_replacements = {}", config.cleaner.word_replacements);
    println!(
        "  intelligent_replacements = {}",
        config.cleaner.intelligent_replacements
    );

    println!("\n[overlay]");
    println!("  position = {:?}", config.overlay.position);
    println!("  background = {:?}", config.overlay.background);
    println!("  opacity = {}", config.overlay.opacity);

    println!("\n[replacements]");
    let mut pairs: Vec<_> = config.replacements.iter().collect();
    pairs.sort();
    for (k, v) in pairs {
        println!("  {k:?} = {v:?}");
    }

    println!("\n---");
    println!(
        "Config file: {:?}",
        Config::default_path().unwrap_or_else(|| PathBuf::from("(not found)"))
    );
    println!("Recording scratch file: {:?}", Config::recording_path());
}
