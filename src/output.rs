//! Text delivery to the focused application
//!
//! Both modes put the final text on the system clipboard; paste mode then
//! gives the clipboard 50 ms to settle and synthesizes the host's standard
//! paste chord. The [`TextSink`] trait is the seam tests use to observe
//! delivery without touching the real clipboard.

use crate::error::OutputError;
use std::time::Duration;

/// Clipboard managers need a beat between the write and the paste chord.
const CLIPBOARD_SETTLE_DELAY: Duration = Duration::from_millis(50);

/// How the transcript leaves the app
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Clipboard write followed by a synthesized paste keystroke
    Paste,
    /// Clipboard write only
    CopyOnly,
}

/// Delivery seam between the coordinator and the OS
#[async_trait::async_trait]
pub trait TextSink: Send + Sync {
    async fn emit(&self, text: &str, mode: OutputMode) -> Result<(), OutputError>;
}

/// Real clipboard + keystroke sink
pub struct SystemSink;

#[async_trait::async_trait]
impl TextSink for SystemSink {
    async fn emit(&self, text: &str, mode: OutputMode) -> Result<(), OutputError> {
        if text.is_empty() {
            return Ok(());
        }

        let owned = text.to_string();
        tokio::task::spawn_blocking(move || write_clipboard(&owned))
            .await
            .map_err(|e| OutputError::Clipboard(e.to_string()))??;

        if mode == OutputMode::Paste {
            tokio::time::sleep(CLIPBOARD_SETTLE_DELAY).await;
            tokio::task::spawn_blocking(synthesize_paste)
                .await
                .map_err(|e| OutputError::Keystroke(e.to_string()))??;
            tracing::info!("pasted transcript ({} chars)", text.chars().count());
        } else {
            tracing::info!("copied transcript ({} chars)", text.chars().count());
        }
        Ok(())
    }
}

/// Clear the clipboard and write the text as a UTF-8 string item
fn write_clipboard(text: &str) -> Result<(), OutputError> {
    let mut clipboard =
        arboard::Clipboard::new().map_err(|e| OutputError::Clipboard(e.to_string()))?;
    clipboard
        .clear()
        .map_err(|e| OutputError::Clipboard(e.to_string()))?;
    clipboard
        .set_text(text)
        .map_err(|e| OutputError::Clipboard(e.to_string()))?;
    Ok(())
}

/// Synthesize the host OS's standard paste chord at the focused application
fn synthesize_paste() -> Result<(), OutputError> {
    use enigo::{Direction, Enigo, Key, Keyboard, Settings};

    let mut enigo =
        Enigo::new(&Settings::default()).map_err(|e| OutputError::Keystroke(e.to_string()))?;

    #[cfg(target_os = "macos")]
    let modifier = Key::Meta;
    #[cfg(not(target_os = "macos"))]
    let modifier = Key::Control;

    enigo
        .key(modifier, Direction::Press)
        .map_err(|e| OutputError::Keystroke(e.to_string()))?;
    let result = enigo.key(Key::Unicode('v'), Direction::Click);
    // Always release the modifier, even when the click failed.
    let release = enigo.key(modifier, Direction::Release);
    result.map_err(|e| OutputError::Keystroke(e.to_string()))?;
    release.map_err(|e| OutputError::Keystroke(e.to_string()))?;
    Ok(())
}
