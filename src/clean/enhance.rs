//! LLM transcript enhancement
//!
//! An optional stage that sends the raw transcript to a chat-completion
//! endpoint with the cleaning rules as the system prompt. Failures here are
//! never user-visible: any non-200, timeout, or parse problem degrades to the
//! deterministic pipeline with one warning in the diagnostic ring.

use super::TranscriptCleaner;
use crate::config::{ChatConfig, ProviderKind};
use crate::error::SpeechError;
use crate::logring::LogRing;
use std::collections::HashMap;
use std::time::Duration;

/// Request timeout for chat completions
const CHAT_TIMEOUT_SECS: u64 = 30;

const ENHANCE_TEMPERATURE: f32 = 0.3;
const ENHANCE_MAX_TOKENS: u32 = 1000;

/// System prompt mirroring the deterministic cleaning rules
pub const ENHANCEMENT_SYSTEM_PROMPT: &str = "\
You clean up dictated text. Apply these rules and output only the cleaned text:
- Remove filler words (um, uh, like, you know, basically, and similar).
- Fix grammar and punctuation without changing the meaning.
- Honor explicit formatting commands: 'new line', 'new paragraph', 'bullet point', \
spoken punctuation like 'period' or 'question mark', 'quote ... end quote', \
'cap <word>' and 'all caps ... end caps'.
- Honor self-corrections: for 'X. Actually, Y' keep only Y.
- Capitalize sentence starts.
Do not add commentary. Do not wrap the result in quotes.";

/// Chat provider parameters, mirroring the speech side
#[derive(Debug, Clone)]
pub enum ChatProviderConfig {
    AzureChat {
        api_key: String,
        endpoint: String,
        deployment: String,
        api_version: String,
    },
    OpenAiChat {
        api_key: String,
        model: String,
        base_url: String,
    },
}

impl ChatProviderConfig {
    pub fn from_config(cfg: &ChatConfig) -> Self {
        match cfg.provider {
            ProviderKind::Azure => Self::AzureChat {
                api_key: cfg.api_key.clone(),
                endpoint: cfg.endpoint.clone(),
                deployment: cfg.deployment.clone(),
                api_version: cfg.api_version.clone(),
            },
            ProviderKind::OpenAi => Self::OpenAiChat {
                api_key: cfg.api_key.clone(),
                model: cfg.model.clone(),
                base_url: cfg.base_url.clone(),
            },
        }
    }

    /// A config is usable iff every field is non-empty
    pub fn usable(&self) -> bool {
        match self {
            Self::AzureChat {
                api_key,
                endpoint,
                deployment,
                api_version,
            } => {
                !api_key.is_empty()
                    && !endpoint.is_empty()
                    && !deployment.is_empty()
                    && !api_version.is_empty()
            }
            Self::OpenAiChat {
                api_key,
                model,
                base_url,
            } => !api_key.is_empty() && !model.is_empty() && !base_url.is_empty(),
        }
    }

    pub fn request_url(&self) -> String {
        match self {
            Self::AzureChat {
                endpoint,
                deployment,
                api_version,
                ..
            } => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                endpoint.trim_end_matches('/'),
                deployment,
                api_version
            ),
            Self::OpenAiChat { base_url, .. } => {
                format!("{}/chat/completions", base_url.trim_end_matches('/'))
            }
        }
    }
}

/// Seam for chat completion so tests can script outcomes
#[async_trait::async_trait]
pub trait ChatCompleter: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, SpeechError>;
}

/// HTTP chat client. Reads a fresh provider snapshot per request.
pub struct HttpChatClient {
    http: reqwest::Client,
    settings: crate::config::SettingsStore,
}

impl HttpChatClient {
    pub fn new(settings: crate::config::SettingsStore) -> Result<Self, SpeechError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(CHAT_TIMEOUT_SECS))
            .build()
            .map_err(|e| SpeechError::Network(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { http, settings })
    }
}

#[derive(serde::Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(serde::Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(serde::Deserialize)]
struct ChatMessage {
    content: String,
}

#[async_trait::async_trait]
impl ChatCompleter for HttpChatClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String, SpeechError> {
        let provider = ChatProviderConfig::from_config(&self.settings.snapshot().chat);
        if !provider.usable() {
            return Err(SpeechError::MissingCredential("chat api_key"));
        }

        let body = serde_json::json!({
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": ENHANCE_TEMPERATURE,
            "max_tokens": ENHANCE_MAX_TOKENS,
        });

        let mut request = self.http.post(provider.request_url()).json(&body);
        request = match &provider {
            ChatProviderConfig::AzureChat { api_key, .. } => request.header("api-key", api_key),
            ChatProviderConfig::OpenAiChat { api_key, .. } => {
                request.header("Authorization", format!("Bearer {api_key}"))
            }
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SpeechError::Network("chat request timed out".to_string())
            } else {
                SpeechError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SpeechError::Http {
                status: status.as_u16(),
                body: body.chars().take(256).collect(),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| SpeechError::ResponseParse(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| SpeechError::ResponseParse("response had no choices".to_string()))
    }
}

/// Enhance a transcript through the chat model, degrading to the
/// deterministic pipeline on any failure. Quotes the model wraps around its
/// output are stripped.
pub async fn enhance_transcript(
    text: &str,
    cleaner: &TranscriptCleaner,
    chat: &dyn ChatCompleter,
    log: &LogRing,
) -> String {
    match chat.complete(ENHANCEMENT_SYSTEM_PROMPT, text).await {
        Ok(output) => {
            let output = super::dequote_outer(output.trim());
            if output.is_empty() {
                log.warn("LLM enhancement returned nothing, using the rule-based cleaner");
                cleaner.clean(text)
            } else {
                output
            }
        }
        Err(e) => {
            log.warn(format!(
                "LLM enhancement failed ({e}), using the rule-based cleaner"
            ));
            tracing::warn!("LLM enhancement failed: {e}");
            cleaner.clean(text)
        }
    }
}

/// Apply the replacement dictionary through the chat model with fuzzy
/// matching. Errors bubble up so the caller can fall back to the local
/// regex substitution.
pub async fn intelligent_replacements(
    text: &str,
    replacements: &HashMap<String, String>,
    chat: &dyn ChatCompleter,
) -> Result<String, SpeechError> {
    if replacements.is_empty() {
        return Ok(text.to_string());
    }

    let mut pairs: Vec<(&String, &String)> = replacements.iter().collect();
    pairs.sort();
    let dictionary = pairs
        .iter()
        .map(|(k, v)| format!("- \"{k}\" -> \"{v}\""))
        .collect::<Vec<_>>()
        .join("\n");

    let system = format!(
        "You fix transcription mistakes in dictated text using a replacement \
dictionary. Apply each mapping wherever the text contains the phrase or a \
close mis-hearing of it, preserving the replacement's casing. Change nothing \
else and output only the corrected text.\n\nDictionary:\n{dictionary}"
    );

    let output = chat.complete(&system, text).await?;
    let output = super::dequote_outer(output.trim());
    if output.is_empty() {
        return Err(SpeechError::ResponseParse(
            "replacement pass returned an empty result".to_string(),
        ));
    }
    Ok(output)
}
