//! Remote speech-to-text client
//!
//! Uploads the recorded audio as a canonical WAV to a Whisper-family
//! endpoint. Two provider families are supported, differing only in URL
//! construction and auth header:
//! - Azure OpenAI deployments (`api-key` header)
//! - OpenAI-compatible APIs (`Authorization: Bearer`)
//!
//! One entry per request stage (start, convert, send, receive, parse) goes
//! into the bounded diagnostic ring so the preferences UI can show what
//! happened without a debugger attached.

pub mod wav;

use crate::config::{ProviderKind, SettingsStore, SpeechConfig};
use crate::error::SpeechError;
use crate::logring::LogRing;
use std::time::Duration;

/// Request timeout for transcription uploads
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// How much of an error body is kept in diagnostics
const BODY_EXCERPT_BYTES: usize = 1024;

/// Resolved provider parameters for one transcription request
#[derive(Debug, Clone)]
pub enum SpeechProviderConfig {
    AzureWhisper {
        api_key: String,
        endpoint: String,
        deployment: String,
        api_version: String,
    },
    OpenAiWhisper {
        api_key: String,
        model: String,
        base_url: String,
    },
}

impl SpeechProviderConfig {
    pub fn from_config(cfg: &SpeechConfig) -> Self {
        match cfg.provider {
            ProviderKind::Azure => Self::AzureWhisper {
                api_key: cfg.api_key.clone(),
                endpoint: cfg.endpoint.clone(),
                deployment: cfg.deployment.clone(),
                api_version: cfg.api_version.clone(),
            },
            ProviderKind::OpenAi => Self::OpenAiWhisper {
                api_key: cfg.api_key.clone(),
                model: cfg.model.clone(),
                base_url: cfg.base_url.clone(),
            },
        }
    }

    /// Human-readable provider name for user-facing messages
    pub fn label(&self) -> &'static str {
        match self {
            Self::AzureWhisper { .. } => "Azure Whisper",
            Self::OpenAiWhisper { .. } => "OpenAI Whisper",
        }
    }

    /// A config is usable iff every field is non-empty
    pub fn usable(&self) -> bool {
        self.validate().is_ok()
    }

    /// Check field presence and endpoint shape without touching the network
    pub fn validate(&self) -> Result<(), SpeechError> {
        match self {
            Self::AzureWhisper {
                api_key,
                endpoint,
                deployment,
                api_version,
            } => {
                if api_key.is_empty() {
                    return Err(SpeechError::MissingCredential("api_key"));
                }
                if endpoint.is_empty() {
                    return Err(SpeechError::MissingCredential("endpoint"));
                }
                if deployment.is_empty() {
                    return Err(SpeechError::MissingCredential("deployment"));
                }
                if api_version.is_empty() {
                    return Err(SpeechError::MissingCredential("api_version"));
                }
                validate_url(endpoint)
            }
            Self::OpenAiWhisper {
                api_key,
                model,
                base_url,
            } => {
                if api_key.is_empty() {
                    return Err(SpeechError::MissingCredential("api_key"));
                }
                if model.is_empty() {
                    return Err(SpeechError::MissingCredential("model"));
                }
                if base_url.is_empty() {
                    return Err(SpeechError::MissingCredential("base_url"));
                }
                validate_url(base_url)
            }
        }
    }

    /// Transcription endpoint URL
    pub fn request_url(&self) -> String {
        match self {
            Self::AzureWhisper {
                endpoint,
                deployment,
                api_version,
                ..
            } => format!(
                "{}/openai/deployments/{}/audio/transcriptions?api-version={}",
                endpoint.trim_end_matches('/'),
                deployment,
                api_version
            ),
            Self::OpenAiWhisper { base_url, .. } => {
                format!("{}/audio/transcriptions", base_url.trim_end_matches('/'))
            }
        }
    }
}

fn validate_url(url: &str) -> Result<(), SpeechError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(SpeechError::InvalidEndpoint(format!(
            "must start with http:// or https://, got: {url}"
        )))
    }
}

/// Seam between the coordinator and the network, so tests substitute a
/// scripted transcriber.
#[async_trait::async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, samples: &[f32]) -> Result<String, SpeechError>;
}

/// HTTP transcription client. Reads a fresh provider snapshot per request.
pub struct SpeechClient {
    http: reqwest::Client,
    settings: SettingsStore,
    log: LogRing,
}

impl SpeechClient {
    pub fn new(settings: SettingsStore, log: LogRing) -> Result<Self, SpeechError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| SpeechError::Network(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            settings,
            log,
        })
    }

    /// Upload `samples` (f32 mono, capture rate) against an explicit provider.
    pub async fn transcribe_with(
        &self,
        samples: &[f32],
        provider: &SpeechProviderConfig,
    ) -> Result<String, SpeechError> {
        let duration = samples.len() as f32 / crate::audio::SAMPLE_RATE as f32;
        self.log.info(format!(
            "transcribe start: {:.1}s of audio via {}",
            duration,
            provider.label()
        ));

        if let Err(e) = provider.validate() {
            self.log.error(format!("configuration rejected: {e}"));
            return Err(e);
        }

        let wav_bytes = match wav::encode_pcm16(samples) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.log.error(format!("audio conversion failed: {e}"));
                return Err(e);
            }
        };
        self.log
            .info(format!("converted to 16-bit WAV ({} bytes)", wav_bytes.len()));

        let mut form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav_bytes)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| SpeechError::AudioConversion(e.to_string()))?,
            )
            .text("response_format", "verbose_json")
            .text("language", "en")
            .text("temperature", "0.0");
        if let SpeechProviderConfig::OpenAiWhisper { model, .. } = provider {
            form = form.text("model", model.clone());
        }

        let url = provider.request_url();
        let mut request = self.http.post(&url).multipart(form);
        request = match provider {
            SpeechProviderConfig::AzureWhisper { api_key, .. } => {
                request.header("api-key", api_key)
            }
            SpeechProviderConfig::OpenAiWhisper { api_key, .. } => {
                request.header("Authorization", format!("Bearer {api_key}"))
            }
        };

        self.log.info(format!("uploading to {url}"));
        let response = request.send().await.map_err(|e| {
            let err = if e.is_timeout() {
                SpeechError::Network("request timed out".to_string())
            } else if e.is_connect() {
                SpeechError::Network(format!("connection failed: {e}"))
            } else {
                SpeechError::Network(e.to_string())
            };
            self.log.error(format!("upload failed: {err}"));
            err
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SpeechError::Network(format!("failed to read response: {e}")))?;
        self.log
            .info(format!("received HTTP {} ({} bytes)", status.as_u16(), body.len()));

        if !status.is_success() {
            let err = SpeechError::Http {
                status: status.as_u16(),
                body: excerpt(&body),
            };
            self.log
                .error(format!("HTTP {}: {}", status.as_u16(), excerpt(&body)));
            return Err(err);
        }

        let text = match parse_transcript(&body) {
            Ok(text) => text,
            Err(e) => {
                self.log.error(format!("parse failed: {e}"));
                return Err(e);
            }
        };
        self.log
            .info(format!("parsed transcript ({} chars)", text.chars().count()));

        if is_low_signal_artifact(&text) {
            self.log.warn(
                "transcript was just \"you\": very quiet input, consider raising the input gain",
            );
        }

        Ok(text)
    }
}

#[async_trait::async_trait]
impl Transcriber for SpeechClient {
    async fn transcribe(&self, samples: &[f32]) -> Result<String, SpeechError> {
        let provider = SpeechProviderConfig::from_config(&self.settings.snapshot().speech);
        self.transcribe_with(samples, &provider).await
    }
}

/// Verbose-JSON response shape; every field is optional in practice.
#[derive(serde::Deserialize)]
struct VerboseResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    segments: Vec<VerboseSegment>,
    #[allow(dead_code)]
    language: Option<String>,
    #[allow(dead_code)]
    duration: Option<f64>,
}

#[derive(serde::Deserialize)]
struct VerboseSegment {
    #[serde(default)]
    text: String,
    #[allow(dead_code)]
    no_speech_prob: Option<f64>,
    #[allow(dead_code)]
    avg_logprob: Option<f64>,
}

/// Reconcile a 200 response body into a transcript.
///
/// Order of preference: top-level `text`, joined non-empty segment texts,
/// a non-JSON plain-text body, and finally a regex rescue of the first
/// `"text":"…"` field from a malformed body.
pub fn parse_transcript(body: &str) -> Result<String, SpeechError> {
    if let Ok(parsed) = serde_json::from_str::<VerboseResponse>(body) {
        let text = parsed.text.trim();
        if !text.is_empty() {
            return Ok(text.to_string());
        }
        let joined = parsed
            .segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        return Ok(joined);
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(SpeechError::ResponseParse("empty response body".to_string()));
    }
    if !trimmed.starts_with('{') {
        return Ok(trimmed.to_string());
    }

    // Malformed JSON: last resort, pull the first "text" field out by hand.
    let re = regex::Regex::new(r#""text"\s*:\s*"((?:\\.|[^"\\])*)""#)
        .expect("BUG: text-extraction regex is a compile-time constant and must be valid");
    if let Some(caps) = re.captures(body) {
        return Ok(unescape_json_fragment(&caps[1]));
    }

    Err(SpeechError::ResponseParse(format!(
        "unrecognized response body: {}",
        excerpt(body)
    )))
}

/// A transcript of exactly "you" is a known artifact of near-silent input.
pub fn is_low_signal_artifact(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case("you")
}

fn unescape_json_fragment(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => break,
        }
    }
    out
}

/// Clip a body to the first KiB on a char boundary
fn excerpt(body: &str) -> String {
    if body.len() <= BODY_EXCERPT_BYTES {
        return body.to_string();
    }
    let mut end = BODY_EXCERPT_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}
