//! OpenAI-compatible backend.
//!
//! One client type serves all three backend kinds:
//!
//! - text: chat completions with a `json_schema` response format
//! - vision: the same, with the listing photos attached as image parts
//! - voice: the audio transcription endpoint, returning a transcript only
//!
//! # Example
//!
//! ```rust,ignore
//! use listing_extraction::backends::OpenAiBackend;
//! use listing_extraction::BackendKind;
//!
//! let text = OpenAiBackend::from_env(BackendKind::Text, "gpt-4o-mini")?;
//! let vision = OpenAiBackend::from_env(BackendKind::Vision, "gpt-4o")?
//!     .with_base_url("https://proxy.internal/v1");
//! ```

use async_trait::async_trait;
use reqwest::{multipart, Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::traits::backend::{
    BackendClient, BackendErrorKind, BackendFailure, BackendKind, BackendOutput, BackendPayload,
    BackendRequest,
};
use crate::types::request::VoiceRef;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Backend speaking the OpenAI HTTP API.
pub struct OpenAiBackend {
    http: Client,
    api_key: SecretString,
    kind: BackendKind,
    model: String,
    base_url: String,
    name: String,
}

impl OpenAiBackend {
    pub fn new(kind: BackendKind, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            api_key: SecretString::from(api_key.into()),
            kind,
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            name: format!("openai-{kind}"),
        }
    }

    /// Create from `OPENAI_API_KEY`, honouring `OPENAI_BASE_URL` when set.
    pub fn from_env(kind: BackendKind, model: impl Into<String>) -> ConfigResult<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ConfigError::invalid("OPENAI_API_KEY", "not set"))?;
        let backend = Self::new(kind, api_key, model);
        Ok(match std::env::var("OPENAI_BASE_URL") {
            Ok(url) if !url.trim().is_empty() => backend.with_base_url(url),
            _ => backend,
        })
    }

    /// Set a custom base URL (for Azure, proxies, etc.).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Use a preconfigured HTTP client (connection pool, proxy, TLS).
    pub fn with_http_client(mut self, http: Client) -> Self {
        self.http = http;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn structured(&self, request: &BackendRequest) -> Result<BackendOutput, BackendFailure> {
        let body = ChatRequest {
            model: &self.model,
            temperature: 0.0,
            messages: vec![
                json!({ "role": "system", "content": request.instructions }),
                json!({ "role": "user", "content": user_content(&request.payload)? }),
            ],
            response_format: json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "listing_extraction",
                    "strict": false,
                    "schema": request.schema,
                }
            }),
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(transport_failure)?;
        let response = check_status(response).await?;

        let chat: ChatResponse = response.json().await.map_err(|e| {
            BackendFailure::new(BackendErrorKind::MalformedOutput, format!("chat response: {e}"))
        })?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| BackendFailure::new(BackendErrorKind::MalformedOutput, "no choices returned"))?;

        debug!(backend = %self.kind, model = %self.model, bytes = content.len(), "Structured output received");
        BackendOutput::from_json(&content)
    }

    async fn transcribe(&self, voice: &VoiceRef) -> Result<BackendOutput, BackendFailure> {
        let audio = self
            .http
            .get(voice.uri.clone())
            .send()
            .await
            .map_err(transport_failure)?;
        let audio = check_status(audio).await?;
        let bytes = audio.bytes().await.map_err(transport_failure)?;

        let file_name = voice
            .uri
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .unwrap_or("voice-note")
            .to_string();
        let form = multipart::Form::new()
            .text("model", self.model.clone())
            .part("file", multipart::Part::bytes(bytes.to_vec()).file_name(file_name));

        let response = self
            .http
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await
            .map_err(transport_failure)?;
        let response = check_status(response).await?;

        let transcription: TranscriptionResponse = response.json().await.map_err(|e| {
            BackendFailure::new(BackendErrorKind::MalformedOutput, format!("transcription response: {e}"))
        })?;
        debug!(model = %self.model, chars = transcription.text.len(), "Transcript received");

        Ok(BackendOutput::default().with_transcript(transcription.text))
    }
}

impl std::fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiBackend")
            .field("kind", &self.kind)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl BackendClient for OpenAiBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &BackendRequest) -> Result<BackendOutput, BackendFailure> {
        match &request.payload {
            BackendPayload::Audio(voice) => self.transcribe(voice).await,
            _ => self.structured(request).await,
        }
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<Value>,
    response_format: Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// User message content for a text or image payload.
fn user_content(payload: &BackendPayload) -> Result<Value, BackendFailure> {
    match payload {
        BackendPayload::Text(text) => Ok(Value::String(text.clone())),
        BackendPayload::Images(images) => Ok(Value::Array(
            images
                .iter()
                .map(|image| json!({ "type": "image_url", "image_url": { "url": image.uri.as_str() } }))
                .collect(),
        )),
        BackendPayload::Audio(_) => Err(BackendFailure::new(
            BackendErrorKind::BadInput,
            "audio payload sent to a chat endpoint",
        )),
    }
}

/// Map an HTTP status to a failure class.
fn classify_status(status: StatusCode) -> BackendErrorKind {
    match status {
        StatusCode::TOO_MANY_REQUESTS => BackendErrorKind::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => BackendErrorKind::Timeout,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendErrorKind::Auth,
        s if s.is_server_error() => BackendErrorKind::Unavailable,
        _ => BackendErrorKind::BadInput,
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BackendFailure> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BackendFailure::new(
        classify_status(status),
        format!("HTTP {status}: {}", body.chars().take(300).collect::<String>()),
    ))
}

fn transport_failure(error: reqwest::Error) -> BackendFailure {
    let kind = if error.is_timeout() {
        BackendErrorKind::Timeout
    } else {
        BackendErrorKind::Unavailable
    };
    BackendFailure::new(kind, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::request::ImageRef;

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), BackendErrorKind::RateLimited);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), BackendErrorKind::Unavailable);
        assert_eq!(classify_status(StatusCode::GATEWAY_TIMEOUT), BackendErrorKind::Timeout);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), BackendErrorKind::BadInput);
        assert_eq!(classify_status(StatusCode::UNPROCESSABLE_ENTITY), BackendErrorKind::BadInput);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), BackendErrorKind::Auth);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), BackendErrorKind::Auth);
    }

    #[test]
    fn test_image_parts() {
        let payload = BackendPayload::Images(vec![
            ImageRef::new("https://cdn.example.com/kitchen.jpg").unwrap(),
            ImageRef::new("https://cdn.example.com/bath.jpg").unwrap(),
        ]);
        let content = user_content(&payload).unwrap();
        assert_eq!(content.as_array().unwrap().len(), 2);
        assert_eq!(content[1]["image_url"]["url"], "https://cdn.example.com/bath.jpg");
    }

    #[test]
    fn test_debug_redacts_key() {
        let backend = OpenAiBackend::new(BackendKind::Text, "sk-secret", "gpt-4o-mini");
        let debug = format!("{backend:?}");
        assert!(!debug.contains("sk-secret"));
        assert_eq!(backend.name(), "openai-text");
    }
}
