//! AI enrichment capability
//!
//! `EnrichmentEngine` is the seam between the orchestrator and the external
//! AI service. `HttpEnrichmentEngine` talks to an OpenAI-compatible API:
//! multipart `/v1/audio/transcriptions` for audio and `/v1/chat/completions`
//! with JSON replies for the analysis stages.

use async_trait::async_trait;
use callwise_common::config::EngineConfig;
use callwise_common::{Error, Result};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::error::PipelineError;
use crate::models::{ResolvedPrompt, Stage};

/// Audio handed to the transcription call
#[derive(Debug, Clone)]
pub struct AudioInput {
    pub path: PathBuf,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub language: Option<String>,
}

#[async_trait]
pub trait EnrichmentEngine: Send + Sync {
    /// Speech to text. Errors are `PipelineError::EnrichmentStage`.
    async fn transcribe(
        &self,
        audio: &AudioInput,
        prompt: &ResolvedPrompt,
    ) -> std::result::Result<Transcript, PipelineError>;

    /// Run one downstream stage over a transcript; returns the raw JSON reply
    async fn analyze(
        &self,
        stage: Stage,
        transcript: &str,
        prompt: &ResolvedPrompt,
    ) -> std::result::Result<Value, PipelineError>;
}

pub(crate) fn transient(stage: Stage, message: impl Into<String>) -> PipelineError {
    PipelineError::EnrichmentStage {
        stage,
        message: message.into(),
        transient: true,
    }
}

pub(crate) fn permanent(stage: Stage, message: impl Into<String>) -> PipelineError {
    PipelineError::EnrichmentStage {
        stage,
        message: message.into(),
        transient: false,
    }
}

/// 408, 429 and 5xx are worth retrying; everything else is final
fn classify_status(stage: Stage, status: StatusCode, body: &str) -> PipelineError {
    let message = format!("engine returned {}: {}", status, truncate(body, 200));
    match status.as_u16() {
        408 | 429 => transient(stage, message),
        s if s >= 500 => transient(stage, message),
        _ => permanent(stage, message),
    }
}

fn classify_transport(stage: Stage, err: reqwest::Error) -> PipelineError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        transient(stage, format!("engine request failed: {}", err))
    } else {
        permanent(stage, format!("engine request failed: {}", err))
    }
}

fn truncate(value: &str, max: usize) -> &str {
    match value.char_indices().nth(max) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

pub struct HttpEnrichmentEngine {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    transcription_model: String,
    analysis_model: String,
    rate_limiter: governor::RateLimiter<
        governor::state::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl HttpEnrichmentEngine {
    pub fn new(config: &EngineConfig, requests_per_second: u32) -> Result<Self> {
        let per_second = NonZeroU32::new(requests_per_second)
            .ok_or_else(|| Error::Config("concurrency.ai_requests_per_second must be > 0".to_string()))?;
        let rate_limiter = governor::RateLimiter::direct(governor::Quota::per_second(per_second));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.resolve_api_key(),
            transcription_model: config.transcription_model.clone(),
            analysis_model: config.analysis_model.clone(),
            rate_limiter,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(
        &self,
        stage: Stage,
        request: reqwest::RequestBuilder,
    ) -> std::result::Result<String, PipelineError> {
        self.rate_limiter.until_ready().await;

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| classify_transport(stage, e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| classify_transport(stage, e))?;

        if !status.is_success() {
            return Err(classify_status(stage, status, &body));
        }
        Ok(body)
    }
}

#[async_trait]
impl EnrichmentEngine for HttpEnrichmentEngine {
    async fn transcribe(
        &self,
        audio: &AudioInput,
        prompt: &ResolvedPrompt,
    ) -> std::result::Result<Transcript, PipelineError> {
        let stage = Stage::Transcription;
        let bytes = tokio::fs::read(&audio.path).await.map_err(|e| {
            permanent(stage, format!("cannot read {}: {}", audio.path.display(), e))
        })?;

        let file_name = audio
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "recording.wav".to_string());
        let mut part = Part::bytes(bytes).file_name(file_name);
        if let Some(content_type) = &audio.content_type {
            part = part
                .mime_str(content_type)
                .map_err(|e| permanent(stage, format!("invalid content type: {}", e)))?;
        }

        let form = Form::new()
            .text("model", self.transcription_model.clone())
            .text("response_format", "verbose_json")
            .text("prompt", prompt.body.clone())
            .part("file", part);

        debug!(path = %audio.path.display(), prompt = %prompt.identity(), "Requesting transcription");
        let url = format!("{}/v1/audio/transcriptions", self.base_url);
        let body = self.send(stage, self.client.post(url).multipart(form)).await?;

        let parsed: TranscriptionResponse = serde_json::from_str(&body)
            .map_err(|e| permanent(stage, format!("unparseable transcription reply: {}", e)))?;
        Ok(Transcript {
            text: parsed.text,
            language: parsed.language,
        })
    }

    async fn analyze(
        &self,
        stage: Stage,
        transcript: &str,
        prompt: &ResolvedPrompt,
    ) -> std::result::Result<Value, PipelineError> {
        let request = json!({
            "model": self.analysis_model,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": prompt.body },
                { "role": "user", "content": transcript },
            ],
        });

        debug!(stage = %stage, prompt = %prompt.identity(), "Requesting analysis");
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = self.send(stage, self.client.post(url).json(&request)).await?;

        let parsed: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| permanent(stage, format!("unparseable completion reply: {}", e)))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| permanent(stage, "completion reply has no content"))?;

        serde_json::from_str(&content)
            .map_err(|e| permanent(stage, format!("completion content is not JSON: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Retryable;

    #[test]
    fn test_status_classification() {
        let stage = Stage::Summary;
        assert!(classify_status(stage, StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status(stage, StatusCode::REQUEST_TIMEOUT, "").is_transient());
        assert!(classify_status(stage, StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(!classify_status(stage, StatusCode::BAD_REQUEST, "").is_transient());
        assert!(!classify_status(stage, StatusCode::UNAUTHORIZED, "").is_transient());
    }

    #[test]
    fn test_zero_rate_is_a_config_error() {
        let result = HttpEnrichmentEngine::new(&EngineConfig::default(), 0);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
