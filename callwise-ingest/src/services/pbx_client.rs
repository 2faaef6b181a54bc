//! PBX recording download
//!
//! `PbxClient` is the seam between the recording retriever and the network;
//! `HttpPbxClient` implements the three supported download schemes.

use async_trait::async_trait;
use callwise_common::{Error, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::error::PipelineError;
use crate::models::{PbxProfile, PbxSystem};

/// Audio bytes returned by a PBX
#[derive(Debug, Clone)]
pub struct DownloadedRecording {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait PbxClient: Send + Sync {
    /// Download one recording
    ///
    /// Errors are `RecordingUnavailable`, `RecordingRejected` or
    /// `TransientFetch`; only the last is retried by the caller.
    async fn download(
        &self,
        profile: &PbxProfile,
        reference: &str,
    ) -> std::result::Result<DownloadedRecording, PipelineError>;
}

/// Map a non-success HTTP status to the fetch error taxonomy
pub fn classify_status(status: StatusCode, context: &str) -> PipelineError {
    let message = format!("{} returned {}", context, status);
    match status.as_u16() {
        404 | 410 => PipelineError::RecordingUnavailable(message),
        408 | 429 => PipelineError::TransientFetch(message),
        s if s >= 500 => PipelineError::TransientFetch(message),
        _ => PipelineError::RecordingRejected(message),
    }
}

fn classify_transport(err: reqwest::Error, context: &str) -> PipelineError {
    // Connection refused, DNS, timeouts and reset streams are all worth retrying
    PipelineError::TransientFetch(format!("{}: {}", context, err))
}

#[derive(Debug, Deserialize)]
struct ThreeCxLoginResponse {
    #[serde(rename = "Status")]
    status: Option<String>,
    #[serde(rename = "Token")]
    token: Option<ThreeCxToken>,
}

#[derive(Debug, Deserialize)]
struct ThreeCxToken {
    access_token: String,
}

pub struct HttpPbxClient {
    client: reqwest::Client,
}

impl HttpPbxClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("callwise-ingest/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build PBX HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// URL a reference resolves to for the given family
    pub fn recording_url(profile: &PbxProfile, reference: &str) -> String {
        let base = profile.base_url.trim_end_matches('/');
        match profile.system {
            PbxSystem::FreePbx => {
                format!("{}/recordings/{}", base, reference.trim_start_matches('/'))
            }
            PbxSystem::ThreeCx => format!(
                "{}/xapi/v1/Recordings/Pbx.DownloadRecording(recId={})",
                base, reference
            ),
            PbxSystem::Generic => {
                if reference.starts_with("http://") || reference.starts_with("https://") {
                    reference.to_string()
                } else {
                    format!("{}/{}", base, reference.trim_start_matches('/'))
                }
            }
        }
    }

    async fn threecx_token(&self, profile: &PbxProfile) -> std::result::Result<String, PipelineError> {
        let url = format!(
            "{}/webclient/api/Login/GetAccessToken",
            profile.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .json(&json!({
                "Username": profile.username,
                "Password": profile.secret,
                "SecurityCode": "",
            }))
            .send()
            .await
            .map_err(|e| classify_transport(e, "3CX login"))?;

        if !response.status().is_success() {
            // A missing login endpoint is a configuration problem, not a missing recording
            return Err(match classify_status(response.status(), "3CX login") {
                PipelineError::RecordingUnavailable(msg) => PipelineError::RecordingRejected(msg),
                other => other,
            });
        }

        let login: ThreeCxLoginResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::RecordingRejected(format!("3CX login reply: {}", e)))?;

        match login.token {
            Some(token) => Ok(token.access_token),
            None => Err(PipelineError::RecordingRejected(format!(
                "3CX login refused: {}",
                login.status.unwrap_or_else(|| "no token".to_string())
            ))),
        }
    }
}

#[async_trait]
impl PbxClient for HttpPbxClient {
    async fn download(
        &self,
        profile: &PbxProfile,
        reference: &str,
    ) -> std::result::Result<DownloadedRecording, PipelineError> {
        let url = Self::recording_url(profile, reference);
        debug!(system = %profile.system, url = %url, "Downloading recording");

        let request = match profile.system {
            PbxSystem::ThreeCx => {
                let token = self.threecx_token(profile).await?;
                self.client.get(&url).bearer_auth(token)
            }
            PbxSystem::FreePbx | PbxSystem::Generic => self
                .client
                .get(&url)
                .basic_auth(&profile.username, Some(&profile.secret)),
        };

        let response = request
            .send()
            .await
            .map_err(|e| classify_transport(e, "recording download"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, "recording download"));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify_transport(e, "recording body"))?;

        Ok(DownloadedRecording {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(system: PbxSystem) -> PbxProfile {
        PbxProfile {
            system,
            base_url: "https://pbx.example.com/".to_string(),
            username: "admin".to_string(),
            secret: "s3cret".to_string(),
        }
    }

    #[test]
    fn test_recording_urls_per_family() {
        assert_eq!(
            HttpPbxClient::recording_url(&profile(PbxSystem::FreePbx), "/rec/123.1.wav"),
            "https://pbx.example.com/recordings/rec/123.1.wav"
        );
        assert_eq!(
            HttpPbxClient::recording_url(&profile(PbxSystem::ThreeCx), "42"),
            "https://pbx.example.com/xapi/v1/Recordings/Pbx.DownloadRecording(recId=42)"
        );
        assert_eq!(
            HttpPbxClient::recording_url(&profile(PbxSystem::Generic), "files/a.wav"),
            "https://pbx.example.com/files/a.wav"
        );
        assert_eq!(
            HttpPbxClient::recording_url(&profile(PbxSystem::Generic), "https://cdn.example.com/a.wav"),
            "https://cdn.example.com/a.wav"
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, "x"),
            PipelineError::RecordingUnavailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::GONE, "x"),
            PipelineError::RecordingUnavailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "x"),
            PipelineError::RecordingRejected(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, "x"),
            PipelineError::RecordingRejected(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "x"),
            PipelineError::TransientFetch(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, "x"),
            PipelineError::TransientFetch(_)
        ));
    }
}
