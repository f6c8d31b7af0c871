//! Transcription engine client.
//!
//! The engine has no structured API beyond three POST endpoints taking `{"filePath": ...}`,
//! so replies are returned raw and callers decide what a non-2xx status means.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{ClientError, ClientResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(default)]
    pub start: f64,
    #[serde(default)]
    pub end: f64,
    /// `null` for a segment with no recognised speech
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    /// `null` or missing when nothing was recognised
    #[serde(default)]
    pub segments: Option<Vec<Segment>>,
}

impl Transcript {
    pub fn parse(body: &str) -> ClientResult<Self> {
        serde_json::from_str(body).map_err(|err| ClientError::Decode(format!("transcript: {}", err)))
    }

    pub fn segments(&self) -> &[Segment] {
        self.segments.as_deref().unwrap_or_default()
    }

    /// Segment texts joined in segment order, without separators.
    pub fn text(&self) -> String {
        self.segments()
            .iter()
            .filter_map(|segment| segment.text.as_deref())
            .collect()
    }
}

/// Status code and body of one transcription engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceReply {
    pub status: u16,
    pub body: String,
}

impl ServiceReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait TranscriptionClient: Send + Sync {
    /// Capture microphone audio into `path`.
    async fn record(&self, path: &Path) -> ClientResult<ServiceReply>;

    async fn transcribe(&self, path: &Path) -> ClientResult<ServiceReply>;

    /// Record and transcribe in one call.
    async fn whisper(&self, path: &Path) -> ClientResult<ServiceReply>;
}

pub struct WhisperClient {
    http: reqwest::Client,
    endpoint: String,
}

impl WhisperClient {
    /// `api_prefix` is the path segment the engine serves its routes under.
    pub fn new(http: reqwest::Client, base_url: &str, api_prefix: &str) -> Self {
        Self {
            http,
            endpoint: format!(
                "{}/{}",
                base_url.trim_end_matches('/'),
                api_prefix.trim_matches('/')
            ),
        }
    }

    fn url(&self, action: &str) -> String {
        format!("{}/{}", self.endpoint, action)
    }

    async fn call(&self, action: &str, path: &Path) -> ClientResult<ServiceReply> {
        let response = self
            .http
            .post(self.url(action))
            .json(&serde_json::json!({ "filePath": path.to_string_lossy() }))
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(ServiceReply { status, body })
    }
}

#[async_trait]
impl TranscriptionClient for WhisperClient {
    async fn record(&self, path: &Path) -> ClientResult<ServiceReply> {
        self.call("record", path).await
    }

    async fn transcribe(&self, path: &Path) -> ClientResult<ServiceReply> {
        self.call("transcribe", path).await
    }

    async fn whisper(&self, path: &Path) -> ClientResult<ServiceReply> {
        self.call("whisper", path).await
    }
}
