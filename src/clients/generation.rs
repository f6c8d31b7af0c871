//! Generation / embedding engine client (Ollama HTTP API).

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{PoisonError, RwLock};

use super::{check_status, ndjson_stream, ClientError, ClientResult};

const SERVICE: &str = "generation engine";

/// Fixed-dimension vector produced by the embedding model.
pub type EmbeddingVector = Vec<f32>;

pub type TokenStream = BoxStream<'static, ClientResult<String>>;
pub type PullStream = BoxStream<'static, ClientResult<PullProgress>>;

/// One progress event from a model pull.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PullProgress {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub completed: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl PullProgress {
    /// Download progress in percent; 0 when the event carries no byte counts.
    pub fn percent(&self) -> f64 {
        match (self.completed, self.total) {
            (Some(completed), Some(total)) if total > 0 => completed as f64 * 100.0 / total as f64,
            _ => 0.0,
        }
    }

    /// The `"<percent>% <status>\r\n"` line accumulated into pull status text.
    pub fn status_line(&self) -> String {
        format!("{:.0}% {}\r\n", self.percent(), self.status)
    }
}

/// Operations the orchestrator and pipeline need from the generation engine.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    fn selected_model(&self) -> String;

    fn select_model(&self, model: &str);

    async fn pull_model(&self, model: &str) -> ClientResult<PullStream>;

    /// Embed `input` with the selected model.
    async fn embed(&self, input: &str) -> ClientResult<Vec<EmbeddingVector>>;

    /// Generate a completion for `prompt`, yielding tokens as they arrive.
    async fn generate_stream(&self, prompt: &str) -> ClientResult<TokenStream>;
}

/// Drain a pull stream into the accumulated status text.
///
/// Progress errors reported by the engine are recorded as lines; only a transport failure
/// aborts the pull.
pub async fn accumulate_pull(mut progress: PullStream) -> ClientResult<String> {
    let mut status = String::new();
    while let Some(event) = progress.next().await {
        match event {
            Ok(event) => {
                if let Some(error) = &event.error {
                    status.push_str(&format!("error: {}\r\n", error));
                } else {
                    status.push_str(&event.status_line());
                }
            }
            Err(err) if err.is_transport() => return Err(err),
            Err(err) => status.push_str(&format!("error: {}\r\n", err)),
        }
    }
    Ok(status)
}

pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: RwLock<String>,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<EmbeddingVector>,
}

#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    error: Option<String>,
}

impl OllamaClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: RwLock::new(model.into()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path)
    }
}

#[async_trait]
impl GenerationClient for OllamaClient {
    fn selected_model(&self) -> String {
        self.model.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn select_model(&self, model: &str) {
        *self.model.write().unwrap_or_else(PoisonError::into_inner) = model.to_string();
    }

    async fn pull_model(&self, model: &str) -> ClientResult<PullStream> {
        let response = self
            .http
            .post(self.url("pull"))
            .json(&json!({ "model": model, "stream": true }))
            .send()
            .await?;
        let response = check_status(SERVICE, response).await?;
        Ok(ndjson_stream(response.bytes_stream()))
    }

    async fn embed(&self, input: &str) -> ClientResult<Vec<EmbeddingVector>> {
        let model = self.selected_model();
        let response = self
            .http
            .post(self.url("embed"))
            .json(&EmbedRequest { model: &model, input })
            .send()
            .await?;
        let response = check_status(SERVICE, response).await?;
        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|err| ClientError::Decode(err.to_string()))?;
        Ok(body.embeddings)
    }

    async fn generate_stream(&self, prompt: &str) -> ClientResult<TokenStream> {
        let model = self.selected_model();
        let response = self
            .http
            .post(self.url("generate"))
            .json(&json!({ "model": model, "prompt": prompt, "stream": true }))
            .send()
            .await?;
        let response = check_status(SERVICE, response).await?;

        let tokens = ndjson_stream::<GenerateChunk, _, _>(response.bytes_stream()).map(|chunk| {
            let chunk = chunk?;
            match chunk.error {
                Some(error) => Err(ClientError::Remote(error)),
                None => Ok(chunk.response),
            }
        });
        Ok(tokens.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[test]
    fn test_pull_progress_percent() {
        let event = PullProgress {
            status: "downloading".to_string(),
            total: Some(200),
            completed: Some(50),
            error: None,
        };
        assert_eq!(event.percent(), 25.0);
        assert_eq!(event.status_line(), "25% downloading\r\n");

        let event = PullProgress {
            status: "success".to_string(),
            ..Default::default()
        };
        assert_eq!(event.status_line(), "0% success\r\n");
    }

    #[tokio::test]
    async fn test_accumulate_pull_keeps_remote_errors() {
        let events: Vec<ClientResult<PullProgress>> = vec![
            Ok(PullProgress {
                status: "pulling manifest".to_string(),
                ..Default::default()
            }),
            Ok(PullProgress {
                error: Some("disk full".to_string()),
                ..Default::default()
            }),
            Err(ClientError::Decode("garbage".to_string())),
        ];

        let status = accumulate_pull(stream::iter(events).boxed()).await.unwrap();
        assert_eq!(
            status,
            "0% pulling manifest\r\nerror: disk full\r\nerror: unexpected response: garbage\r\n"
        );
    }

    #[test]
    fn test_select_model() {
        let client = OllamaClient::new(reqwest::Client::new(), "http://localhost:11434/", "phi3");
        assert_eq!(client.selected_model(), "phi3");
        client.select_model("llama3");
        assert_eq!(client.selected_model(), "llama3");
        assert_eq!(client.url("embed"), "http://localhost:11434/api/embed");
    }
}
