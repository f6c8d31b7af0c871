//! Forwards a gateway action to this server's own HTTP API.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid action `{0}`")]
    InvalidAction(String),
    #[error("{0}")]
    Transport(#[from] reqwest::Error),
}

#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    /// Run `action` with `data` and return the response body as text.
    async fn dispatch(&self, action: &str, data: &str) -> Result<String, DispatchError>;
}

/// Non-empty `/`-separated segments of `[A-Za-z0-9_-]`, e.g. `ollama/chat`.
pub fn is_valid_action(action: &str) -> bool {
    !action.is_empty()
        && action.split('/').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        })
}

/// POSTs `{"Data": data}` to `<base_url>/api/<action>`.
pub struct HttpActionDispatcher {
    http: reqwest::Client,
    base_url: String,
}

impl HttpActionDispatcher {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    fn url(&self, action: &str) -> String {
        format!("{}/api/{}", self.base_url.trim_end_matches('/'), action)
    }
}

#[async_trait]
impl ActionDispatcher for HttpActionDispatcher {
    async fn dispatch(&self, action: &str, data: &str) -> Result<String, DispatchError> {
        if !is_valid_action(action) {
            return Err(DispatchError::InvalidAction(action.to_string()));
        }

        let url = self.url(action);
        debug!(url = %url, "dispatching gateway action");
        let response = self.http.post(&url).json(&json!({ "Data": data })).send().await?;

        let status = response.status();
        if status.is_success() {
            Ok(response.text().await?)
        } else {
            Ok(format!("API Error: {}", status))
        }
    }
}
