//! Constructs the typed client for a service that is known to be reachable.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use super::bindings::BoundClient;
use super::{BackingServiceDescriptor, ServiceKind};
use crate::clients::generation::{accumulate_pull, GenerationClient, OllamaClient};
use crate::clients::transcription::WhisperClient;
use crate::clients::vector::{ChromaClient, CollectionClient};
use crate::clients::ClientError;

/// A freshly constructed client plus a human-readable note about how binding went.
pub struct BindResult {
    pub client: BoundClient,
    pub detail: String,
}

#[async_trait]
pub trait ClientBinder: Send + Sync {
    async fn bind(&self, descriptor: &BackingServiceDescriptor) -> Result<BindResult, ClientError>;
}

/// Binds the real HTTP clients.
///
/// ## Per service:
/// - **Generation**: select the default model and pull it, accumulating progress lines
/// - **Vector store**: get-or-create the configured collection and scope a client to it
/// - **Transcription**: construct the client, no handshake
pub struct HttpClientBinder {
    http: reqwest::Client,
    default_model: String,
    collection: String,
    transcription_api_prefix: String,
}

impl HttpClientBinder {
    pub fn new(
        http: reqwest::Client,
        default_model: impl Into<String>,
        collection: impl Into<String>,
        transcription_api_prefix: impl Into<String>,
    ) -> Self {
        Self {
            http,
            default_model: default_model.into(),
            collection: collection.into(),
            transcription_api_prefix: transcription_api_prefix.into(),
        }
    }
}

#[async_trait]
impl ClientBinder for HttpClientBinder {
    async fn bind(&self, descriptor: &BackingServiceDescriptor) -> Result<BindResult, ClientError> {
        let base_url = descriptor.base_url();

        match descriptor.kind {
            ServiceKind::Generation => {
                let client = OllamaClient::new(self.http.clone(), &base_url, &self.default_model);
                client.select_model(&self.default_model);

                info!(model = %self.default_model, "pulling default model");
                let progress = client.pull_model(&self.default_model).await?;
                let status = accumulate_pull(progress).await?;
                debug!(model = %self.default_model, status = %status.trim_end(), "model pull finished");

                Ok(BindResult {
                    client: BoundClient::Generation(Arc::new(client)),
                    detail: status,
                })
            }
            ServiceKind::VectorStore => {
                let store = ChromaClient::new(self.http.clone(), &base_url);
                let collection = store.get_or_create_collection(&self.collection).await?;
                let detail = format!("collection {} ({})", self.collection, collection.collection().id);

                Ok(BindResult {
                    client: BoundClient::VectorStore(Arc::new(collection)),
                    detail,
                })
            }
            ServiceKind::Transcription => {
                let client = WhisperClient::new(self.http.clone(), &base_url, &self.transcription_api_prefix);
                Ok(BindResult {
                    client: BoundClient::Transcription(Arc::new(client)),
                    detail: format!("{}/{}", base_url, self.transcription_api_prefix),
                })
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::clients::testing::{CannedTranscription, FixedCollection, ScriptedGeneration};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Binder that hands out in-memory clients and can be told to fail per service.
    #[derive(Default)]
    pub struct FakeBinder {
        pub fail: Mutex<HashSet<ServiceKind>>,
        pub calls: AtomicUsize,
        pub bound: Mutex<Vec<ServiceKind>>,
    }

    #[async_trait]
    impl ClientBinder for FakeBinder {
        async fn bind(&self, descriptor: &BackingServiceDescriptor) -> Result<BindResult, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.lock().unwrap().contains(&descriptor.kind) {
                return Err(ClientError::Remote(format!("{} refused the handshake", descriptor.kind)));
            }
            self.bound.lock().unwrap().push(descriptor.kind);

            let client = match descriptor.kind {
                ServiceKind::Generation => BoundClient::Generation(Arc::new(ScriptedGeneration::new(vec![]))),
                ServiceKind::VectorStore => BoundClient::VectorStore(Arc::new(FixedCollection::new(&[]))),
                ServiceKind::Transcription => {
                    BoundClient::Transcription(Arc::new(CannedTranscription::new(r#"{"segments":[]}"#)))
                }
            };
            Ok(BindResult {
                client,
                detail: "bound".to_string(),
            })
        }
    }
}
