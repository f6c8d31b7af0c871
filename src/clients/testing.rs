//! In-memory backing-service clients for tests.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::generation::{EmbeddingVector, GenerationClient, PullProgress, PullStream, TokenStream};
use super::transcription::{ServiceReply, TranscriptionClient};
use super::vector::{CollectionClient, CollectionHandle, QueryHit};
use super::{ClientError, ClientResult};

/// Generation client that replays scripted answers, one per `generate_stream` call.
///
/// The last scripted answer repeats once the script is exhausted.
pub struct ScriptedGeneration {
    model: Mutex<String>,
    answers: Mutex<VecDeque<Vec<String>>>,
    last: Mutex<Vec<String>>,
    pub embedding: Mutex<ClientResult<Vec<EmbeddingVector>>>,
    pub generate_error: Mutex<Option<ClientError>>,
    pub prompts: Mutex<Vec<String>>,
    pub generate_calls: AtomicUsize,
    pub embed_calls: AtomicUsize,
}

impl ScriptedGeneration {
    pub fn new(answers: Vec<Vec<&str>>) -> Self {
        let answers: VecDeque<Vec<String>> = answers
            .into_iter()
            .map(|tokens| tokens.into_iter().map(str::to_string).collect())
            .collect();
        Self {
            model: Mutex::new("phi3".to_string()),
            answers: Mutex::new(answers),
            last: Mutex::new(Vec::new()),
            embedding: Mutex::new(Ok(vec![vec![0.1, 0.2, 0.3]])),
            generate_error: Mutex::new(None),
            prompts: Mutex::new(Vec::new()),
            generate_calls: AtomicUsize::new(0),
            embed_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_embedding(self, embedding: Vec<EmbeddingVector>) -> Self {
        *self.embedding.lock().unwrap() = Ok(embedding);
        self
    }
}

fn copy_result<T: Clone>(result: &ClientResult<T>) -> ClientResult<T> {
    match result {
        Ok(value) => Ok(value.clone()),
        Err(err) => Err(ClientError::Remote(err.to_string())),
    }
}

#[async_trait]
impl GenerationClient for ScriptedGeneration {
    fn selected_model(&self) -> String {
        self.model.lock().unwrap().clone()
    }

    fn select_model(&self, model: &str) {
        *self.model.lock().unwrap() = model.to_string();
    }

    async fn pull_model(&self, _model: &str) -> ClientResult<PullStream> {
        let events = vec![
            Ok(PullProgress {
                status: "pulling manifest".to_string(),
                ..Default::default()
            }),
            Ok(PullProgress {
                status: "success".to_string(),
                total: Some(10),
                completed: Some(10),
                error: None,
            }),
        ];
        Ok(stream::iter(events).boxed())
    }

    async fn embed(&self, _input: &str) -> ClientResult<Vec<EmbeddingVector>> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        copy_result(&self.embedding.lock().unwrap())
    }

    async fn generate_stream(&self, prompt: &str) -> ClientResult<TokenStream> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());

        if let Some(err) = self.generate_error.lock().unwrap().take() {
            return Err(err);
        }

        let tokens = {
            let mut answers = self.answers.lock().unwrap();
            let mut last = self.last.lock().unwrap();
            if let Some(next) = answers.pop_front() {
                *last = next;
            }
            last.clone()
        };
        Ok(stream::iter(tokens.into_iter().map(Ok)).boxed())
    }
}

pub struct FixedCollection {
    handle: CollectionHandle,
    documents: Vec<String>,
    pub queries: Mutex<Vec<(usize, usize, bool)>>,
}

impl FixedCollection {
    pub fn new(documents: &[&str]) -> Self {
        Self {
            handle: CollectionHandle {
                id: "collection-1".to_string(),
                name: "docs".to_string(),
            },
            documents: documents.iter().map(|doc| doc.to_string()).collect(),
            queries: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl CollectionClient for FixedCollection {
    fn collection(&self) -> &CollectionHandle {
        &self.handle
    }

    /// Records `(embedding count, top_n, has filter)` for each call.
    async fn query(
        &self,
        embeddings: &[EmbeddingVector],
        top_n: usize,
        filter: Option<serde_json::Value>,
    ) -> ClientResult<Vec<QueryHit>> {
        self.queries
            .lock()
            .unwrap()
            .push((embeddings.len(), top_n, filter.is_some()));
        Ok(self
            .documents
            .iter()
            .take(top_n)
            .map(|document| QueryHit {
                document: document.clone(),
                metadata: None,
            })
            .collect())
    }
}

/// Transcription client with canned replies per endpoint.
pub struct CannedTranscription {
    pub record: ServiceReply,
    pub transcribe: ServiceReply,
    pub calls: Mutex<Vec<(String, PathBuf)>>,
}

impl CannedTranscription {
    pub fn new(transcript_body: &str) -> Self {
        Self {
            record: ServiceReply {
                status: 200,
                body: "recorded".to_string(),
            },
            transcribe: ServiceReply {
                status: 200,
                body: transcript_body.to_string(),
            },
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_names(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(name, _)| name.clone()).collect()
    }
}

#[async_trait]
impl TranscriptionClient for CannedTranscription {
    async fn record(&self, path: &Path) -> ClientResult<ServiceReply> {
        self.calls.lock().unwrap().push(("record".to_string(), path.to_path_buf()));
        Ok(self.record.clone())
    }

    async fn transcribe(&self, path: &Path) -> ClientResult<ServiceReply> {
        self.calls.lock().unwrap().push(("transcribe".to_string(), path.to_path_buf()));
        Ok(self.transcribe.clone())
    }

    async fn whisper(&self, path: &Path) -> ClientResult<ServiceReply> {
        self.calls.lock().unwrap().push(("whisper".to_string(), path.to_path_buf()));
        Ok(self.transcribe.clone())
    }
}
