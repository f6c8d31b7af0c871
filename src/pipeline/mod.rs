//! # Pipeline Coordinator
//!
//! Runs one voice question end to end against the bound backing services:
//!
//! `Record → Transcribe → Embed → Retrieve → Augment → Generate+Parse → Outcome`
//!
//! ## Failure policy:
//! - **Record / Transcribe / Embed / Retrieve**: any failure ends the request at that stage
//! - **Generate+Parse**: an answer without a usable JSON payload is regenerated, up to
//!   `max_attempts` in total; any other generation error ends the request immediately
//!
//! ## Key Rust Concepts:
//! - **Borrowed clients**: each run clones the `Arc` handles it needs out of the binding table
//!   and never keeps them past the request
//! - **`tokio::select!`**: every network stage races the request's `CancellationToken`
//! - **Cooperative cancellation**: the generation loop checks the token between tokens

pub mod augment;
pub mod parse;

use futures_util::StreamExt;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clients::generation::GenerationClient;
use crate::clients::transcription::{ServiceReply, Transcript};
use crate::clients::{ClientError, ClientResult};
use crate::config::PipelineConfig;
use crate::services::bindings::{NotBound, ServiceBindingTable};
use crate::services::ServiceKind;
use augment::{augment_prompt, join_context};
use parse::{parse_answer, FormatError, StructuredAnswer};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub audio_path: PathBuf,
    pub top_n: usize,
    pub max_attempts: u32,
}

impl From<&PipelineConfig> for PipelineSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            audio_path: PathBuf::from(&config.audio_file),
            top_n: config.top_n,
            max_attempts: config.max_parse_attempts.max(1),
        }
    }
}

/// One inbound question.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    /// Where the transcription engine records to and reads from
    pub audio_path: PathBuf,
    /// When present and non-empty, Record and Transcribe are skipped
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Record,
    Transcribe,
    Embed,
    Retrieve,
    Augment,
    Generate,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Record => "record",
            PipelineStage::Transcribe => "transcribe",
            PipelineStage::Embed => "embed",
            PipelineStage::Retrieve => "retrieve",
            PipelineStage::Augment => "augment",
            PipelineStage::Generate => "generate",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineStatus {
    Success,
    Failed { stage: PipelineStage, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineOutcome {
    pub status: PipelineStatus,
    /// Raw text of the last generated answer, empty if generation never ran
    pub answer: String,
    pub payload: Option<StructuredAnswer>,
    pub attempts: u32,
}

impl PipelineOutcome {
    fn failed(stage: PipelineStage, error: impl fmt::Display, answer: String, attempts: u32) -> Self {
        Self {
            status: PipelineStatus::Failed {
                stage,
                reason: error.to_string(),
            },
            answer,
            payload: None,
            attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Success
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    NotBound(#[from] NotBound),

    #[error("{service} returned HTTP {status}: {body}")]
    ServiceStatus {
        service: ServiceKind,
        status: u16,
        body: String,
    },

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("embedding result was empty")]
    EmptyEmbedding,

    #[error("request was cancelled")]
    Cancelled,
}

struct StageFailure {
    stage: PipelineStage,
    error: StageError,
}

fn at<E: Into<StageError>>(stage: PipelineStage) -> impl FnOnce(E) -> StageFailure {
    move |error| StageFailure {
        stage,
        error: error.into(),
    }
}

/// Await a client call unless the request is cancelled first.
async fn cancellable<T, F>(cancel: &CancellationToken, call: F) -> Result<T, StageError>
where
    F: Future<Output = ClientResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StageError::Cancelled),
        result = call => result.map_err(StageError::from),
    }
}

fn ensure_success(reply: ServiceReply) -> Result<ServiceReply, StageError> {
    if reply.is_success() {
        Ok(reply)
    } else {
        Err(StageError::ServiceStatus {
            service: ServiceKind::Transcription,
            status: reply.status,
            body: reply.body,
        })
    }
}

/// Stream a completion and concatenate its tokens, stopping early on cancellation.
pub async fn collect_answer(
    client: &dyn GenerationClient,
    prompt: &str,
    cancel: &CancellationToken,
) -> Result<String, StageError> {
    let mut tokens = cancellable(cancel, client.generate_stream(prompt)).await?;
    let mut answer = String::new();
    while let Some(token) = tokens.next().await {
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }
        answer.push_str(&token?);
    }
    Ok(answer)
}

pub struct PipelineCoordinator {
    bindings: Arc<ServiceBindingTable>,
    settings: PipelineSettings,
}

impl PipelineCoordinator {
    pub fn new(bindings: Arc<ServiceBindingTable>, settings: PipelineSettings) -> Self {
        Self { bindings, settings }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// A request for the configured audio file.
    pub fn request(&self, prompt: Option<String>) -> PipelineRequest {
        PipelineRequest {
            audio_path: self.settings.audio_path.clone(),
            prompt,
        }
    }

    pub async fn run(&self, request: PipelineRequest, cancel: &CancellationToken) -> PipelineOutcome {
        let outcome = match self.prepare(&request, cancel).await {
            Ok(augmented) => self.generate_and_parse(&augmented, cancel).await,
            Err(failure) => PipelineOutcome::failed(failure.stage, failure.error, String::new(), 0),
        };

        match &outcome.status {
            PipelineStatus::Success => info!(attempts = outcome.attempts, "pipeline finished"),
            PipelineStatus::Failed { stage, reason } => {
                warn!(stage = %stage, attempts = outcome.attempts, reason = %reason, "pipeline failed")
            }
        }
        outcome
    }

    /// Everything up to and including augmentation.
    async fn prepare(&self, request: &PipelineRequest, cancel: &CancellationToken) -> Result<String, StageFailure> {
        let prompt = match request.prompt.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            Some(prompt) => prompt.to_string(),
            None => self.capture_prompt(&request.audio_path, cancel).await?,
        };

        let context = self.retrieve_context(&prompt, cancel).await?;

        debug!(stage = %PipelineStage::Augment, context_bytes = context.len(), "augmenting prompt");
        Ok(augment_prompt(&prompt, &context))
    }

    async fn capture_prompt(&self, audio_path: &Path, cancel: &CancellationToken) -> Result<String, StageFailure> {
        let transcription = self
            .bindings
            .transcription()
            .await
            .map_err(at(PipelineStage::Record))?;

        debug!(stage = %PipelineStage::Record, path = %audio_path.display(), "recording");
        cancellable(cancel, transcription.record(audio_path))
            .await
            .and_then(ensure_success)
            .map_err(at(PipelineStage::Record))?;

        debug!(stage = %PipelineStage::Transcribe, path = %audio_path.display(), "transcribing");
        let reply = cancellable(cancel, transcription.transcribe(audio_path))
            .await
            .and_then(ensure_success)
            .map_err(at(PipelineStage::Transcribe))?;
        let transcript = Transcript::parse(&reply.body).map_err(at(PipelineStage::Transcribe))?;

        let text = transcript.text();
        debug!(stage = %PipelineStage::Transcribe, segments = transcript.segments().len(), "transcript: {}", text);
        Ok(text)
    }

    /// Embed the prompt and turn the nearest documents into one context string.
    async fn retrieve_context(&self, prompt: &str, cancel: &CancellationToken) -> Result<String, StageFailure> {
        let generation = self.bindings.generation().await.map_err(at(PipelineStage::Embed))?;
        let embeddings = cancellable(cancel, generation.embed(prompt))
            .await
            .map_err(at(PipelineStage::Embed))?;

        let vector = match embeddings.into_iter().next() {
            Some(vector) if !vector.is_empty() => vector,
            _ => return Err(at(PipelineStage::Embed)(StageError::EmptyEmbedding)),
        };
        debug!(stage = %PipelineStage::Embed, dimensions = vector.len(), "prompt embedded");

        let store = self.bindings.vector_store().await.map_err(at(PipelineStage::Retrieve))?;
        let hits = cancellable(cancel, store.query(std::slice::from_ref(&vector), self.settings.top_n, None))
            .await
            .map_err(at(PipelineStage::Retrieve))?;
        debug!(stage = %PipelineStage::Retrieve, documents = hits.len(), "documents retrieved");

        Ok(join_context(&hits))
    }

    async fn generate_and_parse(&self, prompt: &str, cancel: &CancellationToken) -> PipelineOutcome {
        let generation = match self.bindings.generation().await {
            Ok(client) => client,
            Err(err) => return PipelineOutcome::failed(PipelineStage::Generate, err, String::new(), 0),
        };

        let mut answer = String::new();
        let mut last_format_error: Option<FormatError> = None;

        for attempt in 1..=self.settings.max_attempts {
            debug!(stage = %PipelineStage::Generate, attempt, "generating answer");
            answer = match collect_answer(generation.as_ref(), prompt, cancel).await {
                Ok(answer) => answer,
                Err(err) => return PipelineOutcome::failed(PipelineStage::Generate, err, answer, attempt),
            };

            match parse_answer(&answer) {
                Ok(payload) => {
                    return PipelineOutcome {
                        status: PipelineStatus::Success,
                        answer,
                        payload: Some(payload),
                        attempts: attempt,
                    }
                }
                Err(err) => {
                    warn!(attempt, error = %err, "answer had no usable payload, regenerating");
                    last_format_error = Some(err);
                }
            }
        }

        let reason = match last_format_error {
            Some(err) => format!("no usable answer after {} attempts: {}", self.settings.max_attempts, err),
            None => format!("no usable answer after {} attempts", self.settings.max_attempts),
        };
        PipelineOutcome::failed(PipelineStage::Generate, reason, answer, self.settings.max_attempts)
    }
}
