//! # Backing-Service Clients
//!
//! Thin HTTP clients for the three backing services. Each client sits behind a trait
//! (`GenerationClient`, `CollectionClient`, `TranscriptionClient`) so the orchestrator and
//! the pipeline can be driven by fakes in tests.
//!
//! ## Key Rust Concepts:
//!
//! ### Trait objects
//! - **`Arc<dyn Trait>`**: the binding table stores clients as shared trait objects
//! - **`async_trait`**: lets traits declare `async fn` while staying object safe
//!
//! ### Streams
//! - **`BoxStream<'static, T>`**: a heap-allocated, `Send` stream that can outlive the request
//!   that created it
//! - **`stream::unfold`**: builds a stream from a state value and an async step function

pub mod generation;
pub mod transcription;
pub mod vector;

#[cfg(test)]
pub(crate) mod testing;

use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde::de::DeserializeOwned;

/// Failures talking to a backing service.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{service} returned HTTP {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    /// The service answered 2xx but reported an error in its payload
    #[error("{0}")]
    Remote(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ClientError {
    /// True for network-level failures (connection refused, reset, timeout).
    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Transport(_))
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Turn a non-2xx response into [`ClientError::Status`], keeping the body for the message.
pub(crate) async fn check_status(
    service: &'static str,
    response: reqwest::Response,
) -> ClientResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        service,
        status: status.as_u16(),
        body,
    })
}

/// Decode a newline-delimited JSON body into a stream of `T`.
///
/// Chunks are buffered until a full line is available, so objects split across network
/// reads decode correctly. A trailing line without a newline is decoded when the body ends.
pub(crate) fn ndjson_stream<T, S, B>(bytes: S) -> BoxStream<'static, ClientResult<T>>
where
    T: DeserializeOwned + Send + 'static,
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    struct State<S> {
        bytes: std::pin::Pin<Box<S>>,
        buffer: Vec<u8>,
        finished: bool,
    }

    let state = State {
        bytes: Box::pin(bytes),
        buffer: Vec::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                if let Some(item) = decode_line::<T>(&line) {
                    return Some((item, state));
                }
                continue;
            }

            if state.finished {
                let rest = std::mem::take(&mut state.buffer);
                return decode_line::<T>(&rest).map(|item| (item, state));
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(err)) => {
                    state.finished = true;
                    state.buffer.clear();
                    return Some((Err(ClientError::Transport(err)), state));
                }
                None => state.finished = true,
            }
        }
    })
    .boxed()
}

/// `None` for blank lines.
fn decode_line<T: DeserializeOwned>(line: &[u8]) -> Option<ClientResult<T>> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(serde_json::from_str(text).map_err(|err| ClientError::Decode(format!("{}: {}", err, text))))
}
