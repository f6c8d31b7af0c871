//! Transcription engine endpoints. All three act on the configured audio file.

use actix_web::{web, HttpResponse};
use tracing::warn;

use super::{DataBody, DataRequest};
use crate::clients::transcription::{ServiceReply, Transcript};
use crate::error::{ApiEnvelope, AppError, AppResult};
use crate::state::AppState;

fn passthrough(action: &str, reply: ServiceReply) -> AppResult<HttpResponse> {
    if reply.is_success() {
        Ok(ApiEnvelope::ok(reply.body))
    } else {
        warn!(action, status = reply.status, "transcription engine rejected the call");
        Err(AppError::Upstream(reply.body))
    }
}

/// `POST /api/whisper/record`
pub async fn record(state: web::Data<AppState>, body: DataBody) -> AppResult<HttpResponse> {
    DataRequest::from_body(body)?;
    let client = state.bindings.transcription().await?;
    let reply = client.record(&state.pipeline.settings().audio_path).await?;
    passthrough("record", reply)
}

/// `POST /api/whisper/transcribe`: content is the concatenated segment text.
pub async fn transcribe(state: web::Data<AppState>, body: DataBody) -> AppResult<HttpResponse> {
    DataRequest::from_body(body)?;
    let client = state.bindings.transcription().await?;
    let reply = client.transcribe(&state.pipeline.settings().audio_path).await?;
    if !reply.is_success() {
        return passthrough("transcribe", reply);
    }

    let transcript = Transcript::parse(&reply.body)?;
    Ok(ApiEnvelope::ok(transcript.text()))
}

/// `POST /api/whisper/whisper`: record and transcribe in one engine call; content is the
/// engine's reply body.
pub async fn whisper(state: web::Data<AppState>, body: DataBody) -> AppResult<HttpResponse> {
    DataRequest::from_body(body)?;
    let client = state.bindings.transcription().await?;
    let reply = client.whisper(&state.pipeline.settings().audio_path).await?;
    passthrough("whisper", reply)
}
