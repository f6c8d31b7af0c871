//! The full voice pipeline over HTTP.

use actix_web::{web, HttpResponse};
use tracing::info;

use crate::error::{ApiEnvelope, AppResult};
use crate::handlers::{DataBody, DataRequest};
use crate::state::AppState;

/// `POST /api/rag/ask`: record, transcribe, retrieve and answer.
///
/// A non-empty `Data` replaces the recorded question. The content is the serialized
/// `PipelineOutcome` in both the Success and the Error envelope.
pub async fn ask(state: web::Data<AppState>, body: DataBody) -> AppResult<HttpResponse> {
    let prompt = DataRequest::from_body(body)?;
    let request = state.pipeline.request(Some(prompt).filter(|p| !p.trim().is_empty()));

    let outcome = state.pipeline.run(request, &state.shutdown.child_token()).await;
    let content = serde_json::to_string(&outcome)?;

    if outcome.is_success() {
        info!(attempts = outcome.attempts, "answered voice question");
        Ok(ApiEnvelope::ok(content))
    } else {
        Ok(HttpResponse::BadGateway().json(ApiEnvelope::error(content)))
    }
}
