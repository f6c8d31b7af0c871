//! Generation engine endpoints.

use actix_web::{web, HttpResponse};
use tracing::{info, warn};

use crate::clients::generation::accumulate_pull;
use crate::error::{ApiEnvelope, AppError, AppResult};
use crate::handlers::{DataBody, DataRequest};
use crate::pipeline::augment::augment_prompt;
use crate::pipeline::collect_answer;
use crate::state::AppState;

/// `POST /api/ollama/pull`: download a model; content is the accumulated progress lines.
pub async fn pull(state: web::Data<AppState>, body: DataBody) -> AppResult<HttpResponse> {
    let model = DataRequest::required(body)?;
    let client = state.bindings.generation().await?;

    info!(model = %model, "pulling model");
    let progress = client.pull_model(&model).await?;
    let lines = accumulate_pull(progress).await?;
    Ok(ApiEnvelope::ok(lines))
}

/// `POST /api/ollama/select`: change the model used for embedding and generation.
pub async fn select(state: web::Data<AppState>, body: DataBody) -> AppResult<HttpResponse> {
    let model = DataRequest::required(body)?;
    let client = state.bindings.generation().await?;

    client.select_model(model.trim());
    info!(model = %client.selected_model(), "model selected");
    Ok(ApiEnvelope::ok(client.selected_model()))
}

/// `POST /api/ollama/embed`: content is the first embedding vector as a JSON array.
pub async fn embed(state: web::Data<AppState>, body: DataBody) -> AppResult<HttpResponse> {
    let input = DataRequest::required(body)?;
    let client = state.bindings.generation().await?;

    let vector = client
        .embed(&input)
        .await?
        .into_iter()
        .next()
        .filter(|vector| !vector.is_empty())
        .ok_or_else(|| AppError::Upstream("embedding result was empty".to_string()))?;

    Ok(ApiEnvelope::ok(serde_json::to_string(&vector)?))
}

/// `POST /api/ollama/generate`: augment without context and return the raw answer.
pub async fn generate(state: web::Data<AppState>, body: DataBody) -> AppResult<HttpResponse> {
    let prompt = DataRequest::required(body)?;
    let client = state.bindings.generation().await?;

    let cancel = state.shutdown.child_token();
    let answer = collect_answer(client.as_ref(), &augment_prompt(&prompt, ""), &cancel).await?;
    Ok(ApiEnvelope::ok(answer))
}

/// `POST /api/ollama/chat`: the pipeline from embedding on, with `Data` as the prompt.
pub async fn chat(state: web::Data<AppState>, body: DataBody) -> AppResult<HttpResponse> {
    let prompt = DataRequest::required(body)?;
    let request = state.pipeline.request(Some(prompt));

    let outcome = state.pipeline.run(request, &state.shutdown.child_token()).await;
    if outcome.is_success() {
        Ok(ApiEnvelope::ok(outcome.answer))
    } else {
        warn!(attempts = outcome.attempts, "chat request failed");
        Err(AppError::Upstream(serde_json::to_string(&outcome.status)?))
    }
}
