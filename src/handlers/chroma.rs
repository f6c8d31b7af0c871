//! Vector store endpoint.

use actix_web::{web, HttpResponse};
use tracing::debug;

use crate::clients::generation::EmbeddingVector;
use crate::error::{ApiEnvelope, AppError, AppResult};
use crate::handlers::{DataBody, DataRequest};
use crate::pipeline::augment::join_context;
use crate::state::AppState;

/// `POST /api/chroma/query`: `Data` is an embedding as a JSON array of numbers; content is
/// the nearest documents joined one per line.
pub async fn query(state: web::Data<AppState>, body: DataBody) -> AppResult<HttpResponse> {
    let data = DataRequest::required(body)?;
    let embedding: EmbeddingVector = serde_json::from_str(&data).map_err(|_| AppError::invalid_request())?;
    if embedding.is_empty() {
        return Err(AppError::invalid_request());
    }

    let store = state.bindings.vector_store().await?;
    let top_n = state.pipeline.settings().top_n;
    let hits = store.query(std::slice::from_ref(&embedding), top_n, None).await?;
    debug!(collection = %store.collection().name, documents = hits.len(), "query answered");

    Ok(ApiEnvelope::ok(join_context(&hits)))
}
