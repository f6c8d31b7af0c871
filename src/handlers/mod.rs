//! # HTTP Handlers
//!
//! The control surface and the per-service endpoints. Every POST endpoint takes the same
//! body, `{"Data": "<string>"}`, and answers with the `{result, content}` envelope.
//!
//! ## Route groups:
//! - `/api/general/*`: open / close / alive (the orchestrator), also mounted at `/open`,
//!   `/close` and `/alive`
//! - `/api/ollama/*`: generation engine operations
//! - `/api/chroma/*`: vector store query
//! - `/api/whisper/*`: transcription engine operations
//! - `/api/rag/ask`: the full voice pipeline
//! - `/api/v1/*` and `/health`: health, metrics and effective configuration

pub mod chroma;
pub mod config;
pub mod general;
pub mod ollama;
pub mod rag;
pub mod whisper;

use actix_web::{error::JsonPayloadError, web, HttpRequest};
use serde::Deserialize;
use tracing::debug;

use crate::error::AppError;
use crate::{gateway, health};

/// Request body shared by every POST endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct DataRequest {
    #[serde(default, alias = "Data")]
    pub data: Option<String>,
}

/// The body as accepted by handlers: JSON `null` deserializes to `None`.
pub type DataBody = web::Json<Option<DataRequest>>;

impl DataRequest {
    /// `Data` of a present body, `""` when the field is missing. A null body is rejected.
    pub fn from_body(body: DataBody) -> Result<String, AppError> {
        match body.into_inner() {
            Some(request) => Ok(request.data.unwrap_or_default()),
            None => Err(AppError::invalid_request()),
        }
    }

    /// Like [`DataRequest::from_body`] but also rejects an empty `Data`.
    pub fn required(body: DataBody) -> Result<String, AppError> {
        let data = Self::from_body(body)?;
        if data.trim().is_empty() {
            return Err(AppError::invalid_request());
        }
        Ok(data)
    }
}

/// Absent, non-JSON or wrongly typed bodies become a 400 envelope.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err: JsonPayloadError, req: &HttpRequest| {
        debug!(path = %req.path(), error = %err, "rejected request body");
        AppError::invalid_request().into()
    })
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config())
        .service(
            web::scope("/api/general")
                .route("/open", web::post().to(general::open))
                .route("/close", web::post().to(general::close))
                .route("/alive", web::post().to(general::alive)),
        )
        .service(
            web::scope("/api/ollama")
                .route("/pull", web::post().to(ollama::pull))
                .route("/select", web::post().to(ollama::select))
                .route("/embed", web::post().to(ollama::embed))
                .route("/generate", web::post().to(ollama::generate))
                .route("/chat", web::post().to(ollama::chat)),
        )
        .service(web::scope("/api/chroma").route("/query", web::post().to(chroma::query)))
        .service(
            web::scope("/api/whisper")
                .route("/record", web::post().to(whisper::record))
                .route("/transcribe", web::post().to(whisper::transcribe))
                .route("/whisper", web::post().to(whisper::whisper)),
        )
        .service(web::scope("/api/rag").route("/ask", web::post().to(rag::ask)))
        .service(
            web::scope("/api/v1")
                .route("/health", web::get().to(health::health_check))
                .route("/metrics", web::get().to(health::detailed_metrics))
                .route("/config", web::get().to(config::get_config)),
        )
        .route("/open", web::post().to(general::open))
        .route("/close", web::post().to(general::close))
        .route("/alive", web::post().to(general::alive))
        .route("/health", web::get().to(health::health_check))
        .route("/ws", web::get().to(gateway::realtime_gateway));
}

#[cfg(test)]
pub(crate) mod testing {
    use actix_web::body::MessageBody;
    use actix_web::dev::ServiceResponse;

    /// Status and parsed JSON body of a response.
    pub async fn read_envelope<B: MessageBody>(response: ServiceResponse<B>) -> (u16, serde_json::Value) {
        let status = response.status().as_u16();
        let body = actix_web::test::read_body(response).await;
        let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, value)
    }
}
