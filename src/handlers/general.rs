//! Control surface: open, close and liveness.

use actix_web::{web, HttpResponse};
use tracing::{error, info};

use super::{DataBody, DataRequest};
use crate::error::{ApiEnvelope, AppError, AppResult};
use crate::state::AppState;

/// `POST /api/general/open`: ensure all backing services are running and bound.
pub async fn open(state: web::Data<AppState>, body: DataBody) -> AppResult<HttpResponse> {
    DataRequest::from_body(body)?;

    match state.orchestrator.ensure_services_running().await {
        Ok(report) => {
            info!("backing services ready");
            Ok(ApiEnvelope::ok(report.summary()))
        }
        Err(err) => {
            error!(service = ?err.service(), error = %err, "failed to open backing services");
            Err(err.into())
        }
    }
}

/// `POST /api/general/close`: terminate all backing services and clear the bindings.
pub async fn close(state: web::Data<AppState>, body: DataBody) -> AppResult<HttpResponse> {
    DataRequest::from_body(body)?;

    let report = state.orchestrator.shutdown_services().await;

    if report.processes.is_empty() {
        return Ok(ApiEnvelope::ok("No backing-service processes were running."));
    }
    if report.is_clean() {
        Ok(ApiEnvelope::ok(report.summary()))
    } else {
        Err(AppError::Upstream(report.summary()))
    }
}

/// `POST /api/general/alive`: liveness of this process only.
pub async fn alive(state: web::Data<AppState>, body: DataBody) -> AppResult<HttpResponse> {
    DataRequest::from_body(body)?;

    if state.orchestrator.is_alive() {
        Ok(ApiEnvelope::ok("Alive"))
    } else {
        Ok(HttpResponse::ServiceUnavailable().json(ApiEnvelope::error("Not alive")))
    }
}
