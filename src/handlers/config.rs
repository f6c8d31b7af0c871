use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::{json, Value};

const REDACTED: &str = "********";

/// `GET /api/v1/config`: the effective configuration, without secrets.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let mut config = serde_json::to_value(state.config.as_ref())?;

    if let Some(gateway) = config.get_mut("gateway") {
        gateway["token_secret"] = json!(REDACTED);
        if let Some(Value::Array(users)) = gateway.get_mut("users") {
            for user in users.iter_mut() {
                user["password"] = json!(REDACTED);
            }
        }
    }

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "api_base_url": state.config.api_base_url(),
        "config": config
    })))
}
