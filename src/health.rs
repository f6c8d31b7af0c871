use crate::services::bindings::{BindingSnapshot, LiveStatus};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Overall label from the binding states. The process itself is always up if it answers.
fn overall_status(bindings: &[BindingSnapshot]) -> &'static str {
    if bindings.iter().all(|binding| binding.status == LiveStatus::Live) {
        "healthy"
    } else if bindings.iter().any(|binding| binding.status == LiveStatus::Dead) {
        "degraded"
    } else {
        "idle"
    }
}

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let bindings = state.bindings.snapshot().await;

    HttpResponse::Ok().json(json!({
        "status": overall_status(&bindings),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": state.config.server.host,
            "port": state.config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate()
        },
        "backing_services": bindings
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats: Vec<_> = metrics.endpoint_metrics.iter().collect();
    endpoint_stats.sort_by(|a, b| a.0.cmp(b.0));
    let endpoint_stats: Vec<_> = endpoint_stats
        .into_iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::testing::ScriptedGeneration;
    use crate::handlers::configure;
    use crate::handlers::testing::read_envelope;
    use crate::services::bindings::BoundClient;
    use crate::services::ServiceKind;
    use crate::state::testing::app_state;
    use actix_web::{test, App};
    use std::sync::Arc;

    #[actix_web::test]
    async fn test_health_lists_bindings_in_startup_order() {
        let state = app_state();
        state
            .bindings
            .bind(BoundClient::Generation(Arc::new(ScriptedGeneration::new(vec![]))), "phi3")
            .await;
        state
            .bindings
            .mark_dead(ServiceKind::Transcription, "connection refused")
            .await;
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(configure)).await;

        let req = test::TestRequest::get().uri("/api/v1/health").to_request();
        let (status, body) = read_envelope(test::call_service(&app, req).await).await;

        assert_eq!(status, 200);
        assert_eq!(body["status"], "degraded");
        let services = body["backing_services"].as_array().unwrap();
        assert_eq!(services.len(), 3);
        assert_eq!(services[0]["status"], "Live");
        assert_eq!(services[0]["detail"], "phi3");
        assert_eq!(services[1]["status"], "Unknown");
        assert_eq!(services[2]["status"], "Dead");
    }

    #[actix_web::test]
    async fn test_root_health_is_idle_before_open() {
        let app = test::init_service(App::new().app_data(web::Data::new(app_state())).configure(configure)).await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let (status, body) = read_envelope(test::call_service(&app, req).await).await;

        assert_eq!(status, 200);
        assert_eq!(body["status"], "idle");
    }

    #[actix_web::test]
    async fn test_metrics_reports_recorded_endpoints() {
        let state = app_state();
        state.record_request("POST /api/rag/ask", 30, true);
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(configure)).await;

        let req = test::TestRequest::get().uri("/api/v1/metrics").to_request();
        let (_, body) = read_envelope(test::call_service(&app, req).await).await;

        assert_eq!(body["overall"]["total_errors"], 1);
        assert_eq!(body["endpoints"][0]["endpoint"], "POST /api/rag/ask");
        assert_eq!(body["endpoints"][0]["error_rate"], 1.0);
    }
}
