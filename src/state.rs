//! # Application State Management
//!
//! Everything handlers share, built once in `main` and handed to actix as `web::Data`.
//!
//! ## Key Rust Concepts:
//!
//! ### Shared Ownership with Arc
//! - **Arc**: every worker thread holds a clone of the same state
//! - **Trait objects**: the dispatcher is `Arc<dyn ActionDispatcher>` so tests can swap it
//!
//! ### Interior Mutability
//! - **RwLock** around the request metrics; everything else is immutable after startup or
//!   synchronises internally (the binding table, the orchestrator's single-flight slot)

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::gateway::auth::Authenticator;
use crate::gateway::dispatch::{ActionDispatcher, HttpActionDispatcher};
use crate::pipeline::{PipelineCoordinator, PipelineSettings};
use crate::services::binder::{ClientBinder, HttpClientBinder};
use crate::services::bindings::ServiceBindingTable;
use crate::services::orchestrator::ServiceOrchestrator;
use crate::services::probe::{HealthProbe, TcpProbe};
use crate::services::supervisor::{ProcessSupervisor, ProcessTable, SystemProcessTable};

pub struct AppState {
    pub config: Arc<AppConfig>,
    pub bindings: Arc<ServiceBindingTable>,
    pub orchestrator: ServiceOrchestrator,
    pub pipeline: Arc<PipelineCoordinator>,
    pub authenticator: Arc<Authenticator>,
    pub dispatcher: Arc<dyn ActionDispatcher>,
    /// Cancelled when the server shuts down; pipeline runs use child tokens
    pub shutdown: CancellationToken,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,
}

/// Request counters kept by `MetricsMiddleware`.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// The swappable collaborators behind [`AppState`].
pub struct Collaborators {
    pub probe: Arc<dyn HealthProbe>,
    pub process_table: Arc<dyn ProcessTable>,
    pub binder: Arc<dyn ClientBinder>,
    pub dispatcher: Arc<dyn ActionDispatcher>,
}

impl Collaborators {
    /// Real network, process table and HTTP clients.
    pub fn system(config: &AppConfig, http: reqwest::Client) -> Self {
        Self {
            probe: Arc::new(TcpProbe),
            process_table: Arc::new(SystemProcessTable::new()),
            binder: Arc::new(HttpClientBinder::new(
                http.clone(),
                config.pipeline.default_model.clone(),
                config.pipeline.collection.clone(),
                config.pipeline.transcription_api_prefix.clone(),
            )),
            dispatcher: Arc::new(HttpActionDispatcher::new(http, config.api_base_url())),
        }
    }
}

impl AppState {
    pub fn new(config: AppConfig, collaborators: Collaborators) -> Self {
        let descriptors = config.services.descriptors();
        let bindings = Arc::new(ServiceBindingTable::new(&descriptors));

        let supervisor = ProcessSupervisor::new(
            collaborators.process_table,
            Duration::from_millis(config.supervisor.terminate_timeout_ms),
            Duration::from_millis(config.supervisor.poll_interval_ms),
        );
        let orchestrator = ServiceOrchestrator::new(
            descriptors,
            collaborators.probe,
            supervisor,
            collaborators.binder,
            Arc::clone(&bindings),
            config.services.probe_timeout(),
        );
        let pipeline = Arc::new(PipelineCoordinator::new(
            Arc::clone(&bindings),
            PipelineSettings::from(&config.pipeline),
        ));
        let authenticator = Arc::new(Authenticator::from_config(&config.gateway));

        Self {
            config: Arc::new(config),
            bindings,
            orchestrator,
            pipeline,
            authenticator,
            dispatcher: collaborators.dispatcher,
            shutdown: CancellationToken::new(),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    pub fn record_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.request_count += 1;
        if is_error {
            metrics.error_count += 1;
        }

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
