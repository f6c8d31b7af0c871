//! # Service Orchestrator
//!
//! Brings the three backing services up in a fixed order and keeps the binding table in
//! sync with what is actually reachable.
//!
//! ## Per service, in startup order:
//! 1. Probe the port. A Live binding whose port still answers is reused as is.
//! 2. If the port is closed, ask the supervisor to start the process, then re-probe with
//!    exponential backoff until the service answers or its readiness window runs out.
//! 3. Bind a typed client. Any failure marks that service Dead and stops the walk; services
//!    bound earlier stay bound so a later call only has to finish the rest.
//!
//! ## Single flight
//! Only one initialization runs at a time. The first caller spawns it and publishes a
//! `Shared` future; callers arriving while it runs await the same result. The work runs on
//! its own task, so a caller that goes away (e.g. a dropped HTTP request) does not abort it.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::binder::{BindResult, ClientBinder};
use super::bindings::{LiveStatus, ServiceBindingTable};
use super::probe::HealthProbe;
use super::supervisor::{ProcessSupervisor, StartOutcome, TerminationReport};
use super::{BackingServiceDescriptor, ServiceKind};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("{service} could not be started: {reason}")]
    StartFailed { service: ServiceKind, reason: String },

    #[error("{service} at {address} did not become reachable within {waited_ms} ms")]
    Unreachable {
        service: ServiceKind,
        address: String,
        waited_ms: u64,
    },

    #[error("binding {service} failed: {reason}")]
    Bind { service: ServiceKind, reason: String },

    #[error("service initialization was aborted: {0}")]
    Aborted(String),
}

impl OrchestratorError {
    pub fn service(&self) -> Option<ServiceKind> {
        match self {
            OrchestratorError::StartFailed { service, .. }
            | OrchestratorError::Unreachable { service, .. }
            | OrchestratorError::Bind { service, .. } => Some(*service),
            OrchestratorError::Aborted(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceAction {
    /// Already Live and still reachable
    Reused,
    /// Reachable without a start, freshly bound
    Bound,
    /// Started (or found starting) by the supervisor, then bound
    Started,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceReport {
    pub service: ServiceKind,
    pub action: ServiceAction,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnsureReport {
    pub services: Vec<ServiceReport>,
}

impl EnsureReport {
    pub fn summary(&self) -> String {
        self.services
            .iter()
            .map(|report| {
                let action = match report.action {
                    ServiceAction::Reused => "already running",
                    ServiceAction::Bound => "bound",
                    ServiceAction::Started => "started and bound",
                };
                format!("{}: {}", report.service, action)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub type EnsureResult = Result<EnsureReport, OrchestratorError>;
type SharedInit = Shared<BoxFuture<'static, EnsureResult>>;

#[derive(Clone)]
pub struct ServiceOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    descriptors: Vec<BackingServiceDescriptor>,
    probe: Arc<dyn HealthProbe>,
    supervisor: ProcessSupervisor,
    binder: Arc<dyn ClientBinder>,
    bindings: Arc<ServiceBindingTable>,
    probe_timeout: Duration,
    inflight: Mutex<Option<(u64, SharedInit)>>,
    next_run: AtomicU64,
}

impl ServiceOrchestrator {
    pub fn new(
        descriptors: Vec<BackingServiceDescriptor>,
        probe: Arc<dyn HealthProbe>,
        supervisor: ProcessSupervisor,
        binder: Arc<dyn ClientBinder>,
        bindings: Arc<ServiceBindingTable>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                descriptors,
                probe,
                supervisor,
                binder,
                bindings,
                probe_timeout,
                inflight: Mutex::new(None),
                next_run: AtomicU64::new(1),
            }),
        }
    }

    /// Probe, start and bind every backing service. Concurrent calls share one run.
    pub async fn ensure_services_running(&self) -> EnsureResult {
        let init = {
            let mut slot = self.inner.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some((run, init)) => {
                    debug!(run, "joining in-flight service initialization");
                    init.clone()
                }
                None => {
                    let run = self.inner.next_run.fetch_add(1, Ordering::SeqCst);
                    let inner = Arc::clone(&self.inner);
                    let task = tokio::spawn(async move {
                        let result = inner.run(run).await;
                        inner.finish(run);
                        result
                    });
                    let init = async move {
                        task.await
                            .unwrap_or_else(|err| Err(OrchestratorError::Aborted(err.to_string())))
                    }
                    .boxed()
                    .shared();
                    *slot = Some((run, init.clone()));
                    init
                }
            }
        };
        init.await
    }

    /// Liveness of the orchestrator process itself. Touches nothing.
    pub fn is_alive(&self) -> bool {
        true
    }

    /// Terminate every process of every backing service, then clear all bindings.
    pub async fn shutdown_services(&self) -> TerminationReport {
        let names: Vec<String> = self
            .inner
            .descriptors
            .iter()
            .map(|descriptor| descriptor.name.clone())
            .collect();

        info!(services = ?names, "shutting down backing services");
        let report = self.inner.supervisor.terminate_all(&names).await;
        self.inner.bindings.clear().await;

        if !report.is_clean() {
            warn!("some backing-service processes did not terminate cleanly");
        }
        report
    }
}

impl Inner {
    fn finish(&self, run: u64) {
        let mut slot = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(slot.as_ref(), Some((current, _)) if *current == run) {
            *slot = None;
        }
    }

    async fn run(&self, run: u64) -> EnsureResult {
        info!(run, "ensuring backing services are running");
        let mut report = EnsureReport::default();
        for descriptor in &self.descriptors {
            match self.ensure_one(descriptor).await {
                Ok(service) => report.services.push(service),
                Err(err) => {
                    error!(run, service = %descriptor.kind, error = %err, "service initialization aborted");
                    return Err(err);
                }
            }
        }
        info!(run, "all backing services bound");
        Ok(report)
    }

    async fn ensure_one(&self, descriptor: &BackingServiceDescriptor) -> Result<ServiceReport, OrchestratorError> {
        let kind = descriptor.kind;
        let reachable = self.is_reachable(descriptor).await;

        if reachable && self.bindings.is_live(kind).await {
            debug!(service = %kind, "binding is live, reusing it");
            return Ok(ServiceReport {
                service: kind,
                action: ServiceAction::Reused,
                detail: descriptor.address(),
            });
        }

        let action = if reachable {
            self.bindings.set_status(kind, LiveStatus::Starting, "binding").await;
            ServiceAction::Bound
        } else {
            self.bindings
                .set_status(kind, LiveStatus::Starting, "not reachable, starting")
                .await;
            self.start(descriptor).await?;
            ServiceAction::Started
        };

        match self.binder.bind(descriptor).await {
            Ok(BindResult { client, detail }) => {
                info!(service = %kind, address = %descriptor.address(), "service bound");
                self.bindings.bind(client, detail.clone()).await;
                Ok(ServiceReport {
                    service: kind,
                    action,
                    detail,
                })
            }
            Err(err) => {
                let reason = err.to_string();
                self.bindings.mark_dead(kind, reason.clone()).await;
                Err(OrchestratorError::Bind { service: kind, reason })
            }
        }
    }

    async fn start(&self, descriptor: &BackingServiceDescriptor) -> Result<(), OrchestratorError> {
        let kind = descriptor.kind;
        let outcome = self.supervisor.ensure_started(descriptor).await;
        if let StartOutcome::StartFailed { reason } = outcome {
            self.bindings.mark_dead(kind, reason.clone()).await;
            return Err(OrchestratorError::StartFailed { service: kind, reason });
        }

        info!(service = %kind, outcome = %outcome, "waiting for service to accept connections");
        if let Err(err) = self.await_ready(descriptor).await {
            self.bindings.mark_dead(kind, err.to_string()).await;
            return Err(err);
        }
        Ok(())
    }

    /// Re-probe with doubling delays until reachable or `max_wait` has passed.
    async fn await_ready(&self, descriptor: &BackingServiceDescriptor) -> Result<(), OrchestratorError> {
        let policy = descriptor.readiness;
        let started = Instant::now();
        let mut delay = policy.initial_backoff;
        let mut attempt = 0u32;

        loop {
            let elapsed = started.elapsed();
            if elapsed >= policy.max_wait {
                return Err(OrchestratorError::Unreachable {
                    service: descriptor.kind,
                    address: descriptor.address(),
                    waited_ms: elapsed.as_millis() as u64,
                });
            }

            tokio::time::sleep(delay.min(policy.max_wait - elapsed)).await;
            attempt += 1;

            if self.is_reachable(descriptor).await {
                debug!(service = %descriptor.kind, attempt, waited_ms = started.elapsed().as_millis() as u64, "service is reachable");
                return Ok(());
            }
            delay = (delay * 2).min(policy.max_backoff);
        }
    }

    async fn is_reachable(&self, descriptor: &BackingServiceDescriptor) -> bool {
        self.probe
            .is_reachable(&descriptor.host, descriptor.port, self.probe_timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::binder::testing::FakeBinder;
    use crate::services::supervisor::testing::FakeProcessTable;
    use crate::services::supervisor::{ProcessTable, TerminationResult};
    use crate::services::testing::descriptors;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};

    /// A port answers when its service has a process in the fake table and the port is not
    /// marked as never opening.
    struct TableProbe {
        table: Arc<FakeProcessTable>,
        names: HashMap<u16, String>,
        closed: Mutex<HashSet<u16>>,
    }

    #[async_trait]
    impl HealthProbe for TableProbe {
        async fn is_reachable(&self, _host: &str, port: u16, _timeout: Duration) -> bool {
            if self.closed.lock().unwrap().contains(&port) {
                return false;
            }
            self.names
                .get(&port)
                .map(|name| !self.table.find_by_name(name).is_empty())
                .unwrap_or(false)
        }
    }

    struct Harness {
        orchestrator: ServiceOrchestrator,
        table: Arc<FakeProcessTable>,
        binder: Arc<FakeBinder>,
        probe: Arc<TableProbe>,
        bindings: Arc<ServiceBindingTable>,
    }

    fn harness(table: FakeProcessTable) -> Harness {
        let descriptors = descriptors();
        let table = Arc::new(table);
        let probe = Arc::new(TableProbe {
            table: table.clone(),
            names: descriptors.iter().map(|d| (d.port, d.name.clone())).collect(),
            closed: Mutex::new(HashSet::new()),
        });
        let binder = Arc::new(FakeBinder::default());
        let bindings = Arc::new(ServiceBindingTable::new(&descriptors));
        let supervisor = ProcessSupervisor::new(table.clone(), Duration::from_millis(20), Duration::from_millis(2));
        let orchestrator = ServiceOrchestrator::new(
            descriptors,
            probe.clone(),
            supervisor,
            binder.clone(),
            bindings.clone(),
            Duration::from_millis(10),
        );
        Harness {
            orchestrator,
            table,
            binder,
            probe,
            bindings,
        }
    }

    fn binder_calls(h: &Harness) -> usize {
        h.binder.calls.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_starts_and_binds_in_order() {
        let h = harness(FakeProcessTable::default());

        let report = h.orchestrator.ensure_services_running().await.unwrap();

        assert_eq!(h.table.spawn_count(), 3);
        assert_eq!(
            h.binder.bound.lock().unwrap().as_slice(),
            &ServiceKind::STARTUP_ORDER
        );
        assert!(report
            .services
            .iter()
            .all(|service| service.action == ServiceAction::Started));
        for kind in ServiceKind::STARTUP_ORDER {
            assert!(h.bindings.is_live(kind).await);
        }
    }

    #[tokio::test]
    async fn test_second_run_starts_nothing() {
        let h = harness(FakeProcessTable::default());

        h.orchestrator.ensure_services_running().await.unwrap();
        let spawned = h.table.spawn_count();
        let bound = binder_calls(&h);

        let report = h.orchestrator.ensure_services_running().await.unwrap();

        assert_eq!(h.table.spawn_count(), spawned);
        assert_eq!(binder_calls(&h), bound);
        assert!(report
            .services
            .iter()
            .all(|service| service.action == ServiceAction::Reused));
        assert!(report.summary().contains("vector store: already running"));
    }

    #[tokio::test]
    async fn test_running_processes_are_bound_without_start() {
        let h = harness(FakeProcessTable::with_processes(&[
            ("ollama", &[1]),
            ("chroma", &[2]),
            ("faster-whisper", &[3]),
        ]));

        let report = h.orchestrator.ensure_services_running().await.unwrap();

        assert_eq!(h.table.spawn_count(), 0);
        assert!(report
            .services
            .iter()
            .all(|service| service.action == ServiceAction::Bound));
    }

    #[tokio::test]
    async fn test_bind_failure_keeps_earlier_bindings() {
        let h = harness(FakeProcessTable::default());
        h.binder.fail.lock().unwrap().insert(ServiceKind::VectorStore);

        let err = h.orchestrator.ensure_services_running().await.unwrap_err();

        assert!(matches!(err, OrchestratorError::Bind { service: ServiceKind::VectorStore, .. }));
        assert_eq!(binder_calls(&h), 2);
        assert!(h.bindings.is_live(ServiceKind::Generation).await);
        assert_eq!(h.bindings.status(ServiceKind::VectorStore).await, LiveStatus::Dead);
        assert_eq!(h.bindings.status(ServiceKind::Transcription).await, LiveStatus::Unknown);

        // A retry only has to finish what failed.
        h.binder.fail.lock().unwrap().clear();
        let report = h.orchestrator.ensure_services_running().await.unwrap();
        assert_eq!(report.services[0].action, ServiceAction::Reused);
        assert_eq!(binder_calls(&h), 4);
    }

    #[tokio::test]
    async fn test_concurrent_calls_share_one_run() {
        let h = harness(FakeProcessTable::default());

        let (first, second) = tokio::join!(
            h.orchestrator.ensure_services_running(),
            h.orchestrator.ensure_services_running()
        );

        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(h.table.spawn_count(), 3);
        assert_eq!(binder_calls(&h), 3);
    }

    #[tokio::test]
    async fn test_service_that_never_opens_its_port() {
        let h = harness(FakeProcessTable::default());
        h.probe.closed.lock().unwrap().insert(5023);

        let err = h.orchestrator.ensure_services_running().await.unwrap_err();

        match err {
            OrchestratorError::Unreachable { service, address, waited_ms } => {
                assert_eq!(service, ServiceKind::Transcription);
                assert_eq!(address, "localhost:5023");
                assert!(waited_ms >= 60);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(h.bindings.status(ServiceKind::Transcription).await, LiveStatus::Dead);
        assert!(h.bindings.is_live(ServiceKind::VectorStore).await);
    }

    #[tokio::test]
    async fn test_launch_failure_is_reported() {
        let h = harness(FakeProcessTable::default());
        h.table.fail_spawn.lock().unwrap().insert("ollama".to_string());

        let err = h.orchestrator.ensure_services_running().await.unwrap_err();

        assert_eq!(err.service(), Some(ServiceKind::Generation));
        assert!(matches!(err, OrchestratorError::StartFailed { .. }));
        assert_eq!(binder_calls(&h), 0);
    }

    #[tokio::test]
    async fn test_shutdown_clears_bindings() {
        let h = harness(FakeProcessTable::default());
        h.orchestrator.ensure_services_running().await.unwrap();

        let report = h.orchestrator.shutdown_services().await;

        assert_eq!(report.processes.len(), 3);
        assert!(report
            .processes
            .iter()
            .all(|entry| entry.result == TerminationResult::Terminated));
        for kind in ServiceKind::STARTUP_ORDER {
            assert_eq!(h.bindings.status(kind).await, LiveStatus::Unknown);
        }
    }

    #[tokio::test]
    async fn test_shutdown_clears_bindings_even_when_kill_fails() {
        let h = harness(FakeProcessTable::with_processes(&[("ollama", &[7])]));
        h.table.refuse_kill.lock().unwrap().insert(7);
        h.orchestrator.ensure_services_running().await.unwrap();

        let report = h.orchestrator.shutdown_services().await;

        assert!(!report.is_clean());
        assert!(h.bindings.generation().await.is_err());
    }

    #[test]
    fn test_is_alive_without_initialization() {
        let h = harness(FakeProcessTable::default());
        assert!(h.orchestrator.is_alive());
        assert_eq!(h.table.spawn_count(), 0);
    }
}
