//! # Backing Services
//!
//! Everything needed to discover, start and bind the three backing services:
//! - **probe**: side-effect-free reachability check
//! - **supervisor**: process lookup, detached launch and termination
//! - **bindings**: the shared table of live client handles
//! - **binder**: constructs a typed client for a reachable service
//! - **orchestrator**: probe → start → bind for all three services

pub mod binder;
pub mod bindings;
pub mod orchestrator;
pub mod probe;
pub mod supervisor;

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// One of the three externally supervised services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// Text generation and embedding engine
    Generation,
    VectorStore,
    /// Speech transcription engine
    Transcription,
}

impl ServiceKind {
    /// The order `EnsureServicesRunning` walks the services in.
    pub const STARTUP_ORDER: [ServiceKind; 3] = [
        ServiceKind::Generation,
        ServiceKind::VectorStore,
        ServiceKind::Transcription,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            ServiceKind::Generation => "generation engine",
            ServiceKind::VectorStore => "vector store",
            ServiceKind::Transcription => "transcription engine",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Backoff schedule for re-probing a service after it was launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_wait: Duration,
}

/// Immutable description of one backing service, created once from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingServiceDescriptor {
    pub kind: ServiceKind,
    /// Exact OS process name
    pub name: String,
    pub host: String,
    pub port: u16,
    pub launch: LaunchCommand,
    pub working_dir: Option<PathBuf>,
    pub readiness: ReadinessPolicy,
}

impl BackingServiceDescriptor {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}
