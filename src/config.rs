//! # Configuration Management
//!
//! Loads the orchestrator configuration from several sources, in priority order:
//! 1. Environment variables (`APP_` prefix, `__` between nested keys)
//! 2. `config.toml` in the working directory (optional)
//! 3. Built-in defaults (the `Default` impl below)
//!
//! `HOST` and `PORT` are honoured as a special case for the control-surface listener.
//!
//! ## Example overrides:
//! - `APP_SERVER__PORT=6000`
//! - `APP_SERVICES__GENERATION__PORT=11500`
//! - `APP_PIPELINE__DEFAULT_MODEL=llama3`

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::{BackingServiceDescriptor, LaunchCommand, ReadinessPolicy, ServiceKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub services: ServicesConfig,
    pub supervisor: SupervisorConfig,
    pub pipeline: PipelineConfig,
    pub gateway: GatewayConfig,
}

/// Listener for the control surface and the realtime gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// The three backing services plus the probe timeout shared by all of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    pub probe_timeout_ms: u64,
    pub generation: ServiceConfig,
    pub vector_store: ServiceConfig,
    pub transcription: ServiceConfig,
}

/// How to find, reach and launch one backing service.
///
/// ## Fields:
/// - `process_name`: exact OS process name used for lookup and termination
/// - `host` / `port`: where the service listens once it is up
/// - `program` / `args`: the launch command used when the service is absent
/// - `working_dir`: optional directory the launch command runs in
/// - `readiness`: backoff schedule used to re-probe after a launch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub process_name: String,
    pub host: String,
    pub port: u16,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub readiness: ReadinessConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_wait_ms: u64,
}

/// Termination behaviour for `POST /api/general/close`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// How long to wait for one killed process to exit before reporting it as timed out
    pub terminate_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub default_model: String,
    pub collection: String,
    pub audio_file: String,
    pub top_n: usize,
    pub max_parse_attempts: u32,
    pub transcription_api_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub users: Vec<GatewayUser>,
    pub token_secret: String,
    pub issuer: String,
    pub audience: String,
    pub token_ttl_minutes: i64,
    /// Base URL actions are dispatched to; defaults to this server's own listener
    pub api_base_url: Option<String>,
    pub reject_unauthenticated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayUser {
    pub user_id: String,
    pub password: String,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 250,
            max_backoff_ms: 4_000,
            max_wait_ms: 30_000,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 5293,
            },
            services: ServicesConfig {
                probe_timeout_ms: 1_000,
                generation: ServiceConfig {
                    process_name: "ollama".to_string(),
                    host: "localhost".to_string(),
                    port: 11434,
                    program: "ollama".to_string(),
                    args: vec!["serve".to_string()],
                    working_dir: None,
                    readiness: ReadinessConfig::default(),
                },
                vector_store: ServiceConfig {
                    process_name: "chroma".to_string(),
                    host: "localhost".to_string(),
                    port: 8000,
                    program: "chroma".to_string(),
                    args: vec![
                        "run".to_string(),
                        "--path".to_string(),
                        "../chromadb".to_string(),
                        "--host".to_string(),
                        "localhost".to_string(),
                        "--port".to_string(),
                        "8000".to_string(),
                    ],
                    working_dir: None,
                    readiness: ReadinessConfig::default(),
                },
                transcription: ServiceConfig {
                    process_name: "faster-whisper".to_string(),
                    host: "localhost".to_string(),
                    port: 5023,
                    program: "python".to_string(),
                    args: vec!["faster-whisper_server.py".to_string()],
                    working_dir: None,
                    // Loads a speech model before it starts listening.
                    readiness: ReadinessConfig {
                        initial_backoff_ms: 500,
                        max_backoff_ms: 5_000,
                        max_wait_ms: 120_000,
                    },
                },
            },
            supervisor: SupervisorConfig {
                terminate_timeout_ms: 10_000,
                poll_interval_ms: 100,
            },
            pipeline: PipelineConfig {
                default_model: "phi3".to_string(),
                collection: "docs".to_string(),
                audio_file: "voice.wav".to_string(),
                top_n: 10,
                max_parse_attempts: 5,
                transcription_api_prefix: "faster-whisper/api".to_string(),
            },
            gateway: GatewayConfig {
                users: vec![GatewayUser {
                    user_id: "validUser".to_string(),
                    password: "validPassword".to_string(),
                }],
                token_secret: "change-me-before-deploying".to_string(),
                issuer: "voice-rag-orchestrator".to_string(),
                audience: "voice-rag-clients".to_string(),
                token_ttl_minutes: 30,
                api_base_url: None,
                reject_unauthenticated: false,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("services.generation.args")
                    .with_list_parse_key("services.vector_store.args")
                    .with_list_parse_key("services.transcription.args")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations the orchestrator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        for (kind, service) in self.services.iter() {
            if service.port == 0 {
                return Err(anyhow::anyhow!("{} port cannot be 0", kind));
            }
            if service.program.trim().is_empty() {
                return Err(anyhow::anyhow!("{} launch program must not be empty", kind));
            }
            if service.process_name.trim().is_empty() {
                return Err(anyhow::anyhow!("{} process name must not be empty", kind));
            }
            if service.readiness.max_wait_ms == 0 {
                return Err(anyhow::anyhow!("{} readiness max_wait_ms must be greater than 0", kind));
            }
            if service.readiness.initial_backoff_ms == 0 {
                return Err(anyhow::anyhow!("{} readiness initial_backoff_ms must be greater than 0", kind));
            }
            if service.readiness.max_backoff_ms < service.readiness.initial_backoff_ms {
                return Err(anyhow::anyhow!(
                    "{} readiness max_backoff_ms must not be below initial_backoff_ms",
                    kind
                ));
            }
        }

        if self.pipeline.top_n == 0 {
            return Err(anyhow::anyhow!("Pipeline top_n must be greater than 0"));
        }

        if self.pipeline.max_parse_attempts == 0 {
            return Err(anyhow::anyhow!("Pipeline max_parse_attempts must be greater than 0"));
        }

        if self.gateway.token_secret.is_empty() {
            return Err(anyhow::anyhow!("Gateway token secret must not be empty"));
        }

        if self.gateway.users.is_empty() {
            return Err(anyhow::anyhow!("Gateway needs at least one configured user"));
        }

        Ok(())
    }

    /// Base URL the realtime gateway dispatches actions to.
    pub fn api_base_url(&self) -> String {
        match &self.gateway.api_base_url {
            Some(url) if !url.trim().is_empty() => url.trim_end_matches('/').to_string(),
            _ => format!("http://{}:{}", self.server.host, self.server.port),
        }
    }
}

impl ServicesConfig {
    /// Services paired with their kind, in startup order.
    pub fn iter(&self) -> impl Iterator<Item = (ServiceKind, &ServiceConfig)> {
        [
            (ServiceKind::Generation, &self.generation),
            (ServiceKind::VectorStore, &self.vector_store),
            (ServiceKind::Transcription, &self.transcription),
        ]
        .into_iter()
    }

    /// Build the immutable descriptors the orchestrator works from.
    pub fn descriptors(&self) -> Vec<BackingServiceDescriptor> {
        self.iter()
            .map(|(kind, service)| service.to_descriptor(kind))
            .collect()
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl ServiceConfig {
    pub fn to_descriptor(&self, kind: ServiceKind) -> BackingServiceDescriptor {
        BackingServiceDescriptor {
            kind,
            name: self.process_name.clone(),
            host: self.host.clone(),
            port: self.port,
            launch: LaunchCommand {
                program: self.program.clone(),
                args: self.args.clone(),
            },
            working_dir: self
                .working_dir
                .as_deref()
                .filter(|dir| !dir.trim().is_empty())
                .map(PathBuf::from),
            readiness: ReadinessPolicy {
                initial_backoff: Duration::from_millis(self.readiness.initial_backoff_ms.max(1)),
                max_backoff: Duration::from_millis(self.readiness.max_backoff_ms.max(1)),
                max_wait: Duration::from_millis(self.readiness.max_wait_ms),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 5293);
        assert_eq!(config.pipeline.top_n, 10);
        assert_eq!(config.pipeline.max_parse_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.services.vector_store.port = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("vector store"));

        let mut config = AppConfig::default();
        config.gateway.users.clear();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.services.generation.readiness.initial_backoff_ms = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("initial_backoff_ms"), "{}", err);

        let mut config = AppConfig::default();
        config.services.transcription.readiness.max_backoff_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_descriptors_follow_startup_order() {
        let config = AppConfig::default();
        let descriptors = config.services.descriptors();
        let kinds: Vec<ServiceKind> = descriptors.iter().map(|d| d.kind).collect();
        assert_eq!(kinds, ServiceKind::STARTUP_ORDER.to_vec());
        assert_eq!(descriptors[0].name, "ollama");
        assert_eq!(descriptors[1].address(), "localhost:8000");
        assert_eq!(descriptors[2].base_url(), "http://localhost:5023");
        assert!(descriptors[2].readiness.max_wait > descriptors[0].readiness.max_wait);
    }

    #[test]
    fn test_api_base_url_defaults_to_listener() {
        let mut config = AppConfig::default();
        assert_eq!(config.api_base_url(), "http://127.0.0.1:5293");

        config.gateway.api_base_url = Some("http://gateway.local:9000/".to_string());
        assert_eq!(config.api_base_url(), "http://gateway.local:9000");
    }
}
