//! # Voice RAG Orchestrator - Main Application Entry Point
//!
//! Local control plane for a voice question-answering assistant. It keeps three locally hosted
//! backing services running (a generation engine, a vector store and a transcription engine),
//! binds typed clients to them, and runs the voice pipeline
//! `Record → Transcribe → Embed → Retrieve → Augment → Generate+Parse` on request.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: every network and process operation is asynchronous
//! - **Arc & trait objects**: shared state whose collaborators can be swapped in tests
//! - **CancellationToken**: one root token cancels every in-flight pipeline on shutdown
//! - **static**: the shutdown flag lives for the whole program
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **state**: shared application state and request metrics
//! - **services**: descriptors, health probe, process supervisor, binding table, orchestrator
//! - **clients**: HTTP clients for the three backing services
//! - **pipeline**: the voice question-answering pipeline
//! - **gateway**: the realtime WebSocket gateway
//! - **handlers** / **health** / **middleware** / **error**: the HTTP surface

mod clients;
mod config;
mod error;
mod gateway;
mod handlers;
mod health;
mod middleware;
mod pipeline;
mod services;
mod state;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use crate::config::AppConfig;
use crate::state::{AppState, Collaborators};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once a termination signal arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// Starts the control surface and waits for it to stop.
///
/// ## Steps:
/// 1. Load `.env`, install tracing, load and validate configuration
/// 2. Build the shared state with the real probe, process table and HTTP clients
/// 3. Serve the HTTP API and the realtime gateway until a signal arrives
/// 4. Cancel in-flight pipeline runs and stop the server gracefully
///
/// Backing services are not started here; `POST /api/general/open` does that on demand.
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-rag-orchestrator v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    for (kind, service) in config.services.iter() {
        info!(
            service = %kind,
            process = %service.process_name,
            address = %format!("{}:{}", service.host, service.port),
            "backing service configured"
        );
    }

    let http = reqwest::Client::builder().build()?;
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let collaborators = Collaborators::system(&config, http);
    let app_state = web::Data::new(AppState::new(config, collaborators));
    let shutdown = app_state.shutdown.clone();

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            // Executed in reverse order for responses
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .configure(handlers::configure)
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            shutdown.cancel();
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` if set, otherwise debug for this crate and info for actix.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_rag_orchestrator=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Ctrl+C everywhere, SIGTERM on unix. A handler that cannot be installed is logged
/// instead of aborting startup.
fn setup_signal_handlers() {
    tokio::spawn(async {
        if wait_for_signal().await {
            SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
        }
    });
}

/// False when no signal handler could be installed.
async fn wait_for_signal() -> bool {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    true
                }
                result = tokio::signal::ctrl_c() => ctrl_c_received(result),
            },
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c_received(tokio::signal::ctrl_c().await)
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c_received(tokio::signal::ctrl_c().await)
    }
}

fn ctrl_c_received(result: std::io::Result<()>) -> bool {
    match result {
        Ok(()) => {
            info!("Received Ctrl+C");
            true
        }
        Err(e) => {
            error!("Failed to listen for Ctrl+C: {}", e);
            false
        }
    }
}

/// Poll the shutdown flag every 100 ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
