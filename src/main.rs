//! # ASR Stream Backend - Main Application Entry Point
//!
//! Actix-web server exposing a WebSocket job channel for streaming speech
//! transcription, plus health, metrics, and runtime configuration endpoints.
//!
//! ## Application Architecture:
//! - **config**: configuration loading (TOML files + environment variables)
//! - **state**: shared state, job metrics, and the pipeline slot
//! - **protocol**: job channel message schema
//! - **audio**: binary audio frame decoding
//! - **transcription**: pipeline lifecycle, streaming orchestration, and the
//!   Candle Whisper backend
//! - **websocket**: the `/ws/transcribe` connection actor

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod protocol;
mod state;
mod transcription;
mod websocket;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::engine::ProgressSink;
use transcription::manager::PipelineManager;
use transcription::policy::{DeviceKind, ModelDescriptor};
use transcription::whisper::WhisperLoader;

/// Set once a shutdown signal arrives; the server loop polls it.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting asr-stream-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{}",
        config.server.host, config.server.port
    );

    let pipelines = Arc::new(PipelineManager::new(Arc::new(WhisperLoader::new())));
    let app_state = AppState::new(config.clone(), pipelines);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    preload_default_pipeline(&app_state);
    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .route("/ws/transcribe", web::get().to(websocket::transcribe_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/health", web::get().to(health::health_check))
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
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "asr_stream_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Warm the pipeline slot with the configured default model so the first job
/// does not wait through the full download and load.
fn preload_default_pipeline(state: &AppState) {
    let pipelines = Arc::clone(&state.pipelines);
    let model = state.get_config().models.default_model;

    tokio::spawn(async move {
        let descriptor = ModelDescriptor::from_job(&model, false, false, DeviceKind::Cpu);
        let progress: ProgressSink = Arc::new(|_| {});
        match pipelines.resolve(&descriptor, progress).await {
            Ok(_) => info!("Preloaded pipeline for {}", descriptor.model_id),
            Err(err) => warn!(
                "Pipeline preload failed for {}: {}",
                descriptor.model_id, err
            ),
        }
    });
}

fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
