//! # Voice Relay Backend - Main Application Entry Point
//!
//! Relays a browser voice/text chat to a Gemini conversational model over a WebSocket.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML file + environment variables)
//! - **error**: Error types and their HTTP responses
//! - **state**: Shared state handed to every handler
//! - **audio**: Per-client audio buffering and payload decoding
//! - **backend**: The conversational model seam and its Gemini implementation
//! - **voice**: Sessions, the connection registry and the message router
//! - **websocket**: The actix actor that owns each browser socket
//! - **tts**: Optional speech synthesis service
//! - **health / handlers / middleware**: HTTP surface
//!
//! ## Startup:
//! Missing configuration or a missing `GEMINI_API_KEY` is fatal: `main` returns the
//! error before the server binds.

mod audio;
mod backend;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod state;
mod tts;
mod voice;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use backend::GeminiBackend;
use config::{AppConfig, BackendCredentials};
use state::AppState;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tts::SpeechService;

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-relay-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    debug!("Effective configuration:\n{}", config.to_toml()?);

    let credentials = BackendCredentials::from_env()
        .with_context(|| format!("{} must be set to reach the conversational model", config::API_KEY_ENV))?;
    let backend = GeminiBackend::new(&config, credentials).context("Failed to build Gemini client")?;
    info!(model = %config.models.llm_model, "Conversational backend ready");

    // No bundled engine: TTS stays unavailable unless one is injected here
    let speech = Arc::new(SpeechService::disabled(config.speech.clone()));
    speech.init().await;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let app_state = AppState::new(config, Arc::new(backend), speech.clone());

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware executes in reverse order of registration for requests
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/speech", web::post().to(handlers::synthesize_speech)),
            )
            .route("/", web::get().to(health::root))
            .route("/health", web::get().to(health::health_check))
            .route("/app", web::get().to(handlers::serve_frontend))
            .route("/app.js", web::get().to(handlers::serve_script))
            .route("/ws/voice/{client_id}", web::get().to(websocket::voice_websocket))
    })
    .disable_signals()
    .bind(&bind_addr)
    .with_context(|| format!("Failed to bind {}", bind_addr))?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    speech.shutdown().await;
    info!("Server stopped gracefully");
    Ok(())
}

/// Structured console logging. `RUST_LOG` overrides the default filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("Failed to initialize tracing")?;

    Ok(())
}

/// Resolves on the first SIGINT or SIGTERM.
///
/// If a handler cannot be installed the other one still works; if neither can, this
/// never resolves and the process is stopped the hard way.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install SIGINT handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received SIGINT");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
