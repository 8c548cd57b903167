//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! The Gemini API key is the one value that never lives in these structs. It is a secret,
//! so it is read from `GEMINI_API_KEY` by [`BackendCredentials::from_env`] and is never
//! serialized back out through the config endpoint.
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER__HOST, APP_PERFORMANCE__MIN_AUDIO_BYTES, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;

/// Environment variable holding the Gemini API key.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, models, generation, ...)
/// keeps each concern small and lets the environment override one field at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub generation: GenerationConfig,
    pub performance: PerformanceConfig,
    pub websocket: WebSocketConfig,
    pub frontend: FrontendConfig,
    pub speech: SpeechConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Conversational model settings.
///
/// ## Fields:
/// - `llm_model`: Gemini model identifier used for every session
/// - `api_base`: Base URL of the Generative Language REST API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub llm_model: String,
    pub api_base: String,
}

/// Sampling parameters sent with every generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_output_tokens: u32,
}

/// Performance tuning configuration.
///
/// ## Fields:
/// - `max_concurrent_sessions`: Maximum number of live voice connections
/// - `min_audio_bytes`: Completed recordings smaller than this are treated as noise
/// - `backend_timeout_secs`: Upper bound on a single generation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub min_audio_bytes: usize,
    pub backend_timeout_secs: u64,
}

/// WebSocket keep-alive settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// How often the server pings the client
    pub heartbeat_interval_secs: u64,
    /// Connection is dropped when nothing is heard for this long
    pub client_timeout_secs: u64,
}

/// Where the browser bundle (index.html, app.js) is served from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontendConfig {
    pub static_dir: String,
}

/// Text-to-speech voice settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    pub voice: String,
    pub speaking_rate: f32,
}

/// Provides default configuration values.
///
/// Default values ensure the application can start even if no configuration file exists.
/// They also serve as documentation of reasonable starting values.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
            },
            models: ModelsConfig {
                llm_model: "gemini-2.0-flash-exp".to_string(),    // Low latency, suited to voice
                api_base: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            },
            generation: GenerationConfig {
                temperature: 0.9,
                top_p: 0.95,
                top_k: 40,
                max_output_tokens: 2048,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 100,
                min_audio_bytes: 100,
                backend_timeout_secs: 30,
            },
            websocket: WebSocketConfig {
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
            frontend: FrontendConfig {
                static_dir: "static".to_string(),
            },
            speech: SpeechConfig {
                voice: "en-US-Neural2-F".to_string(),
                speaking_rate: 1.0,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST, PORT and GEMINI_MODEL environment variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `GEMINI_MODEL=gemini-1.5-flash`: Override the conversational model
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // APP_SERVER__HOST becomes server.host; single underscores stay inside field names
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(model) = env::var("GEMINI_MODEL") {
            settings = settings.set_override("models.llm_model", model)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching configuration errors early prevents runtime failures and
    /// provides clear error messages about what's wrong.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.models.llm_model.trim().is_empty() {
            return Err(anyhow::anyhow!("Model identifier cannot be empty"));
        }

        if !self.models.api_base.starts_with("http") {
            return Err(anyhow::anyhow!("Model API base must be an http(s) URL"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.backend_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Backend timeout must be greater than 0"));
        }

        if self.websocket.heartbeat_interval_secs == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }

        if self.websocket.client_timeout_secs <= self.websocket.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Client timeout ({}s) must exceed the heartbeat interval ({}s)",
                self.websocket.client_timeout_secs,
                self.websocket.heartbeat_interval_secs
            ));
        }

        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err(anyhow::anyhow!("Temperature must be between 0.0 and 2.0"));
        }

        Ok(())
    }

    /// Render the effective configuration as TOML (logged at startup).
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration as TOML")
    }
}

impl SpeechConfig {
    /// Speaking rate clamped to the range TTS engines accept.
    pub fn effective_rate(&self) -> f32 {
        self.speaking_rate.clamp(0.25, 4.0)
    }
}

/// The required secret for the AI backend.
///
/// `Debug` is implemented by hand so the key never ends up in a log line.
#[derive(Clone)]
pub struct BackendCredentials {
    api_key: String,
}

impl BackendCredentials {
    /// Read the API key from the environment.
    ///
    /// A missing or blank key is a startup-fatal error.
    pub fn from_env() -> Result<Self> {
        let api_key = env::var(API_KEY_ENV)
            .with_context(|| format!("{} must be set in environment variables", API_KEY_ENV))?;
        Self::new(api_key)
    }

    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(anyhow::anyhow!("{} is set but empty", API_KEY_ENV));
        }
        Ok(Self { api_key })
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl fmt::Debug for BackendCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendCredentials")
            .field("api_key", &"<redacted>")
            .finish()
    }
}
