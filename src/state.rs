//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## What lives here:
//! - **config**: Loaded once at startup and never mutated, so a plain `Arc` suffices
//! - **registry / router**: The voice connection table and the message dispatcher
//! - **speech**: Optional TTS service
//! - **metrics**: Request counters updated by the metrics middleware
//!
//! ## Arc<RwLock<T>> Pattern
//! Only the metrics change after startup. They sit behind `Arc<RwLock<_>>`: many handlers
//! can read a snapshot at once while the middleware takes the write lock briefly per
//! request. A poisoned lock is recovered rather than propagated since counters stay
//! meaningful after a panic elsewhere.

use crate::audio::AudioProcessor;
use crate::backend::ConversationBackend;
use crate::config::AppConfig;
use crate::tts::SpeechService;
use crate::voice::{ConnectionRegistry, MessageRouter};

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,

    pub registry: Arc<ConnectionRegistry>,

    pub router: Arc<MessageRouter>,

    pub speech: Arc<SpeechService>,

    /// Performance metrics (constantly being updated by requests)
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected across all HTTP requests and WebSocket upgrades.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors encountered since server start
    pub error_count: u64,

    /// Voice connections accepted since server start
    pub connections_opened: u64,

    /// Voice connections refused (duplicate id or capacity)
    pub connections_rejected: u64,

    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for a specific endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Build the shared state, wiring the registry and router from `config`.
    ///
    /// The backend is injected so tests can substitute a scripted one.
    pub fn new(
        config: AppConfig,
        backend: Arc<dyn ConversationBackend>,
        speech: Arc<SpeechService>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.performance.max_concurrent_sessions));
        let router = Arc::new(MessageRouter::new(
            registry.clone(),
            backend,
            AudioProcessor::new(config.performance.min_audio_bytes),
        ));

        Self {
            config: Arc::new(config),
            registry,
            router,
            speech,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    pub fn model_name(&self) -> &str {
        self.router.backend().model_name()
    }

    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    pub fn record_connection(&self, accepted: bool) {
        let mut metrics = self.metrics_mut();
        if accepted {
            metrics.connections_opened += 1;
        } else {
            metrics.connections_rejected += 1;
        }
    }

    /// Record timing for one request to `endpoint`.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();

        // First request to an endpoint creates its entry
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Consistent copy of the metrics, so no lock is held while a response is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AppMetrics {
    /// Share of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
impl AppState {
    /// Default config, a scripted backend and TTS disabled.
    pub fn for_tests(backend: crate::backend::testing::ScriptedBackend) -> Self {
        let config = AppConfig::default();
        let speech = Arc::new(SpeechService::disabled(config.speech.clone()));
        Self::new(config, Arc::new(backend), speech)
    }
}
