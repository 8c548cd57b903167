//! # Text-to-Speech Service
//!
//! Optional speech synthesis for assistant replies. The engine itself is pluggable
//! through [`SpeechEngine`]; [`SpeechService`] owns its lifecycle and turns every failure
//! into "no audio" so callers only ever see bytes or absence.
//!
//! ## Lifecycle:
//! `main` builds the service, calls [`SpeechService::init`] before the server starts and
//! [`SpeechService::shutdown`] after it stops. Until `init` succeeds the service reports
//! itself unavailable.

use crate::config::SpeechConfig;

use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// A speech synthesis engine.
#[async_trait]
pub trait SpeechEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Acquire whatever the engine needs (clients, credentials, models).
    async fn start(&self) -> anyhow::Result<()>;

    /// Render `text` as encoded audio.
    async fn synthesize(&self, text: &str, voice: &str, speaking_rate: f32) -> anyhow::Result<Vec<u8>>;

    async fn stop(&self);
}

pub struct SpeechService {
    config: SpeechConfig,
    engine: Option<Arc<dyn SpeechEngine>>,
    active: RwLock<Option<Arc<dyn SpeechEngine>>>,
}

impl SpeechService {
    pub fn new(config: SpeechConfig, engine: Option<Arc<dyn SpeechEngine>>) -> Self {
        Self {
            config,
            engine,
            active: RwLock::new(None),
        }
    }

    /// Service with no engine configured; every request yields no audio.
    pub fn disabled(config: SpeechConfig) -> Self {
        Self::new(config, None)
    }

    /// Start the engine. A failed start leaves the service unavailable but is not fatal.
    pub async fn init(&self) -> bool {
        let Some(engine) = self.engine.clone() else {
            info!("No speech engine configured, TTS disabled");
            return false;
        };

        match engine.start().await {
            Ok(()) => {
                info!(engine = engine.name(), voice = %self.config.voice, "Speech engine initialized");
                *self.active.write().unwrap_or_else(PoisonError::into_inner) = Some(engine);
                true
            }
            Err(err) => {
                warn!(engine = engine.name(), error = %err, "Failed to initialize speech engine, TTS unavailable");
                false
            }
        }
    }

    pub async fn shutdown(&self) {
        let engine = self.active.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(engine) = engine {
            engine.stop().await;
            info!(engine = engine.name(), "Speech engine stopped");
        }
    }

    pub fn is_available(&self) -> bool {
        self.current().is_some()
    }

    pub fn voice(&self) -> &str {
        &self.config.voice
    }

    /// Synthesize `text`, or `None` when the text is blank, the engine is not running or
    /// synthesis fails.
    pub async fn synthesize(&self, text: &str) -> Option<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let engine = self.current()?;
        match engine
            .synthesize(text, &self.config.voice, self.config.effective_rate())
            .await
        {
            Ok(audio) => {
                debug!(bytes = audio.len(), "Synthesized speech");
                Some(audio)
            }
            Err(err) => {
                warn!(engine = engine.name(), error = %err, "Speech synthesis failed");
                None
            }
        }
    }

    fn current(&self) -> Option<Arc<dyn SpeechEngine>> {
        self.active.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::EchoEngine;
    use super::*;
    use std::sync::atomic::Ordering;

    fn speech_config() -> SpeechConfig {
        SpeechConfig {
            voice: "en-US-Neural2-F".to_string(),
            speaking_rate: 9.0,
        }
    }

    #[tokio::test]
    async fn test_unavailable_until_init() {
        let engine = Arc::new(EchoEngine::default());
        let service = SpeechService::new(speech_config(), Some(engine.clone()));

        assert!(!service.is_available());
        assert_eq!(service.synthesize("hello").await, None);

        assert!(service.init().await);
        assert_eq!(service.synthesize(" hello ").await, Some(b"hello".to_vec()));

        let requests = engine.requests.lock().unwrap().clone();
        assert_eq!(requests, vec![("hello".to_string(), "en-US-Neural2-F".to_string(), 4.0)]);
    }

    #[tokio::test]
    async fn test_disabled_service_yields_no_audio() {
        let service = SpeechService::disabled(speech_config());
        assert!(!service.init().await);
        assert!(!service.is_available());
        assert_eq!(service.synthesize("hello").await, None);
    }

    #[tokio::test]
    async fn test_failed_start_leaves_service_unavailable() {
        let engine = Arc::new(EchoEngine { fail_start: true, ..Default::default() });
        let service = SpeechService::new(speech_config(), Some(engine));

        assert!(!service.init().await);
        assert!(!service.is_available());
    }

    #[tokio::test]
    async fn test_synthesis_failure_and_blank_text_yield_none() {
        let engine = Arc::new(EchoEngine { fail_synthesis: true, ..Default::default() });
        let service = SpeechService::new(speech_config(), Some(engine));
        service.init().await;

        assert_eq!(service.synthesize("hello").await, None);
        assert_eq!(service.synthesize("   ").await, None);
    }

    #[tokio::test]
    async fn test_shutdown_stops_engine() {
        let engine = Arc::new(EchoEngine::default());
        let service = SpeechService::new(speech_config(), Some(engine.clone()));
        service.init().await;

        service.shutdown().await;

        assert!(engine.stopped.load(Ordering::SeqCst));
        assert!(!service.is_available());
        assert_eq!(service.synthesize("hello").await, None);
    }
}
