//! # Message Router
//!
//! Runs the per-connection message loop and dispatches each inbound message to its
//! handler.
//!
//! ## Ordering:
//! Each connection gets exactly one [`MessageRouter::run`] task reading from its inbound
//! channel, so a client's messages are handled one at a time in arrival order. A slow
//! model call only delays the connection that made it.
//!
//! ## Fault isolation:
//! Whatever goes wrong while handling one message (a decode error, a missing session, even
//! a panic) is logged and reported to that client as an `error` message. The loop keeps
//! going and no other connection notices.

use crate::audio::processor::{is_supported_format, DEFAULT_AUDIO_FORMAT};
use crate::audio::{AudioOutcome, AudioProcessor};
use crate::backend::ConversationBackend;
use crate::error::AppResult;
use crate::voice::messages::{ClientMessage, ServerMessage};
use crate::voice::registry::ConnectionRegistry;
use crate::voice::session::{preview, TurnOutcome};

use futures_util::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle of one connection's message loop. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered, nothing processed yet
    Connected,
    /// At least one message processed
    Active,
    /// Loop finished; nothing more is processed
    Closed,
}

impl ConnectionState {
    fn on_message(self) -> Self {
        match self {
            ConnectionState::Connected | ConnectionState::Active => ConnectionState::Active,
            ConnectionState::Closed => ConnectionState::Closed,
        }
    }
}

/// Whether the loop should keep reading after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    EndCall,
}

pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    backend: Arc<dyn ConversationBackend>,
    audio: AudioProcessor,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        backend: Arc<dyn ConversationBackend>,
        audio: AudioProcessor,
    ) -> Self {
        Self { registry, backend, audio }
    }

    pub fn backend(&self) -> &Arc<dyn ConversationBackend> {
        &self.backend
    }

    /// Process inbound frames for one connection until `end_call` or the socket closes,
    /// then release the connection's registry entry.
    pub async fn run(
        &self,
        client_id: String,
        connection_id: Uuid,
        mut inbound: mpsc::UnboundedReceiver<String>,
    ) -> ConnectionState {
        let mut state = ConnectionState::Connected;
        info!(client_id = %client_id, "Voice session initialized");

        while let Some(raw) = inbound.recv().await {
            if state == ConnectionState::Connected {
                debug!(client_id = %client_id, "Connection active");
            }
            state = state.on_message();

            if self.handle_isolated(&client_id, &raw).await == Flow::EndCall {
                info!(client_id = %client_id, "Call ended by client");
                break;
            }
        }

        state = ConnectionState::Closed;
        self.registry.release(&client_id, connection_id);
        state
    }

    /// Handle one frame; every failure is converted into an `error` reply.
    pub async fn handle_isolated(&self, client_id: &str, raw: &str) -> Flow {
        let result = AssertUnwindSafe(self.handle_frame(client_id, raw))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(flow)) => flow,
            Ok(Err(err)) => {
                error!(client_id = %client_id, error = %err, "Error handling message");
                self.registry.send(client_id, ServerMessage::error(err.to_string()));
                Flow::Continue
            }
            Err(panic) => {
                error!(
                    client_id = %client_id,
                    panic = %panic_message(panic.as_ref()),
                    "Message handler panicked"
                );
                self.registry
                    .send(client_id, ServerMessage::error("Internal error while processing message"));
                Flow::Continue
            }
        }
    }

    /// Parse one JSON frame and dispatch it.
    pub async fn handle_frame(&self, client_id: &str, raw: &str) -> AppResult<Flow> {
        let message: ClientMessage = serde_json::from_str(raw)?;
        self.dispatch(client_id, message).await
    }

    pub async fn dispatch(&self, client_id: &str, message: ClientMessage) -> AppResult<Flow> {
        debug!(client_id = %client_id, kind = message.kind(), "Dispatching message");

        match message {
            ClientMessage::AudioChunk { audio } => {
                self.handle_audio_chunk(client_id, audio.as_deref())?;
            }
            ClientMessage::AudioComplete { audio, format } => {
                self.handle_audio_complete(client_id, audio.as_deref(), format.as_deref())?;
            }
            ClientMessage::Audio { audio, format } => {
                self.handle_legacy_audio(client_id, audio.as_deref(), format.as_deref())?;
            }
            ClientMessage::Text { text, timestamp } => {
                self.handle_text(client_id, &text, timestamp).await?;
            }
            ClientMessage::Ping { timestamp } => {
                self.registry.send(client_id, ServerMessage::Pong { timestamp });
            }
            ClientMessage::EndCall => return Ok(Flow::EndCall),
            ClientMessage::Unknown => {
                debug!(client_id = %client_id, "Ignoring unrecognized message type");
            }
        }

        Ok(Flow::Continue)
    }

    /// Decode a streamed fragment and buffer it.
    pub fn handle_audio_chunk(&self, client_id: &str, audio: Option<&str>) -> AppResult<()> {
        let Some(bytes) = self.audio.decode_payload(audio)? else {
            return Ok(());
        };

        let len = bytes.len();
        if self.registry.append_audio(client_id, bytes) {
            debug!(client_id = %client_id, bytes = len, "Buffered audio chunk");
        } else {
            error!(client_id = %client_id, "No audio buffer found for client");
        }
        Ok(())
    }

    /// Flush the recording (plus an optional final fragment) and apply the size policy.
    ///
    /// Returns `None` when the client has no registry entry. Accepted audio is not
    /// transcribed here: the browser sends its own transcription as a `text` message.
    ///
    /// The buffer is emptied before the final fragment is decoded, so a bad fragment
    /// drops the whole recording instead of leaking it into the next one.
    pub fn handle_audio_complete(
        &self,
        client_id: &str,
        audio: Option<&str>,
        format: Option<&str>,
    ) -> AppResult<Option<AudioOutcome>> {
        let Some(mut blob) = self.registry.flush_audio(client_id) else {
            error!(client_id = %client_id, "No audio buffer found for client");
            return Ok(None);
        };

        if let Some(final_fragment) = self.audio.decode_payload(audio)? {
            blob.extend_from_slice(&final_fragment);
        }

        let outcome = self.audio.classify(blob, format);
        match &outcome {
            AudioOutcome::Discarded { .. } => {
                warn!(
                    client_id = %client_id,
                    bytes = outcome.byte_len(),
                    min_bytes = self.audio.min_audio_bytes(),
                    "No sufficient audio data"
                );
            }
            AudioOutcome::Accepted { format, .. } => {
                if !is_supported_format(format) {
                    warn!(client_id = %client_id, format = %format, "Unrecognized audio format");
                }
                info!(
                    client_id = %client_id,
                    bytes = outcome.byte_len(),
                    format = %format,
                    "Received complete audio"
                );
            }
        }

        Ok(Some(outcome))
    }

    /// Single-message recording from older clients. Logged only.
    fn handle_legacy_audio(&self, client_id: &str, audio: Option<&str>, format: Option<&str>) -> AppResult<()> {
        match self.audio.decode_payload(audio)? {
            Some(bytes) => info!(
                client_id = %client_id,
                bytes = bytes.len(),
                format = format.unwrap_or(DEFAULT_AUDIO_FORMAT),
                "Received audio"
            ),
            None => warn!(client_id = %client_id, "No audio data received"),
        }
        Ok(())
    }

    /// Run a text turn through the session and reply with `processing` then `response`.
    pub async fn handle_text(
        &self,
        client_id: &str,
        text: &str,
        timestamp: Option<Value>,
    ) -> AppResult<Option<TurnOutcome>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        info!(client_id = %client_id, "Received text: {}", preview(text, 200));

        let Some(session) = self.registry.get_session(client_id) else {
            error!(client_id = %client_id, "No conversation session found for client");
            return Ok(None);
        };

        self.registry.send(client_id, ServerMessage::processing());

        let outcome = {
            let mut session = session.lock().await;
            session.process_text(text, self.backend.as_ref()).await
        };

        let response = ServerMessage::Response {
            text: outcome.text().to_string(),
            timestamp,
        };
        if !self.registry.send(client_id, response) {
            debug!(client_id = %client_id, "Client left before the response was ready");
        } else if outcome.is_fallback() {
            warn!(client_id = %client_id, "Sent fallback response");
        } else {
            info!(client_id = %client_id, "Sent response: {}", preview(outcome.text(), 100));
        }

        Ok(Some(outcome))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::ScriptedBackend;
    use crate::backend::{BackendError, GenerationRequest};
    use crate::voice::persona;
    use crate::voice::registry::ConnectionHandle;

    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde_json::json;

    struct Harness {
        router: Arc<MessageRouter>,
        backend: Arc<ScriptedBackend>,
        outbound: mpsc::UnboundedReceiver<ServerMessage>,
        connection_id: Uuid,
    }

    fn harness(backend: ScriptedBackend) -> Harness {
        let registry = Arc::new(ConnectionRegistry::new(10));
        let (handle, outbound) = ConnectionHandle::channel();
        let connection_id = handle.id();
        registry.connect("client-1", handle).unwrap();

        let backend = Arc::new(backend);
        let router = Arc::new(MessageRouter::new(registry, backend.clone(), AudioProcessor::new(100)));
        Harness { router, backend, outbound, connection_id }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn chunk(bytes: &[u8]) -> String {
        json!({"type": "audio_chunk", "audio": STANDARD.encode(bytes)}).to_string()
    }

    #[tokio::test]
    async fn test_ping_echoes_timestamp() {
        let mut h = harness(ScriptedBackend::new());

        let flow = h.router.handle_isolated("client-1", r#"{"type":"ping","timestamp":42}"#).await;

        assert_eq!(flow, Flow::Continue);
        assert_eq!(drain(&mut h.outbound), vec![ServerMessage::Pong { timestamp: Some(json!(42)) }]);
    }

    #[tokio::test]
    async fn test_chunks_then_complete_flush_in_order() {
        let mut h = harness(ScriptedBackend::new());
        let parts: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 30]).collect();

        for part in &parts {
            h.router.handle_isolated("client-1", &chunk(part)).await;
        }
        let outcome = h.router.handle_audio_complete("client-1", None, None).unwrap();

        assert_eq!(
            outcome,
            Some(AudioOutcome::Accepted { audio: parts.concat(), format: "webm".to_string() })
        );
        assert_eq!(h.router.registry.flush_audio("client-1"), Some(vec![]));
        assert!(drain(&mut h.outbound).is_empty());
    }

    #[tokio::test]
    async fn test_complete_without_chunks_is_discarded() {
        let mut h = harness(ScriptedBackend::new());

        let outcome = h.router.handle_audio_complete("client-1", None, None).unwrap();

        assert_eq!(outcome, Some(AudioOutcome::Discarded { bytes: 0 }));
        assert!(drain(&mut h.outbound).is_empty());
    }

    #[tokio::test]
    async fn test_small_combined_blob_triggers_nothing() {
        let mut h = harness(ScriptedBackend::new());
        h.router.handle_isolated("client-1", &chunk(&[1u8; 40])).await;

        let final_fragment = STANDARD.encode([2u8; 59]);
        let outcome = h
            .router
            .handle_audio_complete("client-1", Some(&final_fragment), Some("webm"))
            .unwrap();

        assert_eq!(outcome, Some(AudioOutcome::Discarded { bytes: 99 }));
        assert!(drain(&mut h.outbound).is_empty());
        assert_eq!(h.backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_final_fragment_appended_after_buffered_chunks() {
        let h = harness(ScriptedBackend::new());
        h.router.handle_isolated("client-1", &chunk(&[1u8; 60])).await;

        let final_fragment = STANDARD.encode([2u8; 60]);
        let outcome = h
            .router
            .handle_audio_complete("client-1", Some(&final_fragment), Some("ogg"))
            .unwrap()
            .unwrap();

        let mut expected = vec![1u8; 60];
        expected.extend_from_slice(&[2u8; 60]);
        assert_eq!(outcome, AudioOutcome::Accepted { audio: expected, format: "ogg".to_string() });
    }

    #[tokio::test]
    async fn test_text_turns_follow_persona_protocol() {
        let mut h = harness(ScriptedBackend::new().reply("Your flight boards at 9."));

        h.router.handle_isolated("client-1", r#"{"type":"text","text":"hello","timestamp":1}"#).await;
        h.router.handle_isolated("client-1", r#"{"type":"text","text":" airline agent ","timestamp":2}"#).await;
        h.router.handle_isolated("client-1", r#"{"type":"text","text":"When do I board?","timestamp":3}"#).await;

        let messages = drain(&mut h.outbound);
        assert_eq!(
            messages,
            vec![
                ServerMessage::processing(),
                ServerMessage::Response {
                    text: persona::ONBOARDING_PROMPT.to_string(),
                    timestamp: Some(json!(1)),
                },
                ServerMessage::processing(),
                ServerMessage::Response {
                    text: persona::persona_acknowledgment("airline agent"),
                    timestamp: Some(json!(2)),
                },
                ServerMessage::processing(),
                ServerMessage::Response {
                    text: "Your flight boards at 9.".to_string(),
                    timestamp: Some(json!(3)),
                },
            ]
        );

        let calls = h.backend.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, persona::system_directive("airline agent"));
    }

    #[tokio::test]
    async fn test_empty_text_is_ignored() {
        let mut h = harness(ScriptedBackend::new());

        let outcome = h.router.handle_text("client-1", "   ", None).await.unwrap();

        assert!(outcome.is_none());
        assert!(drain(&mut h.outbound).is_empty());
        let session = h.router.registry.get_session("client-1").unwrap();
        assert_eq!(session.lock().await.message_count(), 0);
    }

    #[tokio::test]
    async fn test_backend_failure_sends_apology() {
        let mut h = harness(ScriptedBackend::new().fail("boom"));
        h.router.handle_text("client-1", "hi", None).await.unwrap();
        h.router.handle_text("client-1", "dentist", None).await.unwrap();
        drain(&mut h.outbound);

        let outcome = h.router.handle_text("client-1", "Do I need a cleaning?", None).await.unwrap();

        assert_eq!(outcome, Some(TurnOutcome::Fallback(persona::APOLOGY_MESSAGE.to_string())));
        assert_eq!(
            drain(&mut h.outbound).last(),
            Some(&ServerMessage::Response { text: persona::APOLOGY_MESSAGE.to_string(), timestamp: None })
        );
        let session = h.router.registry.get_session("client-1").unwrap();
        assert!(session.lock().await.history().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_frames_reply_with_error_and_continue() {
        let mut h = harness(ScriptedBackend::new());

        assert_eq!(h.router.handle_isolated("client-1", "not json").await, Flow::Continue);
        assert_eq!(
            h.router
                .handle_isolated("client-1", r#"{"type":"audio_chunk","audio":"%%%"}"#)
                .await,
            Flow::Continue
        );
        h.router.handle_isolated("client-1", r#"{"type":"ping","timestamp":"t-1"}"#).await;

        let messages = drain(&mut h.outbound);
        assert_eq!(messages.len(), 3);
        assert!(matches!(&messages[0], ServerMessage::Error { message } if message.contains("JSON")));
        assert!(matches!(&messages[1], ServerMessage::Error { message } if message.contains("base64")));
        assert_eq!(messages[2], ServerMessage::Pong { timestamp: Some(json!("t-1")) });
    }

    #[tokio::test]
    async fn test_unknown_type_ignored() {
        let mut h = harness(ScriptedBackend::new());
        assert_eq!(h.router.handle_isolated("client-1", r#"{"type":"wave"}"#).await, Flow::Continue);
        assert!(drain(&mut h.outbound).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_client_is_skipped() {
        let h = harness(ScriptedBackend::new());

        assert_eq!(h.router.handle_text("stranger", "hello", None).await.unwrap(), None);
        assert_eq!(h.router.handle_audio_complete("stranger", None, None).unwrap(), None);
        assert!(h.router.handle_audio_chunk("stranger", Some(&STANDARD.encode([1u8]))).is_ok());
    }

    #[tokio::test]
    async fn test_run_stops_at_end_call_and_releases_client() {
        let mut h = harness(ScriptedBackend::new());
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(r#"{"type":"ping","timestamp":1}"#.to_string()).unwrap();
        tx.send(r#"{"type":"end_call"}"#.to_string()).unwrap();
        tx.send(r#"{"type":"ping","timestamp":2}"#.to_string()).unwrap();

        let state = h.router.run("client-1".to_string(), h.connection_id, rx).await;

        assert_eq!(state, ConnectionState::Closed);
        assert!(!h.router.registry.contains("client-1"));
        assert_eq!(drain(&mut h.outbound), vec![ServerMessage::Pong { timestamp: Some(json!(1)) }]);
    }

    #[tokio::test]
    async fn test_run_tears_down_when_socket_closes() {
        let h = harness(ScriptedBackend::new());
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        drop(tx);

        let state = h.router.run("client-1".to_string(), h.connection_id, rx).await;

        assert_eq!(state, ConnectionState::Closed);
        assert_eq!(h.router.registry.active_count(), 0);
    }

    struct PanickingBackend;

    #[async_trait]
    impl ConversationBackend for PanickingBackend {
        fn model_name(&self) -> &str {
            "panicking"
        }

        async fn generate(&self, _request: GenerationRequest<'_>) -> Result<String, BackendError> {
            panic!("backend exploded");
        }
    }

    #[tokio::test]
    async fn test_panic_is_contained_to_one_message() {
        let registry = Arc::new(ConnectionRegistry::new(10));
        let (handle, mut outbound) = ConnectionHandle::channel();
        registry.connect("client-1", handle).unwrap();
        let router = MessageRouter::new(registry, Arc::new(PanickingBackend), AudioProcessor::new(100));

        router.handle_text("client-1", "hi", None).await.unwrap();
        router.handle_text("client-1", "chef", None).await.unwrap();
        drain(&mut outbound);

        let flow = router
            .handle_isolated("client-1", r#"{"type":"text","text":"what's for dinner?"}"#)
            .await;
        router.handle_isolated("client-1", r#"{"type":"ping","timestamp":5}"#).await;

        assert_eq!(flow, Flow::Continue);
        let messages = drain(&mut outbound);
        assert_eq!(messages[0], ServerMessage::processing());
        assert!(matches!(&messages[1], ServerMessage::Error { .. }));
        assert_eq!(messages[2], ServerMessage::Pong { timestamp: Some(json!(5)) });
        assert!(router.registry.contains("client-1"));
    }

    #[tokio::test]
    async fn test_audio_complete_frame_closes_recording() {
        let mut h = harness(ScriptedBackend::new());
        for part in [[1u8; 50], [2u8; 50]] {
            h.router.handle_isolated("client-1", &chunk(&part)).await;
        }
        assert_eq!(h.router.registry.summaries()[0].buffered_bytes, 100);

        let complete = json!({
            "type": "audio_complete",
            "audio": STANDARD.encode([3u8; 20]),
            "format": "ogg"
        })
        .to_string();
        let flow = h.router.handle_isolated("client-1", &complete).await;

        assert_eq!(flow, Flow::Continue);
        assert!(drain(&mut h.outbound).is_empty());
        let summary = &h.router.registry.summaries()[0];
        assert_eq!(summary.buffered_chunks, 0);
        assert_eq!(summary.buffered_bytes, 0);
        assert_eq!(h.backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_bad_final_fragment_drops_the_recording() {
        let mut h = harness(ScriptedBackend::new());
        h.router.handle_isolated("client-1", &chunk(&[1u8; 80])).await;

        let flow = h
            .router
            .handle_isolated("client-1", r#"{"type":"audio_complete","audio":"%%%"}"#)
            .await;

        assert_eq!(flow, Flow::Continue);
        let messages = drain(&mut h.outbound);
        assert_eq!(messages.len(), 1);
        assert!(matches!(&messages[0], ServerMessage::Error { message } if message.contains("base64")));

        // The next recording starts from an empty buffer
        h.router.handle_isolated("client-1", &chunk(&[2u8; 80])).await;
        let outcome = h.router.handle_audio_complete("client-1", None, None).unwrap();
        assert_eq!(outcome, Some(AudioOutcome::Discarded { bytes: 80 }));
    }

    /// Holds every `generate` call until the test lets it finish.
    #[derive(Default)]
    struct GatedBackend {
        entered: tokio::sync::Notify,
        proceed: tokio::sync::Notify,
    }

    #[async_trait]
    impl ConversationBackend for GatedBackend {
        fn model_name(&self) -> &str {
            "gated"
        }

        async fn generate(&self, _request: GenerationRequest<'_>) -> Result<String, BackendError> {
            self.entered.notify_one();
            self.proceed.notified().await;
            Ok("Too late.".to_string())
        }
    }

    #[tokio::test]
    async fn test_reply_after_disconnect_is_dropped() {
        let registry = Arc::new(ConnectionRegistry::new(10));
        let (handle, mut outbound) = ConnectionHandle::channel();
        let connection_id = handle.id();
        registry.connect("client-1", handle).unwrap();
        let backend = Arc::new(GatedBackend::default());
        let router = Arc::new(MessageRouter::new(registry.clone(), backend.clone(), AudioProcessor::new(100)));

        router.handle_text("client-1", "hi", None).await.unwrap();
        router.handle_text("client-1", "tour guide", None).await.unwrap();
        drain(&mut outbound);

        let (tx, rx) = mpsc::unbounded_channel();
        let task = {
            let router = router.clone();
            tokio::spawn(async move { router.run("client-1".to_string(), connection_id, rx).await })
        };
        tx.send(r#"{"type":"text","text":"Where is the museum?"}"#.to_string()).unwrap();

        // Socket goes away while the model call is in flight
        backend.entered.notified().await;
        assert!(registry.release("client-1", connection_id));
        drop(tx);
        backend.proceed.notify_one();

        let state = task.await.unwrap();

        assert_eq!(state, ConnectionState::Closed);
        assert!(!registry.contains("client-1"));
        assert_eq!(registry.active_count(), 0);
        assert_eq!(drain(&mut outbound), vec![ServerMessage::processing()]);
    }

    #[test]
    fn test_state_only_moves_forward() {
        assert_eq!(ConnectionState::Connected.on_message(), ConnectionState::Active);
        assert_eq!(ConnectionState::Active.on_message(), ConnectionState::Active);
        assert_eq!(ConnectionState::Closed.on_message(), ConnectionState::Closed);
    }
}
