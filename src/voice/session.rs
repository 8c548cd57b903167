//! # Conversation Session
//!
//! Per-client conversational state: how many text turns have been processed, which
//! persona the user asked for, and the history replayed to the model on every turn.
//!
//! ## Persona bootstrap:
//! 1. **Uninitialized** (no turns yet): reply with the onboarding prompt
//! 2. **AwaitingPersona** (one turn, no persona): the next turn's text becomes the persona
//! 3. **Active** (persona set): turns are forwarded to the model
//!
//! The model is never contacted before step 3.

use crate::backend::{ConversationBackend, GenerationRequest, Turn};
use crate::voice::persona;

use tracing::{error, info};

/// Where a session is in the persona bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersonaState {
    Uninitialized,
    AwaitingPersona,
    Active,
}

impl PersonaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PersonaState::Uninitialized => "uninitialized",
            PersonaState::AwaitingPersona => "awaiting_persona",
            PersonaState::Active => "active",
        }
    }
}

/// Result of processing one text turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Fixed line produced without the model (onboarding, acknowledgment, role-first).
    Scripted(String),
    /// Reply generated by the model.
    Reply(String),
    /// The model call failed; the text is the fixed apology.
    Fallback(String),
}

impl TurnOutcome {
    pub fn text(&self) -> &str {
        match self {
            TurnOutcome::Scripted(text) | TurnOutcome::Reply(text) | TurnOutcome::Fallback(text) => text,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, TurnOutcome::Fallback(_))
    }
}

/// One client's interaction state with the model.
#[derive(Debug)]
pub struct ConversationSession {
    client_id: String,
    message_count: u64,
    persona: Option<String>,
    persona_configured: bool,
    system_directive: Option<String>,
    history: Vec<Turn>,
}

impl ConversationSession {
    pub fn new(client_id: impl Into<String>) -> Self {
        let client_id = client_id.into();
        info!(client_id = %client_id, "Started new conversation session - waiting for persona setup");

        Self {
            client_id,
            message_count: 0,
            persona: None,
            persona_configured: false,
            system_directive: None,
            history: Vec::new(),
        }
    }

    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    pub fn persona(&self) -> Option<&str> {
        self.persona.as_deref()
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    pub fn state(&self) -> PersonaState {
        if self.persona_configured {
            PersonaState::Active
        } else if self.message_count == 0 {
            PersonaState::Uninitialized
        } else {
            PersonaState::AwaitingPersona
        }
    }

    /// Process one user text turn.
    ///
    /// Once a persona is set the turn goes to the model with the prior history as
    /// context. The user turn and the reply are recorded together, and only when the
    /// model answers. Failures never escape: they are logged and turned into
    /// [`TurnOutcome::Fallback`] with the history left exactly as it was before the turn.
    pub async fn process_text(&mut self, text: &str, backend: &dyn ConversationBackend) -> TurnOutcome {
        self.message_count += 1;

        if !self.persona_configured {
            return match self.message_count {
                1 => TurnOutcome::Scripted(persona::ONBOARDING_PROMPT.to_string()),
                2 => {
                    self.set_persona(text);
                    TurnOutcome::Scripted(persona::persona_acknowledgment(text))
                }
                _ => TurnOutcome::Scripted(persona::ROLE_REQUIRED_MESSAGE.to_string()),
            };
        }

        let directive = match self.system_directive.as_deref() {
            Some(directive) => directive,
            None => return TurnOutcome::Scripted(persona::ROLE_REQUIRED_MESSAGE.to_string()),
        };

        let request = GenerationRequest {
            system_directive: directive,
            context: &self.history,
            user_turn: text,
        };

        match backend.generate(request).await {
            Ok(reply) => {
                self.history.push(Turn::user(text));
                self.history.push(Turn::assistant(reply.clone()));
                info!(
                    client_id = %self.client_id,
                    "Generated response: {}",
                    preview(&reply, 100)
                );
                TurnOutcome::Reply(reply)
            }
            Err(err) => {
                error!(client_id = %self.client_id, error = %err, "Error processing text");
                TurnOutcome::Fallback(persona::APOLOGY_MESSAGE.to_string())
            }
        }
    }

    /// Discard history and persona and start the bootstrap over.
    pub fn reset(&mut self) {
        self.message_count = 0;
        self.persona = None;
        self.persona_configured = false;
        self.system_directive = None;
        self.history.clear();
        info!(client_id = %self.client_id, "Cleared conversation history");
    }

    fn set_persona(&mut self, description: &str) {
        // Persona is fixed for the rest of the session
        if self.persona_configured {
            return;
        }
        self.persona = Some(description.to_string());
        self.system_directive = Some(persona::system_directive(description));
        self.persona_configured = true;
        info!(client_id = %self.client_id, "Persona set to: {}", description);
    }
}

/// First `max_chars` characters of `text`, for log lines.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
