//! # Conversational Backend
//!
//! The seam between a conversation session and the cloud model that writes the replies.
//! Sessions only ever see the [`ConversationBackend`] trait; `main` decides which
//! implementation to inject (Gemini in production, scripted fakes in tests).

pub mod gemini;

pub use gemini::GeminiBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Who said a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of the conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Everything the backend needs to produce one reply.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    /// Fixed system context derived from the session persona
    pub system_directive: &'a str,
    /// Prior turns, oldest first, not including `user_turn`
    pub context: &'a [Turn],
    /// The new user message
    pub user_turn: &'a str,
}

/// Reasons a generation request can fail.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request to model API failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("model API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("model returned no text")]
    EmptyResponse,

    #[error("model request timed out after {0}s")]
    Timeout(u64),

    #[error("{0}")]
    Other(String),
}

/// Produces assistant replies for a configured persona.
#[async_trait]
pub trait ConversationBackend: Send + Sync {
    /// Model identifier, for logs and the health endpoint.
    fn model_name(&self) -> &str;

    async fn generate(&self, request: GenerationRequest<'_>) -> Result<String, BackendError>;
}
