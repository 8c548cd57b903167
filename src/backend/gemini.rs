//! Gemini `generateContent` client.
//!
//! Each call is stateless on the API side: the persona directive goes in
//! `systemInstruction` and the session history is replayed in `contents`.

use super::{BackendError, ConversationBackend, GenerationRequest, Role, Turn};
use crate::config::{AppConfig, BackendCredentials, GenerationConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub struct GeminiBackend {
    client: reqwest::Client,
    credentials: BackendCredentials,
    api_base: String,
    model: String,
    generation: GenerationConfig,
    timeout_secs: u64,
}

impl GeminiBackend {
    pub fn new(config: &AppConfig, credentials: BackendCredentials) -> Result<Self, BackendError> {
        let timeout_secs = config.performance.backend_timeout_secs;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            client,
            credentials,
            api_base: config.models.api_base.trim_end_matches('/').to_string(),
            model: config.models.llm_model.clone(),
            generation: config.generation.clone(),
            timeout_secs,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.api_base, self.model)
    }

    fn build_body(&self, request: &GenerationRequest<'_>) -> GenerateContentRequest {
        let mut contents: Vec<Content> = request.context.iter().map(Content::from_turn).collect();
        contents.push(Content::text("user", request.user_turn));

        GenerateContentRequest {
            system_instruction: Content {
                role: None,
                parts: vec![Part { text: request.system_directive.to_string() }],
            },
            contents,
            generation_config: GenerationSettings {
                temperature: self.generation.temperature,
                top_p: self.generation.top_p,
                top_k: self.generation.top_k,
                max_output_tokens: self.generation.max_output_tokens,
            },
        }
    }
}

#[async_trait]
impl ConversationBackend for GeminiBackend {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: GenerationRequest<'_>) -> Result<String, BackendError> {
        let body = self.build_body(&request);
        debug!(model = %self.model, turns = body.contents.len(), "Sending generateContent request");

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", self.credentials.api_key())
            .json(&body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status { status: status.as_u16(), body });
        }

        let parsed: GenerateContentResponse = response.json().await.map_err(|e| self.classify(e))?;
        parsed.into_text()
    }
}

impl GeminiBackend {
    fn classify(&self, err: reqwest::Error) -> BackendError {
        if err.is_timeout() {
            BackendError::Timeout(self.timeout_secs)
        } else {
            BackendError::Transport(err)
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    system_instruction: Content,
    contents: Vec<Content>,
    generation_config: GenerationSettings,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationSettings {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    max_output_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

impl Content {
    fn text(role: &str, text: &str) -> Self {
        Self {
            role: Some(role.to_string()),
            parts: vec![Part { text: text.to_string() }],
        }
    }

    fn from_turn(turn: &Turn) -> Self {
        let role = match turn.role {
            Role::User => "user",
            Role::Assistant => "model",
        };
        Self::text(role, &turn.content)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

impl GenerateContentResponse {
    fn into_text(self) -> Result<String, BackendError> {
        let text: String = self
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| content.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();

        let text = text.trim();
        if text.is_empty() {
            return Err(BackendError::EmptyResponse);
        }
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> GeminiBackend {
        let config = AppConfig::default();
        GeminiBackend::new(&config, BackendCredentials::new("test-key").unwrap()).unwrap()
    }

    #[test]
    fn test_endpoint_uses_configured_model() {
        assert_eq!(
            backend().endpoint(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash-exp:generateContent"
        );
    }

    #[test]
    fn test_body_replays_history_with_model_role() {
        let backend = backend();
        let context = vec![Turn::user("hello"), Turn::assistant("hi there")];
        let request = GenerationRequest {
            system_directive: "You are a pilot.",
            context: &context,
            user_turn: "when do we land?",
        };

        let json = serde_json::to_value(backend.build_body(&request)).unwrap();
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "You are a pilot.");
        assert!(json["systemInstruction"].get("role").is_none());
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][1]["role"], "model");
        assert_eq!(json["contents"][2]["parts"][0]["text"], "when do we land?");
        assert_eq!(json["generationConfig"]["topK"], 40);
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 2048);
    }

    #[test]
    fn test_response_text_extraction() {
        let raw = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Sure, "},{"text":"gate 12."}]}}]}"#;
        let parsed: GenerateContentResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.into_text().unwrap(), "Sure, gate 12.");
    }

    #[test]
    fn test_empty_candidates_is_an_error() {
        let parsed: GenerateContentResponse = serde_json::from_str(r#"{"candidates":[]}"#).unwrap();
        assert!(matches!(parsed.into_text(), Err(BackendError::EmptyResponse)));

        let parsed: GenerateContentResponse =
            serde_json::from_str(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#).unwrap();
        assert!(matches!(parsed.into_text(), Err(BackendError::EmptyResponse)));
    }
}
