use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct SpeechRequest {
    pub text: String,
}

/// `POST /api/v1/speech`
///
/// Synthesizes `text` with the configured voice. Answers 503 when no speech engine is
/// running or synthesis produced nothing.
pub async fn synthesize_speech(
    state: web::Data<AppState>,
    body: web::Json<SpeechRequest>,
) -> Result<HttpResponse, AppError> {
    if body.text.trim().is_empty() {
        return Err(AppError::ValidationError("text must not be empty".to_string()));
    }

    if !state.speech.is_available() {
        return Err(AppError::ServiceUnavailable("Text-to-speech is not available".to_string()));
    }

    match state.speech.synthesize(&body.text).await {
        Some(audio) => Ok(HttpResponse::Ok().content_type("audio/wav").body(audio)),
        None => Err(AppError::ServiceUnavailable("Speech synthesis failed".to_string())),
    }
}
