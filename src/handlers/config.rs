use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/config`
///
/// Returns the effective configuration. The API key is not part of `AppConfig`, so it
/// can never appear here.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = serde_json::to_value(state.config.as_ref())?;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::ScriptedBackend;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_config_is_exposed_without_secrets() {
        let state = web::Data::new(AppState::for_tests(ScriptedBackend::new()));
        let app = test::init_service(
            App::new()
                .app_data(state)
                .route("/api/v1/config", web::get().to(get_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/config").to_request();
        let json: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(json["config"]["models"]["llm_model"], "gemini-2.0-flash-exp");
        assert_eq!(json["config"]["server"]["port"], 8000);
        let sections: Vec<&str> = json["config"].as_object().unwrap().keys().map(String::as_str).collect();
        assert!(!sections.iter().any(|key| key.contains("key") || key.contains("credential")));
    }
}
