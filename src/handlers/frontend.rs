//! Serves the browser client from the configured static directory.
//!
//! Files are read on every request so the client can be edited without a restart.

use crate::state::AppState;
use actix_web::{http::header::ContentType, web, HttpResponse};
use std::path::Path;
use tracing::warn;

const INDEX_NOT_FOUND: &str = "<h1>Frontend not found. Please ensure static/index.html exists.</h1>";
const SCRIPT_NOT_FOUND: &str = "console.error('app.js not found');";

/// `GET /app`
pub async fn serve_frontend(state: web::Data<AppState>) -> HttpResponse {
    let path = Path::new(&state.config.frontend.static_dir).join("index.html");

    match tokio::fs::read_to_string(&path).await {
        Ok(html) => HttpResponse::Ok().content_type(ContentType::html()).body(html),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Frontend index not found");
            HttpResponse::NotFound()
                .content_type(ContentType::html())
                .body(INDEX_NOT_FOUND)
        }
    }
}

/// `GET /app.js`
pub async fn serve_script(state: web::Data<AppState>) -> HttpResponse {
    let path = Path::new(&state.config.frontend.static_dir).join("app.js");

    match tokio::fs::read_to_string(&path).await {
        Ok(script) => HttpResponse::Ok()
            .content_type("application/javascript")
            .body(script),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Frontend script not found");
            HttpResponse::NotFound()
                .content_type("application/javascript")
                .body(SCRIPT_NOT_FOUND)
        }
    }
}
