//! Service status endpoints: the root banner, the health check and detailed metrics.

use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /`
pub async fn root() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "online",
        "service": "AI Voice Calling Assistant"
    }))
}

/// `GET /health`
///
/// `status`, `model` and `active_connections` are what load balancers and the browser
/// client look at; the rest is operational detail.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let active_connections = state.registry.active_count();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "model": state.model_name(),
        "active_connections": active_connections,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": state.config.server.host,
            "port": state.config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "connections_opened": metrics.connections_opened,
            "connections_rejected": metrics.connections_rejected
        },
        "speech": {
            "available": state.speech.is_available(),
            "voice": state.speech.voice()
        },
        "memory": get_memory_info(),
        "system": get_system_status(active_connections, state.registry.max_clients())
    }))
}

/// `GET /api/v1/metrics`
pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    let connections: Vec<_> = state
        .registry
        .summaries()
        .into_iter()
        .map(|summary| {
            json!({
                "client_id": summary.client_id,
                "connection_id": summary.connection_id.to_string(),
                "connected_at": summary.connected_at.to_rfc3339(),
                "buffered_chunks": summary.buffered_chunks,
                "buffered_bytes": summary.buffered_bytes,
                "persona_state": summary.persona_state.map(|s| s.as_str()),
                "persona": summary.persona,
                "message_count": summary.message_count
            })
        })
        .collect();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": overall_stats(&metrics, uptime_seconds),
        "endpoints": endpoint_stats,
        "connections": connections,
        "memory": get_memory_info(),
        "performance": {
            "max_concurrent_sessions": state.config.performance.max_concurrent_sessions,
            "min_audio_bytes": state.config.performance.min_audio_bytes,
            "backend_timeout_secs": state.config.performance.backend_timeout_secs
        }
    }))
}

fn overall_stats(metrics: &AppMetrics, uptime_seconds: u64) -> serde_json::Value {
    json!({
        "total_requests": metrics.request_count,
        "total_errors": metrics.error_count,
        "error_rate": metrics.error_rate(),
        "requests_per_second": if uptime_seconds > 0 {
            metrics.request_count as f64 / uptime_seconds as f64
        } else {
            0.0
        }
    })
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Some((rss, size)) = read_proc_memory() {
            return json!({
                "resident_memory_bytes": rss,
                "virtual_memory_bytes": size,
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

/// (VmRSS, VmSize) in bytes from `/proc/self/status`.
#[cfg(target_os = "linux")]
fn read_proc_memory() -> Option<(u64, u64)> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let field = |name: &str| -> u64 {
        status
            .lines()
            .find(|line| line.starts_with(name))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
            .map_or(0, |kb| kb * 1024)
    };
    Some((field("VmRSS:"), field("VmSize:")))
}

fn get_system_status(active: usize, max: usize) -> serde_json::Value {
    let usage = if max > 0 { active as f64 / max as f64 } else { 0.0 };

    let status = if usage > 0.9 {
        "high_load"
    } else if usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (usage * 100.0).round(),
        "max_sessions": max,
        "current_sessions": active,
        "load_warnings": if usage > 0.8 {
            vec!["High session usage - consider increasing max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::ScriptedBackend;
    use crate::voice::ConnectionHandle;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_root_banner() {
        let app = test::init_service(App::new().route("/", web::get().to(root))).await;
        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/").to_request()).await;

        assert_eq!(body, json!({"status": "online", "service": "AI Voice Calling Assistant"}));
    }

    #[actix_web::test]
    async fn test_health_reports_model_and_connections() {
        let state = web::Data::new(AppState::for_tests(ScriptedBackend::new()));
        let (handle, _rx) = ConnectionHandle::channel();
        state.registry.connect("client-1", handle).unwrap();

        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/health", web::get().to(health_check)),
        )
        .await;
        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/health").to_request()).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["model"], "scripted");
        assert_eq!(body["active_connections"], 1);
        assert_eq!(body["speech"]["available"], false);
    }

    #[actix_web::test]
    async fn test_metrics_lists_connections() {
        let state = web::Data::new(AppState::for_tests(ScriptedBackend::new()));
        let (handle, _rx) = ConnectionHandle::channel();
        state.registry.connect("client-7", handle).unwrap();
        state.record_endpoint_request("GET /health", 4, false);

        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/api/v1/metrics", web::get().to(detailed_metrics)),
        )
        .await;
        let body: serde_json::Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::get().uri("/api/v1/metrics").to_request(),
        )
        .await;

        assert_eq!(body["connections"][0]["client_id"], "client-7");
        assert_eq!(body["connections"][0]["persona_state"], "uninitialized");
        assert_eq!(body["endpoints"][0]["endpoint"], "GET /health");
        assert_eq!(body["performance"]["max_concurrent_sessions"], 100);
    }

    #[actix_web::test]
    async fn test_system_status_thresholds() {
        assert_eq!(get_system_status(0, 100)["status"], "normal");
        assert_eq!(get_system_status(75, 100)["status"], "moderate_load");
        assert_eq!(get_system_status(95, 100)["status"], "high_load");
        assert_eq!(get_system_status(0, 0)["session_usage_percent"], 0.0);
    }
}
