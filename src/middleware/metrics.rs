//! # Metrics Middleware
//!
//! Counts every HTTP request and records its duration and outcome per endpoint.
//!
//! Endpoints are keyed by the matched route pattern (`GET /ws/voice/{client_id}`), not the
//! concrete path, so per-client URLs do not each get their own entry. Requests that match
//! no route are keyed by their raw path.

use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};

pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService { service }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let method = req.method().to_string();
        let path = req.path().to_string();

        let state = req.app_data::<web::Data<AppState>>().cloned();
        if let Some(state) = &state {
            state.increment_request_count();
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = start_time.elapsed().as_millis() as u64;

            let Some(state) = state else {
                return result;
            };

            // The route pattern is only known once routing has run
            let (endpoint, is_error) = match &result {
                Ok(response) => {
                    let pattern = response.request().match_pattern().unwrap_or(path);
                    let status = response.status();
                    (
                        endpoint_key(&method, &pattern),
                        status.is_client_error() || status.is_server_error(),
                    )
                }
                Err(_) => (endpoint_key(&method, &path), true),
            };

            state.record_endpoint_request(&endpoint, duration_ms, is_error);
            if is_error {
                state.increment_error_count();
            }

            result
        })
    }
}

fn endpoint_key(method: &str, pattern: &str) -> String {
    format!("{} {}", method, pattern)
}
