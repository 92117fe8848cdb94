//! Access logging for the ingest and query surface.
//!
//! One structured line per completed request: method, path, status, duration,
//! and a caller hint (the API token prefix) so concurrent schedulers can be
//! told apart in the logs. Health probes are not logged.

use actix_web::Error;
use actix_web::dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready};
use futures_util::future::LocalBoxFuture;
use std::future::{Ready, ready};
use std::time::Instant;
use tracing::{info, warn};

/// How much of an API token may appear in a log line.
const TOKEN_HINT_LEN: usize = 8;

/// Paths whose requests stay out of the log.
const QUIET_SUFFIXES: &[&str] = &["/health", "/ready"];

/// Derive the caller hint from the request headers.
fn caller_hint(req: &ServiceRequest) -> String {
    match req.headers().get("x-api-key").and_then(|v| v.to_str().ok()) {
        Some(token) if token.len() > TOKEN_HINT_LEN => {
            format!("{}...", &token[..TOKEN_HINT_LEN])
        }
        Some(_) => "invalid".to_string(),
        None if req.headers().contains_key("authorization") => "bearer".to_string(),
        None => "-".to_string(),
    }
}

/// Access log middleware factory.
pub struct HttpLogger;

impl<S, B> Transform<S, ServiceRequest> for HttpLogger
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = HttpLoggerMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(HttpLoggerMiddleware { service }))
    }
}

/// Access log middleware service.
pub struct HttpLoggerMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for HttpLoggerMiddleware<S>
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
        let start = Instant::now();
        let method = req.method().to_string();
        let path = req.path().to_string();
        let quiet = QUIET_SUFFIXES.iter().any(|s| path.ends_with(s));
        let caller = caller_hint(&req);

        let fut = self.service.call(req);

        Box::pin(async move {
            let res = fut.await?;
            if quiet {
                return Ok(res);
            }

            let status = res.status();
            let duration_ms = start.elapsed().as_millis() as u64;

            if status.is_client_error() {
                warn!(
                    target: "http",
                    method = %method,
                    path = %path,
                    status = status.as_u16(),
                    duration_ms,
                    caller = %caller,
                    "request rejected"
                );
            } else if status.is_server_error() {
                warn!(
                    target: "http",
                    method = %method,
                    path = %path,
                    status = status.as_u16(),
                    duration_ms,
                    caller = %caller,
                    "request failed"
                );
            } else {
                info!(
                    target: "http",
                    method = %method,
                    path = %path,
                    status = status.as_u16(),
                    duration_ms,
                    caller = %caller,
                    "request served"
                );
            }

            Ok(res)
        })
    }
}
