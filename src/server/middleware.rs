// Greeter is open-source under the Apache License 2.0; see LICENSE for usage and contributions.
// HTTP middleware pipeline: metrics, panic recovery, access logging, request timeout.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;

use crate::error::{panic_message, ServerError};
use crate::metrics::MetricsRecorder;

/// Error envelope returned by every failing HTTP route.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ErrorResponse {
    pub error: String,
}

/// Wraps `router` in the request pipeline, outermost first:
///
/// 1. metrics: counts the request and observes its duration on every exit path
/// 2. panic recovery: turns a handler panic into a 500 error envelope
/// 3. access log: one line per request with status and latency
/// 4. timeout: bounds the handler by the transport timeout
pub(crate) fn with_pipeline(
    router: Router,
    recorder: Arc<MetricsRecorder>,
    timeout: Duration,
) -> Router {
    router.layer(
        ServiceBuilder::new()
            .layer(middleware::from_fn_with_state(recorder, track_metrics))
            .layer(CatchPanicLayer::custom(recover_panic))
            .layer(middleware::from_fn(access_log))
            .layer(TimeoutLayer::new(timeout)),
    )
}

async fn track_metrics(
    State(recorder): State<Arc<MetricsRecorder>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| request.uri().path().to_owned());

    let _scope = recorder.record_request(&path, request.method().as_str());
    next.run(request).await
}

fn recover_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let err = ServerError::HandlerPanic(panic_message(panic.as_ref()));
    tracing::error!(error = %err, "recovered from panic in http handler");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
        .into_response()
}

async fn access_log(request: Request, next: Next) -> Response {
    let mut entry = AccessEntry::begin(&request);
    let response = next.run(request).await;
    entry.status = Some(response.status());
    response
}

/// One access log line, emitted on drop so unwinding and cancelled requests
/// are logged as well.
struct AccessEntry {
    client_ip: String,
    method: String,
    path: String,
    started: Instant,
    status: Option<StatusCode>,
}

impl AccessEntry {
    fn begin(request: &Request) -> Self {
        let remote = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        let uri = request.uri();
        let path = match uri.query() {
            Some(query) => format!("{}?{}", uri.path(), query),
            None => uri.path().to_owned(),
        };

        Self {
            client_ip: client_ip(request.headers(), remote),
            method: request.method().to_string(),
            path,
            started: Instant::now(),
            status: None,
        }
    }
}

impl Drop for AccessEntry {
    fn drop(&mut self) {
        let latency = self.started.elapsed();
        match self.status {
            Some(status) => tracing::info!(
                client_ip = %self.client_ip,
                method = %self.method,
                path = %self.path,
                status = status.as_u16(),
                ?latency,
                "request completed"
            ),
            None if thread::panicking() => tracing::info!(
                client_ip = %self.client_ip,
                method = %self.method,
                path = %self.path,
                status = StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                ?latency,
                "request panicked"
            ),
            None => tracing::info!(
                client_ip = %self.client_ip,
                method = %self.method,
                path = %self.path,
                ?latency,
                "request cancelled"
            ),
        }
    }
}

/// First `X-Forwarded-For` hop, then `X-Real-Ip`, then the peer address.
fn client_ip(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let real_ip = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    forwarded
        .or(real_ip)
        .map(str::to_owned)
        .or_else(|| remote.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{sample, MetricsRegistry};
    use axum::body::{to_bytes, Body};
    use axum::http::HeaderValue;
    use axum::routing::get;
    use tower::ServiceExt;

    async fn explode() -> &'static str {
        panic!("handler exploded")
    }

    fn pipeline(registry: &Arc<MetricsRegistry>, namespace: &str) -> Router {
        let recorder = Arc::new(MetricsRecorder::new(registry.clone(), namespace, "").unwrap());
        let router = Router::new()
            .route("/ok/:name", get(|| async { "ok" }))
            .route("/panic", get(explode))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            );
        with_pipeline(router, recorder, Duration::from_millis(100))
    }

    fn get_request(uri: &str) -> Request {
        axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn client_ip_prefers_forwarded_headers() {
        let remote: SocketAddr = "10.0.0.9:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, Some(remote)), "10.0.0.9");
        assert_eq!(client_ip(&headers, None), "-");

        headers.insert("x-real-ip", HeaderValue::from_static("192.0.2.7"));
        assert_eq!(client_ip(&headers, Some(remote)), "192.0.2.7");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.1, 198.51.100.2"),
        );
        assert_eq!(client_ip(&headers, Some(remote)), "203.0.113.1");
    }

    #[tokio::test]
    async fn panic_becomes_500_envelope_and_is_still_measured() {
        let registry = Arc::new(MetricsRegistry::new().unwrap());
        let app = pipeline(&registry, "mw_panic");

        let response = app.oneshot(get_request("/panic")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let envelope: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert!(envelope.error.contains("handler exploded"));

        let labels = [("path", "/panic"), ("method", "GET")];
        let rendered = registry.render();
        assert_eq!(sample(&rendered, "mw_panic_http_requests_total", &labels), Some(1.0));
        assert_eq!(
            sample(&rendered, "mw_panic_http_request_duration_seconds_count", &labels),
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn metrics_use_the_matched_route() {
        let registry = Arc::new(MetricsRegistry::new().unwrap());
        let app = pipeline(&registry, "mw_route");

        for name in ["alice", "bob"] {
            let response = app
                .clone()
                .oneshot(get_request(&format!("/ok/{name}?x=1")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = app.oneshot(get_request("/missing")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let rendered = registry.render();
        assert_eq!(
            sample(&rendered, "mw_route_http_requests_total", &[("path", "/ok/:name")]),
            Some(2.0)
        );
        assert_eq!(
            sample(&rendered, "mw_route_http_request_duration_seconds_count", &[("path", "/ok/:name")]),
            Some(2.0)
        );
    }

    #[tokio::test]
    async fn slow_handler_hits_the_request_timeout() {
        let registry = Arc::new(MetricsRegistry::new().unwrap());
        let app = pipeline(&registry, "mw_timeout");

        let response = app.oneshot(get_request("/slow")).await.unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }
}
