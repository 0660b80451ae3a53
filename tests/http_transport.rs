// Greeter is open-source under the Apache License 2.0; see LICENSE for usage and contributions.
// Integration test: serves the HTTP transport on a real socket and drives it with reqwest.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use greeter::config::ServerConfig;
use greeter::error::ServerError;
use greeter::metrics::{MetricsRecorder, MetricsRegistry};
use greeter::repository::in_memory::InMemoryGreeterRepository;
use greeter::server::{HttpTransport, MetricsTransport, ServeContext, Transport};
use greeter::service::{GreeterService, GreeterServiceHandle, GreeterUsecase};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Notify;

/// Greets like the real service, with a few names that misbehave.
struct ScriptedService {
    entered: Arc<Notify>,
    slow: Duration,
}

impl ScriptedService {
    fn new(slow: Duration) -> Self {
        Self {
            entered: Arc::new(Notify::new()),
            slow,
        }
    }
}

#[async_trait]
impl GreeterService for ScriptedService {
    async fn say_hello(&self, name: &str) -> anyhow::Result<String> {
        match name {
            "boom" => panic!("scripted panic"),
            "broken" => anyhow::bail!("greeting store unavailable"),
            "slow" => {
                self.entered.notify_one();
                tokio::time::sleep(self.slow).await;
                Ok(format!("Hello {name}"))
            }
            _ => Ok(format!("Hello {name}")),
        }
    }
}

fn config(address: &str) -> ServerConfig {
    ServerConfig::new("tcp", address, Duration::from_secs(10)).expect("valid config")
}

async fn start_http(
    service: GreeterServiceHandle,
    registry: Arc<MetricsRegistry>,
    namespace: &str,
) -> (HttpTransport, SocketAddr) {
    let recorder = MetricsRecorder::new(registry, namespace, "").expect("metric families");
    let transport = HttpTransport::new(config("127.0.0.1:0"), service, Arc::new(recorder));
    let (ctx, _failures) = ServeContext::new();
    transport.start(ctx).await.expect("http transport starts");
    let addr = transport.local_addr().expect("bound address");
    (transport, addr)
}

fn registry() -> Arc<MetricsRegistry> {
    Arc::new(MetricsRegistry::new().expect("registry"))
}

#[tokio::test]
async fn hello_roundtrip_over_http() {
    let service = Arc::new(GreeterUsecase::new(Arc::new(InMemoryGreeterRepository::new())));
    let (transport, addr) = start_http(service, registry(), "roundtrip").await;

    let response = reqwest::get(format!("http://{addr}/helloworld/alice"))
        .await
        .expect("request succeeds");
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.expect("json body");
    assert_eq!(body["message"], "Hello alice");

    transport.stop(Duration::from_secs(1)).await.expect("clean stop");
}

#[tokio::test]
async fn service_error_returns_500_with_message() {
    let service = Arc::new(ScriptedService::new(Duration::ZERO));
    let (transport, addr) = start_http(service, registry(), "failure").await;

    let response = reqwest::get(format!("http://{addr}/helloworld/broken"))
        .await
        .expect("request succeeds");
    assert_eq!(response.status(), 500);

    let body: Value = response.json().await.expect("json body");
    let error = body["error"].as_str().expect("error field");
    assert!(!error.is_empty());

    transport.stop(Duration::from_secs(1)).await.expect("clean stop");
}

#[tokio::test]
async fn one_panicking_request_does_not_disturb_the_others() {
    let service = Arc::new(ScriptedService::new(Duration::ZERO));
    let registry = registry();
    let (transport, addr) = start_http(service, registry.clone(), "isolation").await;
    let client = reqwest::Client::new();

    let mut requests = Vec::new();
    for i in 0..10 {
        let name = if i == 3 { "boom".to_string() } else { format!("user{i}") };
        let url = format!("http://{addr}/helloworld/{name}");
        let client = client.clone();
        requests.push(tokio::spawn(async move {
            let response = client.get(url).send().await.expect("request succeeds");
            (name, response.status().as_u16())
        }));
    }

    for request in requests {
        let (name, status) = request.await.expect("request task");
        if name == "boom" {
            assert_eq!(status, 500);
        } else {
            assert_eq!(status, 200, "request for {name}");
        }
    }

    // Still serving after the panic.
    let response = client
        .get(format!("http://{addr}/helloworld/after"))
        .send()
        .await
        .expect("request succeeds");
    assert_eq!(response.status(), 200);

    let rendered = registry.render();
    assert!(rendered
        .lines()
        .any(|line| line.starts_with("isolation_http_requests_total{") && line.ends_with(" 11")));

    transport.stop(Duration::from_secs(1)).await.expect("clean stop");
}

#[tokio::test]
async fn stop_drains_in_flight_requests() {
    let service = Arc::new(ScriptedService::new(Duration::from_millis(300)));
    let entered = service.entered.clone();
    let (transport, addr) = start_http(service, registry(), "drain").await;

    let request = tokio::spawn(async move {
        reqwest::get(format!("http://{addr}/helloworld/slow"))
            .await
            .expect("in-flight request completes")
            .status()
            .as_u16()
    });
    entered.notified().await;

    transport
        .stop(Duration::from_secs(5))
        .await
        .expect("drains within grace");
    assert_eq!(request.await.expect("request task"), 200);

    assert!(TcpStream::connect(addr).await.is_err(), "listener is closed");
}

#[tokio::test]
async fn stop_abandons_requests_that_outlive_the_grace_period() {
    let service = Arc::new(ScriptedService::new(Duration::from_secs(30)));
    let entered = service.entered.clone();
    let (transport, addr) = start_http(service, registry(), "abandon").await;

    let request = tokio::spawn(async move {
        reqwest::get(format!("http://{addr}/helloworld/slow")).await
    });
    entered.notified().await;

    let started = std::time::Instant::now();
    let err = transport
        .stop(Duration::from_millis(200))
        .await
        .expect_err("grace period elapses");
    assert!(matches!(err, ServerError::ShutdownTimeout { transport: "http", .. }));
    assert!(started.elapsed() < Duration::from_secs(5));

    let outcome = tokio::time::timeout(Duration::from_secs(5), request)
        .await
        .expect("client observes the abandoned connection")
        .expect("request task");
    assert!(outcome.is_err());
}

#[tokio::test]
async fn stop_twice_is_a_noop() {
    let service = Arc::new(ScriptedService::new(Duration::ZERO));
    let (transport, _addr) = start_http(service, registry(), "twice").await;

    transport.stop(Duration::from_secs(1)).await.expect("first stop");
    transport.stop(Duration::from_secs(1)).await.expect("second stop");
}

#[tokio::test]
async fn binding_an_address_in_use_fails() {
    let service: GreeterServiceHandle = Arc::new(ScriptedService::new(Duration::ZERO));
    let registry = registry();
    let (first, addr) = start_http(service.clone(), registry.clone(), "bind_a").await;

    let recorder = MetricsRecorder::new(registry, "bind_b", "").expect("metric families");
    let second = HttpTransport::new(config(&addr.to_string()), service, Arc::new(recorder));
    let (ctx, _failures) = ServeContext::new();

    let err = second.start(ctx).await.expect_err("address already in use");
    assert!(matches!(err, ServerError::Bind { .. }));

    first.stop(Duration::from_secs(1)).await.expect("clean stop");
}

#[tokio::test]
async fn metrics_endpoint_exposes_request_families() {
    let registry = registry();
    let service = Arc::new(ScriptedService::new(Duration::ZERO));
    let (http, http_addr) = start_http(service, registry.clone(), "scraped").await;

    let scrape = MetricsTransport::new(config("127.0.0.1:0"), registry);
    let (ctx, _failures) = ServeContext::new();
    scrape.start(ctx).await.expect("metrics transport starts");
    let scrape_addr = scrape.local_addr().expect("bound address");

    reqwest::get(format!("http://{http_addr}/helloworld/erin"))
        .await
        .expect("request succeeds");

    let text = reqwest::get(format!("http://{scrape_addr}/metrics"))
        .await
        .expect("scrape succeeds")
        .text()
        .await
        .expect("text body");
    assert!(text.contains("scraped_http_requests_total{"));
    assert!(text.contains("path=\"/helloworld/:name\""));
    assert!(text.contains("scraped_http_request_duration_seconds_count{"));

    http.stop(Duration::from_secs(1)).await.expect("clean stop");
    scrape.stop(Duration::from_secs(1)).await.expect("clean stop");
}
