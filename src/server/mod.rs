// Greeter is open-source under the Apache License 2.0; see LICENSE for usage and contributions.
// This module orchestrates the HTTP, gRPC and metrics transports behind one supervisor.

mod app;
mod grpc;
mod http;
mod middleware;
mod net;
mod recovery;
mod scrape;
mod serve;
pub mod signal;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::error::ServerError;
use crate::metrics::{MetricsRecorder, MetricsRegistry};
use crate::repository::in_memory::InMemoryGreeterRepository;
use crate::service::{GreeterServiceHandle, GreeterUsecase};

pub use app::{App, AppState};
pub use grpc::GrpcTransport;
pub use http::HttpTransport;
pub use recovery::{Recovery, RecoveryLayer};
pub use scrape::MetricsTransport;

/// A listener plus its serving loop, with a uniform lifecycle.
///
/// `start` binds and returns as soon as the listener is live, leaving the
/// serving loop running in the background. `stop` drains in-flight work for
/// at most `grace`, then abandons whatever is left. Stopping twice, or
/// stopping a transport that never started, is a no-op.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start(&self, ctx: ServeContext) -> Result<(), ServerError>;

    async fn stop(&self, grace: Duration) -> Result<(), ServerError>;
}

/// Handed to every transport on start; serving loops that die after a
/// successful start report through it so the supervisor can shut down.
#[derive(Clone, Debug)]
pub struct ServeContext {
    failures: mpsc::UnboundedSender<ServerError>,
}

impl ServeContext {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerError>) {
        let (failures, rx) = mpsc::unbounded_channel();
        (Self { failures }, rx)
    }

    pub fn report(&self, err: ServerError) {
        // The supervisor may already be shutting down.
        let _ = self.failures.send(err);
    }
}

/// Registers the transports enabled in `cfg`, in the order metrics, gRPC,
/// HTTP. Shutdown runs in reverse, so HTTP stops taking traffic first and
/// the scrape endpoint goes last.
pub fn build_app(
    cfg: &AppConfig,
    service: GreeterServiceHandle,
    registry: Arc<MetricsRegistry>,
) -> Result<App, ServerError> {
    if cfg.http_server()?.is_none() && cfg.grpc_server()?.is_none() {
        return Err(ServerError::config(
            "no transports configured; enable server.http or server.grpc",
        ));
    }

    let app = App::new(cfg.shutdown_grace());

    if let Some(server) = cfg.metrics_server()? {
        app.register(Arc::new(MetricsTransport::new(server, registry.clone())))?;
    }

    if let Some(server) = cfg.grpc_server()? {
        app.register(Arc::new(GrpcTransport::new(server, service.clone())))?;
    }

    if let Some(server) = cfg.http_server()? {
        let (namespace, subsystem) = cfg.metrics_names();
        let recorder = MetricsRecorder::new(registry, &namespace, &subsystem)?;
        app.register(Arc::new(HttpTransport::new(
            server,
            service,
            Arc::new(recorder),
        )))?;
    }

    Ok(app)
}

/// Wires the default service and serves until a shutdown signal.
pub async fn run(cfg: AppConfig) -> Result<()> {
    let registry = Arc::new(MetricsRegistry::new()?);
    let repo = Arc::new(InMemoryGreeterRepository::new());
    let service: GreeterServiceHandle = Arc::new(GreeterUsecase::new(repo));

    let app = build_app(&cfg, service, registry)?;
    app.run().await?;

    tracing::info!(service = %cfg.service_name, "shutdown complete");
    Ok(())
}
