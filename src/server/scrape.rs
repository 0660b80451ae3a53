// Greeter is open-source under the Apache License 2.0; see LICENSE for usage and contributions.
// Prometheus scrape endpoint served on its own listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tower_http::timeout::TimeoutLayer;

use super::serve::RouterServer;
use super::{ServeContext, Transport};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::metrics::MetricsRegistry;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub struct MetricsTransport {
    server: RouterServer,
}

impl MetricsTransport {
    pub fn new(config: ServerConfig, registry: Arc<MetricsRegistry>) -> Self {
        let app = router(registry, config.timeout());
        Self {
            server: RouterServer::new("metrics", config, app),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }
}

#[async_trait]
impl Transport for MetricsTransport {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn start(&self, _ctx: ServeContext) -> Result<(), ServerError> {
        self.server.start().await
    }

    async fn stop(&self, grace: Duration) -> Result<(), ServerError> {
        self.server.stop(grace).await
    }
}

fn router(registry: Arc<MetricsRegistry>, timeout: Duration) -> Router {
    Router::new()
        .route("/metrics", get(render))
        .with_state(registry)
        .layer(TimeoutLayer::new(timeout))
}

async fn render(State(registry): State<Arc<MetricsRegistry>>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, CONTENT_TYPE)], registry.render())
}
