// Greeter is open-source under the Apache License 2.0; see LICENSE for usage and contributions.
// Axum HTTP endpoints for the greeting service.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::middleware::{with_pipeline, ErrorResponse};
use super::serve::RouterServer;
use super::{ServeContext, Transport};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::metrics::MetricsRecorder;
use crate::service::GreeterServiceHandle;

#[derive(Debug, Serialize, Deserialize)]
struct HelloResponse {
    message: String,
}

/// Serves `GET /helloworld/{name}` behind the request pipeline.
pub struct HttpTransport {
    server: RouterServer,
}

impl HttpTransport {
    pub fn new(
        config: ServerConfig,
        service: GreeterServiceHandle,
        recorder: Arc<MetricsRecorder>,
    ) -> Self {
        let app = router(service, recorder, config.timeout());
        Self {
            server: RouterServer::new("http", config, app),
        }
    }

    /// The bound address once started; useful when configured with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn start(&self, _ctx: ServeContext) -> Result<(), ServerError> {
        self.server.start().await
    }

    async fn stop(&self, grace: Duration) -> Result<(), ServerError> {
        self.server.stop(grace).await
    }
}

fn router(service: GreeterServiceHandle, recorder: Arc<MetricsRecorder>, timeout: Duration) -> Router {
    let routes = Router::new()
        .route("/helloworld/:name", get(say_hello))
        .with_state(service);

    with_pipeline(routes, recorder, timeout)
}

async fn say_hello(
    State(service): State<GreeterServiceHandle>,
    Path(name): Path<String>,
) -> Response {
    match service.say_hello(&name).await {
        Ok(message) => (StatusCode::OK, Json(HelloResponse { message })).into_response(),
        Err(err) => {
            tracing::error!(?err, %name, "say_hello failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: err.to_string(),
                }),
            )
                .into_response()
        }
    }
}
