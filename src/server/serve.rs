// Greeter is open-source under the Apache License 2.0; see LICENSE for usage and contributions.
// Accept loop and lifecycle shared by the axum-based transports.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::{ConnectInfo, Request};
use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tower::ServiceExt;

use super::net;
use crate::config::ServerConfig;
use crate::error::ServerError;

/// Pause after a failed accept (e.g. file descriptor exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Serves an axum router on its own listener. `HttpTransport` and
/// `MetricsTransport` delegate their lifecycle here.
pub(crate) struct RouterServer {
    name: &'static str,
    config: ServerConfig,
    router: Router,
    started: AtomicBool,
    running: Mutex<Option<Running>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// A live serving loop. Dropping it aborts the loop, which in turn aborts
/// every connection task it owns.
struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Drop for Running {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl RouterServer {
    pub(crate) fn new(name: &'static str, config: ServerConfig, router: Router) -> Self {
        Self {
            name,
            config,
            router,
            started: AtomicBool::new(false),
            running: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub(crate) async fn start(&self) -> Result<(), ServerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ServerError::config(format!(
                "{} transport has already been started",
                self.name
            )));
        }

        let listener = net::bind(self.config.network(), self.config.address()).await?;
        let addr = listener.local_addr().ok();
        *self.local_addr.lock() = addr;

        tracing::info!(
            transport = self.name,
            network = self.config.network(),
            address = self.config.address(),
            local_addr = ?addr,
            "server listening"
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            listener,
            self.router.clone(),
            self.config.timeout(),
            shutdown_rx,
        ));

        *self.running.lock() = Some(Running { shutdown, task });
        Ok(())
    }

    pub(crate) async fn stop(&self, grace: Duration) -> Result<(), ServerError> {
        let Some(mut running) = self.running.lock().take() else {
            return Ok(());
        };

        tracing::info!(transport = self.name, "server stopping");
        let _ = running.shutdown.send(true);

        match tokio::time::timeout(grace, &mut running.task).await {
            Ok(Ok(())) => {
                tracing::info!(transport = self.name, "server stopped");
                Ok(())
            }
            Ok(Err(err)) => {
                tracing::error!(transport = self.name, error = %err, "serving loop ended abnormally");
                Ok(())
            }
            Err(_) => {
                running.task.abort();
                tracing::warn!(
                    transport = self.name,
                    ?grace,
                    "in-flight requests abandoned after grace period"
                );
                Err(ServerError::ShutdownTimeout {
                    transport: self.name,
                    grace,
                })
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    router: Router,
    timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, remote_addr)) => {
                    connections.spawn(serve_connection(
                        stream,
                        remote_addr,
                        router.clone(),
                        timeout,
                        shutdown.clone(),
                    ));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }

    // Stop accepting; connections finish their in-flight request and close.
    drop(listener);
    while connections.join_next().await.is_some() {}
}

async fn serve_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    router: Router,
    timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let service = hyper::service::service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(remote_addr));
        router.clone().oneshot(request)
    });

    let mut builder = http1::Builder::new();
    builder.timer(TokioTimer::new()).header_read_timeout(timeout);

    let conn = builder.serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(err) = result {
        tracing::debug!(%remote_addr, error = %err, "connection closed with error");
    }
}
