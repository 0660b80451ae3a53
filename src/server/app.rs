// Greeter is open-source under the Apache License 2.0; see LICENSE for usage and contributions.
// App supervises the registered transports: concurrent start, one blocking wait, reverse-order stop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::signal::shutdown_signal;
use super::{ServeContext, Transport};
use crate::error::ServerError;

/// Exit code used when a second signal cuts the graceful shutdown short.
const FORCED_EXIT_CODE: i32 = 130;

/// Supervisor lifecycle. `Stopped` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

pub struct App {
    grace: Duration,
    inner: Mutex<Inner>,
}

struct Inner {
    state: AppState,
    transports: Vec<Arc<dyn Transport>>,
}

impl App {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            inner: Mutex::new(Inner {
                state: AppState::Idle,
                transports: Vec::new(),
            }),
        }
    }

    /// Adds a transport. Only allowed before `run`.
    pub fn register(&self, transport: Arc<dyn Transport>) -> Result<(), ServerError> {
        let mut inner = self.inner.lock();
        if inner.state != AppState::Idle {
            return Err(ServerError::config(format!(
                "cannot register {} transport once the app has started",
                transport.name()
            )));
        }
        inner.transports.push(transport);
        Ok(())
    }

    pub fn state(&self) -> AppState {
        self.inner.lock().state
    }

    /// Registered transport names, in registration order.
    pub fn transport_names(&self) -> Vec<&'static str> {
        self.inner
            .lock()
            .transports
            .iter()
            .map(|transport| transport.name())
            .collect()
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Serves until SIGINT/SIGTERM or a fatal transport error. Any signal
    /// that arrives once stopping has begun exits the process immediately.
    pub async fn run(&self) -> Result<(), ServerError> {
        let (first_tx, first_rx) = oneshot::channel::<()>();
        let watcher = tokio::spawn(async move {
            wait_for_forced_exit(shutdown_signal, first_tx).await;
            tracing::warn!("shutdown signal received while stopping; exiting immediately");
            std::process::exit(FORCED_EXIT_CODE);
        });

        let result = self
            .run_until(async move {
                let _ = first_rx.await;
            })
            .await;

        watcher.abort();
        result
    }

    /// Starts every transport, waits for `signal` or the first fatal
    /// transport error, then stops everything. Returns the error that
    /// triggered the shutdown, or `Ok` when `signal` did.
    pub async fn run_until<F>(&self, signal: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let transports = {
            let mut inner = self.inner.lock();
            if inner.state != AppState::Idle {
                return Err(ServerError::config("app has already been run"));
            }
            inner.state = AppState::Running;
            inner.transports.clone()
        };

        let (ctx, mut failures) = ServeContext::new();

        let results = join_all(transports.iter().map(|transport| transport.start(ctx.clone()))).await;

        let mut started = Vec::with_capacity(transports.len());
        let mut start_error = None;
        for (transport, result) in transports.iter().zip(results) {
            match result {
                Ok(()) => started.push(Arc::clone(transport)),
                Err(err) => {
                    tracing::error!(transport = transport.name(), error = %err, "transport failed to start");
                    start_error.get_or_insert(err);
                }
            }
        }

        if let Some(err) = start_error {
            self.stop_all(&started).await;
            return Err(err);
        }

        tracing::info!(transports = ?self.transport_names(), "app running");

        let outcome = tokio::select! {
            _ = signal => Ok(()),
            Some(err) = failures.recv() => {
                tracing::error!(error = %err, "transport failed; shutting down");
                Err(err)
            }
        };

        self.stop_all(&started).await;
        drop(ctx);
        outcome
    }

    /// Stops `started` in reverse order, each bounded by the grace period.
    /// A transport that overruns is abandoned and its error collected; the
    /// rest are still stopped.
    async fn stop_all(&self, started: &[Arc<dyn Transport>]) -> Vec<ServerError> {
        self.inner.lock().state = AppState::Stopping;

        let mut errors = Vec::new();
        for transport in started.iter().rev() {
            let stopped = tokio::time::timeout(self.grace, transport.stop(self.grace)).await;
            let result = match stopped {
                Ok(result) => result,
                Err(_) => Err(ServerError::ShutdownTimeout {
                    transport: transport.name(),
                    grace: self.grace,
                }),
            };

            if let Err(err) = result {
                tracing::warn!(transport = transport.name(), error = %err, "transport stopped uncleanly");
                errors.push(err);
            }
        }

        if !errors.is_empty() {
            tracing::error!(failed = errors.len(), "app stopped with shutdown errors");
        }

        self.inner.lock().state = AppState::Stopped;
        errors
    }
}

/// Resolves once a signal arrives after shutdown has begun. The first
/// signal is forwarded through `trigger`; if the receiver is already gone,
/// shutdown was started by a transport failure and that signal counts.
async fn wait_for_forced_exit<S, F>(mut next_signal: S, trigger: oneshot::Sender<()>)
where
    S: FnMut() -> F,
    F: Future<Output = ()>,
{
    next_signal().await;
    if trigger.send(()).is_ok() {
        next_signal().await;
    }
}
