// Greeter is open-source under the Apache License 2.0; see LICENSE for usage and contributions.
// Tower layer for the gRPC server: per-call deadline and panic recovery.

use std::panic::AssertUnwindSafe;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use tonic::body::BoxBody;
use tonic::codegen::http::{Request, Response};
use tonic::Status;
use tower::{Layer, Service};

use crate::error::{panic_message, ServerError};

/// Bounds every call by `timeout` and turns handler panics into
/// `Internal` statuses.
#[derive(Clone, Copy, Debug)]
pub struct RecoveryLayer {
    timeout: Duration,
}

impl RecoveryLayer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl<S> Layer<S> for RecoveryLayer {
    type Service = Recovery<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Recovery {
            inner,
            timeout: self.timeout,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Recovery<S> {
    inner: S,
    timeout: Duration,
}

impl<S, B> Service<Request<B>> for Recovery<S>
where
    S: Service<Request<B>, Response = Response<BoxBody>>,
    S::Future: Send + 'static,
    S::Error: 'static,
{
    type Response = Response<BoxBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let timeout = self.timeout;
        let method = request.uri().path().to_owned();
        let call = AssertUnwindSafe(self.inner.call(request)).catch_unwind();

        Box::pin(async move {
            match tokio::time::timeout(timeout, call).await {
                Ok(Ok(result)) => result,
                Ok(Err(panic)) => {
                    let err = ServerError::HandlerPanic(panic_message(panic.as_ref()));
                    tracing::error!(%method, error = %err, "recovered from panic in grpc handler");
                    Ok(Status::internal(err.to_string()).to_http())
                }
                Err(_) => {
                    let err = ServerError::DeadlineExceeded(timeout);
                    tracing::warn!(%method, error = %err, "grpc call timed out");
                    Ok(Status::deadline_exceeded(err.to_string()).to_http())
                }
            }
        })
    }
}
