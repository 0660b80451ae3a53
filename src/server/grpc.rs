// Greeter is open-source under the Apache License 2.0; see LICENSE for usage and contributions.
// This gRPC transport exposes the helloworld.v1 Greeter contract.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt;
use tonic::transport::server::{Connected, TcpConnectInfo};
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use super::recovery::RecoveryLayer;
use super::{net, ServeContext, Transport};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::pb::helloworld::v1::greeter_server::{Greeter as GreeterRpcService, GreeterServer};
use crate::pb::helloworld::v1::{HelloReply, HelloRequest};
use crate::service::GreeterServiceHandle;

pub struct GrpcTransport {
    config: ServerConfig,
    service: GreeterServiceHandle,
    started: AtomicBool,
    running: Mutex<Option<Running>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// A live server. `kill` flips at the grace deadline and fails every
/// accepted connection; dropping it does the same.
struct Running {
    shutdown: Option<oneshot::Sender<()>>,
    kill: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Drop for Running {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl GrpcTransport {
    pub fn new(config: ServerConfig, service: GreeterServiceHandle) -> Self {
        Self {
            config,
            service,
            started: AtomicBool::new(false),
            running: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    fn name(&self) -> &'static str {
        "grpc"
    }

    async fn start(&self, ctx: ServeContext) -> Result<(), ServerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ServerError::config("grpc transport has already been started"));
        }

        let listener = net::bind(self.config.network(), self.config.address()).await?;
        let addr = listener.local_addr().ok();
        *self.local_addr.lock() = addr;

        tracing::info!(
            transport = "grpc",
            network = self.config.network(),
            address = self.config.address(),
            local_addr = ?addr,
            "server listening"
        );

        let router = Server::builder()
            .layer(RecoveryLayer::new(self.config.timeout()))
            .add_service(GreeterServer::new(GreeterRpc::new(self.service.clone())));

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let (kill, kill_rx) = watch::channel(false);
        let incoming = TcpListenerStream::new(listener).map(move |accepted| {
            accepted.map(|stream| AbortableStream::new(stream, kill_rx.clone()))
        });

        let task = tokio::spawn(async move {
            let signal = async {
                let _ = shutdown_rx.await;
            };
            let served = router
                .serve_with_incoming_shutdown(incoming, signal)
                .await;

            if let Err(err) = served {
                tracing::error!(error = %err, "grpc server error");
                ctx.report(ServerError::Serve {
                    transport: "grpc",
                    source: Box::new(err),
                });
            }
        });

        *self.running.lock() = Some(Running {
            shutdown: Some(shutdown),
            kill,
            task,
        });
        Ok(())
    }

    async fn stop(&self, grace: Duration) -> Result<(), ServerError> {
        let Some(mut running) = self.running.lock().take() else {
            return Ok(());
        };

        tracing::info!(transport = "grpc", "server stopping");
        if let Some(shutdown) = running.shutdown.take() {
            let _ = shutdown.send(());
        }

        match tokio::time::timeout(grace, &mut running.task).await {
            Ok(_) => {
                tracing::info!(transport = "grpc", "server stopped");
                Ok(())
            }
            Err(_) => {
                let _ = running.kill.send(true);
                running.task.abort();
                tracing::warn!(transport = "grpc", ?grace, "in-flight calls abandoned after grace period");
                Err(ServerError::ShutdownTimeout {
                    transport: "grpc",
                    grace,
                })
            }
        }
    }
}

/// Accepted connection that fails all further IO once the transport is
/// killed, so hyper drops it together with its in-flight calls.
struct AbortableStream {
    inner: TcpStream,
    killed: Pin<Box<dyn Future<Output = ()> + Send>>,
    aborted: bool,
}

impl AbortableStream {
    fn new(inner: TcpStream, mut kill: watch::Receiver<bool>) -> Self {
        let killed = Box::pin(async move {
            loop {
                let killed = *kill.borrow_and_update();
                if killed || kill.changed().await.is_err() {
                    break;
                }
            }
        });

        Self {
            inner,
            killed,
            aborted: false,
        }
    }

    /// Registers the waker on the kill switch as a side effect.
    fn poll_aborted(&mut self, cx: &mut Context<'_>) -> bool {
        if !self.aborted && self.killed.as_mut().poll(cx).is_ready() {
            self.aborted = true;
        }
        self.aborted
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "grpc transport was stopped")
}

impl AsyncRead for AbortableStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_aborted(cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for AbortableStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_aborted(cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_aborted(cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_aborted(cx) {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

impl Connected for AbortableStream {
    type ConnectInfo = TcpConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.inner.connect_info()
    }
}

/// Adapts the greeting use case to the generated service trait.
struct GreeterRpc {
    service: GreeterServiceHandle,
}

impl GreeterRpc {
    fn new(service: GreeterServiceHandle) -> Self {
        Self { service }
    }
}

#[tonic::async_trait]
impl GreeterRpcService for GreeterRpc {
    async fn say_hello(
        &self,
        request: Request<HelloRequest>,
    ) -> Result<Response<HelloReply>, Status> {
        let name = request.into_inner().name;
        tracing::debug!(%name, "received say_hello request");

        let message = self.service.say_hello(&name).await.map_err(|err| {
            tracing::error!(?err, %name, "say_hello failed");
            Status::internal(err.to_string())
        })?;

        Ok(Response::new(HelloReply { message }))
    }
}
