use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::coordinator::Coordinator;
use crate::error::{RelayError, Result};
use crate::grpc::{CoordinatorServiceImpl, WorkerServiceImpl};
use crate::proto::coordinator_service_server::CoordinatorServiceServer;
use crate::proto::worker_service_server::WorkerServiceServer;
use crate::worker::ExecutionEngine;

/// Bind a listener up front so callers (and tests using port 0) learn the
/// real address before serving starts.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| RelayError::Config(format!("cannot bind {}: {}", addr, e)))
}

/// Serve the coordinator API until `shutdown` fires.
pub async fn serve_coordinator(
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr().ok();
    tracing::info!(addr = ?addr, "Starting coordinator gRPC server");

    Server::builder()
        .add_service(CoordinatorServiceServer::new(CoordinatorServiceImpl::new(
            coordinator,
        )))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled_owned())
        .await?;

    tracing::info!(addr = ?addr, "Coordinator gRPC server stopped");
    Ok(())
}

/// Serve the worker side of the dispatch protocol until `shutdown` fires.
pub async fn serve_worker(
    listener: TcpListener,
    engine: Arc<ExecutionEngine>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr().ok();
    tracing::info!(addr = ?addr, worker_id = %engine.worker_id(), "Starting worker gRPC server");

    Server::builder()
        .add_service(WorkerServiceServer::new(WorkerServiceImpl::new(engine)))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled_owned())
        .await?;

    tracing::info!(addr = ?addr, "Worker gRPC server stopped");
    Ok(())
}
