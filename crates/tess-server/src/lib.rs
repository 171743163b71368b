mod canvas_service;
mod convert;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tess_core::Board;
use tess_proto::v1::canvas_service_server::CanvasServiceServer;
use tess_storage::CanvasStorage;
use tonic_reflection::server::Builder as ReflectionBuilder;

pub use canvas_service::{CanvasServiceImpl, USER_ID_HEADER};
pub use convert::tess_to_status;

/// Serve the canvas API on `addr` until `shutdown` resolves.
pub async fn serve<S: CanvasStorage>(
    addr: SocketAddr,
    board: Arc<Board<S>>,
    session_buffer: usize,
    shutdown: impl std::future::Future<Output = ()>,
) -> anyhow::Result<()> {
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(tess_proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .context("failed to build reflection service")?;
    tracing::info!(%addr, session_buffer, "canvas gRPC server starting");
    tonic::transport::Server::builder()
        .add_service(CanvasServiceServer::new(CanvasServiceImpl::new(board, session_buffer)))
        .add_service(reflection)
        .serve_with_shutdown(addr, shutdown)
        .await
        .map_err(Into::into)
}
