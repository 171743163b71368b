use std::sync::Arc;

use tess_core::Board;
use tess_proto::v1::{
    canvas_service_server::CanvasService, CanvasStatus, Cell, GetCellRequest, GetSnapshotRequest,
    GetStatusRequest, PlacePixelRequest, PlacePixelResponse, Snapshot, SubscribeRequest,
    SyncEvent,
};
use tess_storage::CanvasStorage;
use tess_types::{TessError, UserId};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::convert::{
    accepted, cell_to_proto, denied, parse_color, snapshot_to_proto, status_to_proto,
    sync_event_to_proto, tess_to_status,
};

/// Metadata key carrying the caller's identity.
pub const USER_ID_HEADER: &str = "x-user-id";

pub struct CanvasServiceImpl<S> {
    board: Arc<Board<S>>,
    session_buffer: usize,
}

impl<S: CanvasStorage> CanvasServiceImpl<S> {
    pub fn new(board: Arc<Board<S>>, session_buffer: usize) -> Self {
        CanvasServiceImpl { board, session_buffer: session_buffer.max(1) }
    }
}

fn caller<T>(request: &Request<T>) -> Result<UserId, Status> {
    let raw = request
        .metadata()
        .get(USER_ID_HEADER)
        .ok_or_else(|| Status::unauthenticated("missing x-user-id"))?;
    let id = raw
        .to_str()
        .map_err(|_| Status::unauthenticated("x-user-id is not valid ASCII"))?
        .trim();
    if id.is_empty() {
        return Err(Status::unauthenticated("x-user-id must not be empty"));
    }
    Ok(UserId::new(id))
}

#[tonic::async_trait]
impl<S: CanvasStorage> CanvasService for CanvasServiceImpl<S> {
    async fn place_pixel(
        &self,
        request: Request<PlacePixelRequest>,
    ) -> Result<Response<PlacePixelResponse>, Status> {
        let user = caller(&request)?;
        let req = request.into_inner();
        let color = parse_color(&req.color).map_err(tess_to_status)?;

        match self.board.place_pixel(&user, req.x, req.y, color).await {
            Ok(record) => Ok(Response::new(accepted(record.seq))),
            Err(err @ TessError::CooldownActive { .. }) => {
                Ok(Response::new(denied(err.retry_after_secs().unwrap_or(0))))
            }
            Err(err) => Err(tess_to_status(err)),
        }
    }

    async fn get_cell(&self, request: Request<GetCellRequest>) -> Result<Response<Cell>, Status> {
        let req = request.into_inner();
        let cell = self.board.read_cell(req.x, req.y).map_err(tess_to_status)?;
        Ok(Response::new(cell_to_proto(cell)))
    }

    async fn get_snapshot(
        &self,
        _request: Request<GetSnapshotRequest>,
    ) -> Result<Response<Snapshot>, Status> {
        let snapshot = self.board.snapshot();
        Ok(Response::new(snapshot_to_proto(&snapshot)))
    }

    async fn get_status(
        &self,
        request: Request<GetStatusRequest>,
    ) -> Result<Response<CanvasStatus>, Status> {
        // Anonymous callers get the board parameters only.
        let remaining = match request.metadata().get(USER_ID_HEADER) {
            Some(_) => self.board.cooldown_remaining(&caller(&request)?),
            None => None,
        };
        Ok(Response::new(status_to_proto(self.board.status(), remaining)))
    }

    type SubscribeStream = ReceiverStream<Result<SyncEvent, Status>>;

    async fn subscribe(
        &self,
        request: Request<SubscribeRequest>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let user = caller(&request)?;
        let req = request.into_inner();
        let mut session = match req.resume_after {
            Some(after) => self.board.resume_session(user, after).await,
            None => self.board.open_session(user),
        };

        let (tx, rx) = mpsc::channel(self.session_buffer);
        tokio::spawn(async move {
            let id = session.id();
            tracing::debug!(session = %id, user = %session.user(), "subscription started");
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    event = session.next_event() => match event {
                        Ok(event) => {
                            if tx.send(Ok(sync_event_to_proto(&event))).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            let _ = tx.send(Err(tess_to_status(err))).await;
                            break;
                        }
                    },
                }
            }
            session.close();
            tracing::debug!(session = %id, "subscription ended");
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
