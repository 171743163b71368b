use std::time::Duration;

use tess_core::{BoardStatus, SyncEvent};
use tess_proto::v1::{self, place_pixel_response, sync_event};
use tess_types::{ceil_secs, CanvasSnapshot, Cell, ChangeRecord, Color, TessError};
use tonic::Status;

pub fn parse_color(raw: &str) -> Result<Color, TessError> {
    raw.trim().parse()
}

pub fn cell_to_proto(cell: Cell) -> v1::Cell {
    v1::Cell {
        x: cell.coord.x,
        y: cell.coord.y,
        color: cell.color.to_string(),
        last_writer: cell.last_writer.map(|u| u.to_string()).unwrap_or_default(),
        last_write_ns: cell.last_write_ns,
        seq: cell.seq,
    }
}

pub fn snapshot_to_proto(snapshot: &CanvasSnapshot) -> v1::Snapshot {
    v1::Snapshot { size: snapshot.size, seq: snapshot.seq, pixels: snapshot.packed_rgb() }
}

pub fn change_to_proto(record: &ChangeRecord) -> v1::Change {
    v1::Change {
        seq: record.seq,
        x: record.coord.x,
        y: record.coord.y,
        color: record.color.to_string(),
        writer: record.writer.to_string(),
        commit_ns: record.commit_ns,
    }
}

pub fn sync_event_to_proto(event: &SyncEvent) -> v1::SyncEvent {
    let event = match event {
        SyncEvent::Snapshot(snapshot) => sync_event::Event::Snapshot(snapshot_to_proto(snapshot)),
        SyncEvent::Change(record) => sync_event::Event::Change(change_to_proto(record)),
    };
    v1::SyncEvent { event: Some(event) }
}

pub fn status_to_proto(
    status: BoardStatus,
    cooldown_remaining: Option<Duration>,
) -> v1::CanvasStatus {
    v1::CanvasStatus {
        size: status.size,
        head_seq: status.head_seq,
        cooldown_secs: ceil_secs(status.cooldown),
        palette: status.palette.iter().map(Color::to_string).collect(),
        active_sessions: status.active_sessions as u64,
        cooldown_remaining_secs: cooldown_remaining.map_or(0, ceil_secs),
    }
}

pub fn accepted(seq: u64) -> v1::PlacePixelResponse {
    v1::PlacePixelResponse {
        outcome: Some(place_pixel_response::Outcome::Accepted(place_pixel_response::Accepted {
            seq,
        })),
    }
}

pub fn denied(retry_after_secs: u64) -> v1::PlacePixelResponse {
    v1::PlacePixelResponse {
        outcome: Some(place_pixel_response::Outcome::Denied(place_pixel_response::Denied {
            retry_after_secs,
        })),
    }
}

pub fn tess_to_status(err: TessError) -> Status {
    match &err {
        TessError::OutOfRange { .. }
        | TessError::InvalidColor(_)
        | TessError::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
        TessError::CooldownActive { .. } => Status::resource_exhausted(err.to_string()),
        TessError::HistoryTruncated { .. } => Status::out_of_range(err.to_string()),
        TessError::StorageUnavailable(_) => Status::unavailable(err.to_string()),
        TessError::TransportClosed => Status::cancelled(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use tess_types::Coord;
    use tonic::Code;

    #[test]
    fn errors_map_to_grpc_codes() {
        let cases = [
            (TessError::OutOfRange { x: 99, y: 0, size: 50 }, Code::InvalidArgument),
            (TessError::InvalidColor("#nope".into()), Code::InvalidArgument),
            (TessError::StorageUnavailable("down".into()), Code::Unavailable),
            (TessError::HistoryTruncated { requested: 1, earliest: 9 }, Code::OutOfRange),
            (TessError::CooldownActive { retry_after: Duration::from_secs(3) }, Code::ResourceExhausted),
            (TessError::TransportClosed, Code::Cancelled),
        ];
        for (err, code) in cases {
            assert_eq!(tess_to_status(err).code(), code);
        }
    }

    #[test]
    fn color_text_is_normalised() {
        assert_eq!(parse_color(" #ff0000 ").unwrap(), Color::from_rgb(0xFF, 0, 0));
        assert!(parse_color("red").is_err());
    }

    #[test]
    fn unpainted_cell_has_empty_writer() {
        let proto = cell_to_proto(Cell::blank(Coord::new(4, 7)));
        assert_eq!((proto.x, proto.y, proto.seq), (4, 7, 0));
        assert_eq!(proto.color, "#FFFFFF");
        assert!(proto.last_writer.is_empty());
    }

    #[test]
    fn change_event_carries_record() {
        let record = ChangeRecord {
            seq: 12,
            coord: Coord::new(1, 2),
            color: Color::BLACK,
            writer: "ada".into(),
            commit_ns: 5,
        };
        let proto = sync_event_to_proto(&SyncEvent::Change(Arc::new(record)));
        let Some(sync_event::Event::Change(change)) = proto.event else {
            panic!("expected change event")
        };
        assert_eq!(change.seq, 12);
        assert_eq!(change.color, "#000000");
        assert_eq!(change.writer, "ada");
    }
}
