use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use tess_types::{Cell, ChangeRecord, Coord, Seq, TessError};

use crate::keys::{cell_key, log_key, meta_key, seq_from_log_key, META_LAST_PURGED, META_LAST_SEQ};
use crate::traits::CanvasStorage;
use crate::types::FeedState;

fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, TessError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| TessError::StorageUnavailable(e.to_string()))
}

fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, TessError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| TessError::StorageUnavailable(e.to_string()))
}

fn fjall_err(e: fjall::Error) -> TessError {
    TessError::StorageUnavailable(e.to_string())
}

fn join_err(e: tokio::task::JoinError) -> TessError {
    TessError::StorageUnavailable(e.to_string())
}

// ---------------------------------------------------------------------------
// FjallStore — shared handle wrapping the three keyspaces
// ---------------------------------------------------------------------------

/// Shared storage handle.
///
/// All keyspaces live in a single fjall `Database` so that a commit, which
/// touches all three, is one atomic write batch.
pub struct FjallStore {
    pub db: fjall::Database,
    /// Current cell state: `y(4) ++ x(4)` → bincode(Cell)
    pub cells: fjall::Keyspace,
    /// Change log: `seq(8)` → bincode(ChangeRecord)
    pub change_log: fjall::Keyspace,
    /// Head and purge point: `label_utf8` → bincode(u64)
    pub meta: fjall::Keyspace,
}

impl FjallStore {
    /// Open (or create) a `FjallStore` at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>, TessError> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let cells =
            db.keyspace("cells", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let change_log =
            db.keyspace("change_log", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let meta =
            db.keyspace("meta", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        Ok(Arc::new(FjallStore { db, cells, change_log, meta }))
    }

    fn read_cell(&self, coord: Coord) -> Result<Option<Cell>, TessError> {
        match self.cells.get(cell_key(coord)).map_err(fjall_err)? {
            Some(b) => Ok(Some(decode::<Cell>(&b)?)),
            None => Ok(None),
        }
    }

    fn read_meta(&self, label: &str) -> Result<Option<u64>, TessError> {
        match self.meta.get(meta_key(label)).map_err(fjall_err)? {
            Some(b) => Ok(Some(decode::<u64>(&b)?)),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// FjallCanvasStorage
// ---------------------------------------------------------------------------

/// `CanvasStorage` backed by fjall.
///
/// All blocking I/O is wrapped in `tokio::task::spawn_blocking`.
pub struct FjallCanvasStorage(pub Arc<FjallStore>);

impl FjallCanvasStorage {
    pub fn open(path: &Path) -> Result<Self, TessError> {
        Ok(FjallCanvasStorage(FjallStore::open(path)?))
    }
}

impl CanvasStorage for FjallCanvasStorage {
    async fn feed_state(&self) -> Result<FeedState, TessError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<FeedState, TessError> {
            let start = log_key(0).to_vec();
            let end = log_key(Seq::MAX).to_vec();
            let first_seq = match store.change_log.range(start..=end).next() {
                Some(guard) => {
                    let (k, _) = guard.into_inner().map_err(fjall_err)?;
                    Some(seq_from_log_key(&k).ok_or_else(|| {
                        TessError::StorageUnavailable("short change_log key".into())
                    })?)
                }
                None => None,
            };
            Ok(FeedState {
                first_seq,
                last_seq: store.read_meta(META_LAST_SEQ)?,
                last_purged: store.read_meta(META_LAST_PURGED)?,
            })
        })
        .await
        .map_err(join_err)?
    }

    async fn commit(&self, record: ChangeRecord) -> Result<(), TessError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), TessError> {
            if store.change_log.get(log_key(record.seq)).map_err(fjall_err)?.is_some() {
                return Err(TessError::InvalidArgument(format!(
                    "seq {} is already committed",
                    record.seq
                )));
            }
            if let Some(cell) = store.read_cell(record.coord)? {
                if cell.seq >= record.seq {
                    return Err(TessError::InvalidArgument(format!(
                        "stale write to {}: cell is at seq {}, got {}",
                        record.coord, cell.seq, record.seq
                    )));
                }
            }
            let high = store.read_meta(META_LAST_SEQ)?.unwrap_or(0).max(record.seq);

            let mut batch = store.db.batch();
            let cell = Cell::from(&record);
            batch.insert(&store.cells, cell_key(record.coord).to_vec(), encode(&cell)?);
            batch.insert(&store.change_log, log_key(record.seq).to_vec(), encode(&record)?);
            batch.insert(&store.meta, meta_key(META_LAST_SEQ), encode(&high)?);
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn renumber(&self, moves: Vec<(Seq, ChangeRecord)>) -> Result<(), TessError> {
        let Some(high) = moves.iter().map(|(_, r)| r.seq).max() else {
            return Ok(());
        };
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), TessError> {
            // An old key that is also a new key is overwritten, not removed.
            let reused: HashSet<Seq> = moves.iter().map(|(_, r)| r.seq).collect();
            let mut batch = store.db.batch();
            for (old, _) in moves.iter().filter(|(old, _)| !reused.contains(old)) {
                batch.remove(&store.change_log, log_key(*old).to_vec());
            }
            for (old, record) in &moves {
                if store.read_cell(record.coord)?.is_some_and(|c| c.seq == *old) {
                    let cell = Cell::from(record);
                    batch.insert(&store.cells, cell_key(record.coord).to_vec(), encode(&cell)?);
                }
                batch.insert(&store.change_log, log_key(record.seq).to_vec(), encode(record)?);
            }
            batch.insert(&store.meta, meta_key(META_LAST_SEQ), encode(&high)?);
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn load_cells(&self) -> Result<Vec<Cell>, TessError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Cell>, TessError> {
            let start = cell_key(Coord::new(0, 0)).to_vec();
            let end = cell_key(Coord::new(u32::MAX, u32::MAX)).to_vec();
            store
                .cells
                .range(start..=end)
                .map(|g| g.into_inner().map_err(fjall_err).and_then(|(_, v)| decode::<Cell>(&v)))
                .collect()
        })
        .await
        .map_err(join_err)?
    }

    async fn read_log(&self, from: Seq, to_inclusive: Seq) -> Result<Vec<ChangeRecord>, TessError> {
        if from > to_inclusive {
            return Ok(Vec::new());
        }
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<ChangeRecord>, TessError> {
            store
                .change_log
                .range(log_key(from).to_vec()..=log_key(to_inclusive).to_vec())
                .map(|g| {
                    g.into_inner()
                        .map_err(fjall_err)
                        .and_then(|(_, v)| decode::<ChangeRecord>(&v))
                })
                .collect()
        })
        .await
        .map_err(join_err)?
    }

    async fn purge(&self, up_to: Seq) -> Result<(), TessError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), TessError> {
            let previous = store.read_meta(META_LAST_PURGED)?;
            let up_to = previous.map_or(up_to, |p| p.max(up_to));

            let keys: Vec<Vec<u8>> = store
                .change_log
                .range(log_key(0).to_vec()..=log_key(up_to).to_vec())
                .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
                .collect::<Result<_, _>>()?;

            let mut batch = store.db.batch();
            for k in keys {
                batch.remove(&store.change_log, k);
            }
            batch.insert(&store.meta, meta_key(META_LAST_PURGED), encode(&up_to)?);
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tess_types::Color;

    fn open(dir: &std::path::Path) -> FjallCanvasStorage {
        FjallCanvasStorage::open(dir).expect("open store")
    }

    fn record(seq: Seq, x: u32, y: u32, color: Color) -> ChangeRecord {
        ChangeRecord {
            seq,
            coord: Coord::new(x, y),
            color,
            writer: "alice".into(),
            commit_ns: 1_700_000_000_000_000_000 + seq as i64,
        }
    }

    #[tokio::test]
    async fn commit_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());

        assert_eq!(store.feed_state().await.unwrap(), FeedState::default());

        let red = Color::from_rgb(0xFF, 0, 0);
        store.commit(record(1, 10, 10, red)).await.unwrap();
        store.commit(record(2, 11, 10, Color::BLACK)).await.unwrap();

        let cells = store.load_cells().await.unwrap();
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].coord, Coord::new(10, 10));
        assert_eq!(cells[0].color, red);
        assert_eq!(cells[0].seq, 1);

        let state = store.feed_state().await.unwrap();
        assert_eq!(state.first_seq, Some(1));
        assert_eq!(state.last_seq, Some(2));

        let log = store.read_log(2, 2).await.unwrap();
        assert_eq!(log, vec![record(2, 11, 10, Color::BLACK)]);
    }

    #[tokio::test]
    async fn load_cells_is_row_major() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());

        store.commit(record(1, 3, 2, Color::BLACK)).await.unwrap();
        store.commit(record(2, 0, 0, Color::BLACK)).await.unwrap();
        store.commit(record(3, 9, 1, Color::BLACK)).await.unwrap();

        let coords: Vec<Coord> =
            store.load_cells().await.unwrap().into_iter().map(|c| c.coord).collect();
        assert_eq!(coords, vec![Coord::new(0, 0), Coord::new(9, 1), Coord::new(3, 2)]);
    }

    #[tokio::test]
    async fn stale_commit_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());

        store.commit(record(5, 0, 0, Color::BLACK)).await.unwrap();
        // Other cells may still fill lower sequence numbers.
        store.commit(record(2, 1, 0, Color::BLACK)).await.unwrap();
        assert_eq!(store.feed_state().await.unwrap().last_seq, Some(5));

        let err = store.commit(record(3, 0, 0, Color::WHITE)).await.unwrap_err();
        assert!(matches!(err, TessError::InvalidArgument(_)));
        let err = store.commit(record(2, 7, 7, Color::WHITE)).await.unwrap_err();
        assert!(matches!(err, TessError::InvalidArgument(_)));

        let cells = store.load_cells().await.unwrap();
        assert_eq!(cells.len(), 2);
        assert!(cells.iter().all(|c| c.color == Color::BLACK));
    }

    #[tokio::test]
    async fn renumber_moves_log_and_cells_together() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store.commit(record(1, 0, 0, Color::BLACK)).await.unwrap();
        store.commit(record(4, 0, 0, Color::WHITE)).await.unwrap();
        store.commit(record(6, 2, 2, Color::BLACK)).await.unwrap();

        let moves = vec![
            (4, ChangeRecord { seq: 2, ..record(4, 0, 0, Color::WHITE) }),
            (6, ChangeRecord { seq: 3, ..record(6, 2, 2, Color::BLACK) }),
        ];
        store.renumber(moves).await.unwrap();

        let log = store.read_log(1, 10).await.unwrap();
        assert_eq!(log.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(store.feed_state().await.unwrap().last_seq, Some(3));
        let cells = store.load_cells().await.unwrap();
        assert_eq!(cells.iter().map(|c| c.seq).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(cells[0].color, Color::WHITE);
    }

    #[tokio::test]
    async fn purge_drops_log_prefix_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());

        for seq in 1..=6 {
            store.commit(record(seq, seq as u32, 0, Color::BLACK)).await.unwrap();
        }
        store.purge(4).await.unwrap();

        let state = store.feed_state().await.unwrap();
        assert_eq!(state.first_seq, Some(5));
        assert_eq!(state.last_seq, Some(6));
        assert_eq!(state.last_purged, Some(4));
        assert!(store.read_log(1, 4).await.unwrap().is_empty());
        assert_eq!(store.load_cells().await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn durability() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(dir.path());
            store.commit(record(1, 4, 4, Color::BLACK)).await.unwrap();
            store.commit(record(2, 4, 4, Color::WHITE)).await.unwrap();
        }

        let store = open(dir.path());
        assert_eq!(store.feed_state().await.unwrap().last_seq, Some(2));
        let cells = store.load_cells().await.unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].color, Color::WHITE);
        // The next commit continues the sequence.
        store.commit(record(3, 5, 5, Color::BLACK)).await.unwrap();
    }
}
