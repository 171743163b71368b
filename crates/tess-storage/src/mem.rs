use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use tess_types::{Cell, ChangeRecord, Coord, Seq, TessError};

use crate::traits::CanvasStorage;
use crate::types::FeedState;

struct MemInner {
    cells: BTreeMap<Coord, Cell>,
    log: BTreeMap<Seq, ChangeRecord>,
    last_seq: Option<Seq>,
    last_purged: Option<Seq>,
}

/// In-memory `CanvasStorage` backed by `BTreeMap`s.
///
/// Used by tests and by ephemeral deployments; nothing survives a restart.
pub struct MemCanvasStorage {
    inner: Arc<RwLock<MemInner>>,
}

impl MemCanvasStorage {
    pub fn new() -> Self {
        MemCanvasStorage {
            inner: Arc::new(RwLock::new(MemInner {
                cells: BTreeMap::new(),
                log: BTreeMap::new(),
                last_seq: None,
                last_purged: None,
            })),
        }
    }
}

impl Default for MemCanvasStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl CanvasStorage for MemCanvasStorage {
    async fn feed_state(&self) -> Result<FeedState, TessError> {
        let g = self.inner.read().await;
        Ok(FeedState {
            first_seq: g.log.keys().next().copied(),
            last_seq: g.last_seq,
            last_purged: g.last_purged,
        })
    }

    async fn commit(&self, record: ChangeRecord) -> Result<(), TessError> {
        let mut g = self.inner.write().await;
        if g.log.contains_key(&record.seq) {
            return Err(TessError::InvalidArgument(format!(
                "seq {} is already committed",
                record.seq
            )));
        }
        if let Some(cell) = g.cells.get(&record.coord).filter(|c| c.seq >= record.seq) {
            return Err(TessError::InvalidArgument(format!(
                "stale write to {}: cell is at seq {}, got {}",
                record.coord, cell.seq, record.seq
            )));
        }
        g.cells.insert(record.coord, Cell::from(&record));
        g.last_seq = Some(g.last_seq.map_or(record.seq, |s| s.max(record.seq)));
        g.log.insert(record.seq, record);
        Ok(())
    }

    async fn renumber(&self, moves: Vec<(Seq, ChangeRecord)>) -> Result<(), TessError> {
        let Some(high) = moves.iter().map(|(_, r)| r.seq).max() else {
            return Ok(());
        };
        let mut g = self.inner.write().await;
        let rewrites: Vec<bool> = moves
            .iter()
            .map(|(old, r)| g.cells.get(&r.coord).is_some_and(|c| c.seq == *old))
            .collect();
        for (old, _) in &moves {
            g.log.remove(old);
        }
        for ((_, record), rewrite) in moves.into_iter().zip(rewrites) {
            if rewrite {
                g.cells.insert(record.coord, Cell::from(&record));
            }
            g.log.insert(record.seq, record);
        }
        g.last_seq = Some(high);
        Ok(())
    }

    async fn load_cells(&self) -> Result<Vec<Cell>, TessError> {
        Ok(self.inner.read().await.cells.values().cloned().collect())
    }

    async fn read_log(&self, from: Seq, to_inclusive: Seq) -> Result<Vec<ChangeRecord>, TessError> {
        if from > to_inclusive {
            return Ok(Vec::new());
        }
        let g = self.inner.read().await;
        Ok(g.log.range(from..=to_inclusive).map(|(_, r)| r.clone()).collect())
    }

    async fn purge(&self, up_to: Seq) -> Result<(), TessError> {
        let mut g = self.inner.write().await;
        g.log.retain(|&seq, _| seq > up_to);
        g.last_purged = Some(g.last_purged.map_or(up_to, |p| p.max(up_to)));
        Ok(())
    }
}
