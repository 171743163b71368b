use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;

use tess_storage::CanvasStorage;
use tess_types::{CanvasSnapshot, Cell, ChangeDraft, ChangeRecord, Color, Coord, TessError, UserId};

use crate::clock::Clock;
use crate::feed::ChangeFeed;

/// One grid position.
///
/// `turn` orders commits to this cell (tokio's mutex is FIFO, so the order
/// writers queue up is the order their colors are applied). `latest` is the
/// newest durable state; `published` trails it until the feed head reaches
/// that write. Neither is locked across an `.await`.
struct CellSlot {
    turn: Mutex<()>,
    latest: RwLock<Cell>,
    published: RwLock<Cell>,
}

/// Authoritative canvas state.
///
/// There is no lock spanning the grid: each cell has its own commit turn,
/// storage writes for different cells run concurrently, and the change feed
/// only serializes the moment a sequence number is handed out.
pub struct Canvas<S> {
    size: u32,
    slots: Vec<CellSlot>,
    feed: Arc<ChangeFeed<S>>,
    clock: Arc<dyn Clock>,
}

impl<S: CanvasStorage> Canvas<S> {
    /// Load the canvas from `storage`. Cells never written start blank.
    pub async fn open(
        storage: Arc<S>,
        size: u32,
        tail_capacity: usize,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TessError> {
        if size == 0 {
            return Err(TessError::InvalidArgument("canvas size must be positive".into()));
        }
        let feed = Arc::new(ChangeFeed::recover(storage.clone(), tail_capacity).await?);

        let cell_count = size as usize * size as usize;
        let mut cells: Vec<Cell> =
            (0..cell_count).map(|i| Cell::blank(Coord::from_index(i, size))).collect();
        let stored = storage.load_cells().await?;
        let painted = stored.len();
        for cell in stored {
            if cell.coord.x >= size || cell.coord.y >= size {
                return Err(TessError::InvalidArgument(format!(
                    "stored cell {} lies outside a canvas of size {size}",
                    cell.coord
                )));
            }
            let idx = cell.coord.index(size);
            cells[idx] = cell;
        }

        let slots = cells
            .into_iter()
            .map(|cell| CellSlot {
                turn: Mutex::new(()),
                latest: RwLock::new(cell.clone()),
                published: RwLock::new(cell),
            })
            .collect();

        tracing::info!(size, painted, head = feed.head(), "canvas opened");
        Ok(Canvas { size, slots, feed, clock })
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn feed(&self) -> &Arc<ChangeFeed<S>> {
        &self.feed
    }

    /// Validate raw coordinates.
    pub fn locate(&self, x: i64, y: i64) -> Result<Coord, TessError> {
        Coord::checked(x, y, self.size)
    }

    fn slot_index(&self, coord: Coord) -> Result<usize, TessError> {
        if coord.x >= self.size || coord.y >= self.size {
            return Err(TessError::OutOfRange {
                x: i64::from(coord.x),
                y: i64::from(coord.y),
                size: self.size,
            });
        }
        Ok(coord.index(self.size))
    }

    /// Current state of one cell, including writes the feed has not
    /// published yet.
    pub fn read(&self, coord: Coord) -> Result<Cell, TessError> {
        Ok(self.slots[self.slot_index(coord)?].latest.read().clone())
    }

    /// Consistent point-in-time copy of every cell plus the feed head it
    /// corresponds to: exactly the records up to `seq` are applied.
    pub fn read_all(&self) -> CanvasSnapshot {
        self.feed.quiesced(|seq| CanvasSnapshot {
            size: self.size,
            seq,
            cells: self.slots.iter().map(|slot| slot.published.read().clone()).collect(),
        })
    }

    /// Write `color` to `coord` on behalf of `writer`.
    ///
    /// Concurrent commits to the same cell are applied one after another in
    /// the order they acquired the cell; none is rejected or dropped. The
    /// write runs on its own task, so dropping the returned future does not
    /// interrupt it: the cell and the change feed still advance together.
    pub async fn commit(
        self: &Arc<Self>,
        coord: Coord,
        color: Color,
        writer: UserId,
    ) -> Result<Arc<ChangeRecord>, TessError> {
        let idx = self.slot_index(coord)?;
        let canvas = self.clone();
        let draft = ChangeDraft { coord, color, writer };
        tokio::spawn(async move { canvas.commit_in_turn(idx, draft).await })
            .await
            .map_err(|e| TessError::StorageUnavailable(format!("commit task failed: {e}")))?
    }

    async fn commit_in_turn(
        &self,
        idx: usize,
        draft: ChangeDraft,
    ) -> Result<Arc<ChangeRecord>, TessError> {
        let slot = &self.slots[idx];
        let _turn = slot.turn.lock().await;

        let floor = slot.latest.read().seq;
        let record = self.feed.stage(draft, self.clock.now_ns(), floor).await?;
        *slot.latest.write() = Cell::from(&record);
        Ok(self.feed.publish(record, |published| {
            let slot = &self.slots[published.coord.index(self.size)];
            *slot.published.write() = Cell::from(published);
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;
    use crate::clock::ManualClock;
    use tess_storage::{FeedState, MemCanvasStorage};
    use tess_types::Seq;

    const RED: Color = Color::from_rgb(0xFF, 0, 0);
    const BLUE: Color = Color::from_rgb(0, 0, 0xFF);

    async fn canvas(size: u32) -> Arc<Canvas<MemCanvasStorage>> {
        Arc::new(
            Canvas::open(Arc::new(MemCanvasStorage::new()), size, 64, Arc::new(ManualClock::new(0)))
                .await
                .unwrap(),
        )
    }

    /// Holds storage writes to one cell until the gate is opened.
    struct GatedStorage {
        inner: MemCanvasStorage,
        gated: Coord,
        entered: Notify,
        release: Notify,
        open: AtomicBool,
    }

    impl GatedStorage {
        fn open_gate(&self) {
            self.open.store(true, Ordering::SeqCst);
            self.release.notify_one();
        }
    }

    impl CanvasStorage for GatedStorage {
        async fn feed_state(&self) -> Result<FeedState, TessError> {
            self.inner.feed_state().await
        }

        async fn commit(&self, record: ChangeRecord) -> Result<(), TessError> {
            if record.coord == self.gated && !self.open.load(Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.commit(record).await
        }

        async fn renumber(&self, moves: Vec<(Seq, ChangeRecord)>) -> Result<(), TessError> {
            self.inner.renumber(moves).await
        }

        async fn load_cells(&self) -> Result<Vec<Cell>, TessError> {
            self.inner.load_cells().await
        }

        async fn read_log(&self, from: Seq, to: Seq) -> Result<Vec<ChangeRecord>, TessError> {
            self.inner.read_log(from, to).await
        }

        async fn purge(&self, up_to: Seq) -> Result<(), TessError> {
            self.inner.purge(up_to).await
        }
    }

    async fn gated_canvas(gated: Coord) -> (Arc<GatedStorage>, Arc<Canvas<GatedStorage>>) {
        let storage = Arc::new(GatedStorage {
            inner: MemCanvasStorage::new(),
            gated,
            entered: Notify::new(),
            release: Notify::new(),
            open: AtomicBool::new(false),
        });
        let canvas = Canvas::open(storage.clone(), 4, 64, Arc::new(ManualClock::new(0)))
            .await
            .unwrap();
        (storage, Arc::new(canvas))
    }

    #[tokio::test]
    async fn blank_canvas_reads_white() {
        let c = canvas(4).await;
        let cell = c.read(Coord::new(3, 3)).unwrap();
        assert_eq!(cell.color, Color::BLANK);
        assert_eq!(cell.seq, 0);
        assert!(cell.last_writer.is_none());
    }

    #[tokio::test]
    async fn out_of_range_is_rejected() {
        let c = canvas(4).await;
        assert!(matches!(
            c.read(Coord::new(4, 0)),
            Err(TessError::OutOfRange { x: 4, y: 0, size: 4 })
        ));
        assert!(matches!(
            c.commit(Coord::new(0, 9), RED, "a".into()).await,
            Err(TessError::OutOfRange { .. })
        ));
        assert!(c.locate(-1, 0).is_err());
        assert_eq!(c.feed().head(), 0);
    }

    #[tokio::test]
    async fn commit_updates_cell_and_feed() {
        let c = canvas(8).await;
        let rec = c.commit(Coord::new(2, 5), RED, "alice".into()).await.unwrap();
        assert_eq!(rec.seq, 1);

        let cell = c.read(Coord::new(2, 5)).unwrap();
        assert_eq!(cell.color, RED);
        assert_eq!(cell.seq, 1);
        assert_eq!(cell.last_writer, Some("alice".into()));

        let snap = c.read_all();
        assert_eq!(snap.seq, 1);
        assert_eq!(snap.cells.len(), 64);
        assert_eq!(snap.cell(Coord::new(2, 5)).unwrap().color, RED);
    }

    #[tokio::test]
    async fn reopen_restores_cells() {
        let storage = Arc::new(MemCanvasStorage::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        {
            let c = Arc::new(Canvas::open(storage.clone(), 4, 8, clock.clone()).await.unwrap());
            c.commit(Coord::new(1, 1), BLUE, "bob".into()).await.unwrap();
        }
        let c = Canvas::open(storage.clone(), 4, 8, clock.clone()).await.unwrap();
        assert_eq!(c.read(Coord::new(1, 1)).unwrap().color, BLUE);
        assert_eq!(c.read_all().cell(Coord::new(1, 1)).unwrap().color, BLUE);
        assert_eq!(c.feed().head(), 1);

        // A smaller canvas cannot hold what was stored.
        assert!(matches!(
            Canvas::open(storage, 1, 8, clock).await,
            Err(TessError::InvalidArgument(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn same_cell_writes_are_all_recorded_in_order() {
        let c = canvas(4).await;
        let target = Coord::new(0, 0);

        let handles: Vec<_> = (0u8..64)
            .map(|i| {
                let c = c.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(rand::random::<u64>() % 20)).await;
                    c.commit(target, Color::from_rgb(i, i, i), format!("u{i}").into()).await
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let records = c.feed().read_after(0, 64).await.unwrap();
        let writers: HashMap<_, _> = records.iter().map(|r| (r.writer.clone(), r.seq)).collect();
        assert_eq!(writers.len(), 64);
        let last = records.last().unwrap();
        let cell = c.read(target).unwrap();
        assert_eq!(cell.color, last.color);
        assert_eq!(cell.seq, 64);
        assert_eq!(c.read_all().cell(target).unwrap().seq, 64);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stalled_write_does_not_hold_up_other_cells() {
        let (storage, c) = gated_canvas(Coord::new(0, 0)).await;
        let stalled = {
            let c = c.clone();
            tokio::spawn(async move { c.commit(Coord::new(0, 0), RED, "slow".into()).await })
        };
        storage.entered.notified().await;

        let other = tokio::time::timeout(
            Duration::from_secs(1),
            c.commit(Coord::new(3, 3), BLUE, "fast".into()),
        )
        .await
        .expect("a write to another cell should not wait for the stalled one")
        .unwrap();
        assert_eq!(other.seq, 2);
        assert_eq!(c.read(Coord::new(3, 3)).unwrap().color, BLUE);

        let reader = c.clone();
        let snap = tokio::time::timeout(
            Duration::from_secs(1),
            tokio::task::spawn_blocking(move || reader.read_all()),
        )
        .await
        .expect("snapshot should not wait for storage")
        .unwrap();
        // Seq 2 is durable but held back behind seq 1.
        assert_eq!(snap.seq, 0);
        assert_eq!(snap.cell(Coord::new(3, 3)).unwrap().color, Color::BLANK);
        assert_eq!(c.feed().head(), 0);

        storage.open_gate();
        assert_eq!(stalled.await.unwrap().unwrap().seq, 1);
        let snap = c.read_all();
        assert_eq!(snap.seq, 2);
        assert_eq!(snap.cell(Coord::new(0, 0)).unwrap().color, RED);
        assert_eq!(snap.cell(Coord::new(3, 3)).unwrap().color, BLUE);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn abandoned_commit_still_completes() {
        let (storage, c) = gated_canvas(Coord::new(0, 0)).await;
        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            c.commit(Coord::new(0, 0), RED, "gone".into()),
        )
        .await;
        assert!(abandoned.is_err());

        storage.entered.notified().await;
        storage.open_gate();
        let mut head = c.feed().watch_head();
        tokio::time::timeout(Duration::from_secs(5), head.wait_for(|&h| h == 1))
            .await
            .expect("the detached write should publish")
            .unwrap();
        assert_eq!(c.read(Coord::new(0, 0)).unwrap().color, RED);

        let next = c.commit(Coord::new(0, 0), BLUE, "next".into()).await.unwrap();
        assert_eq!(next.seq, 2);
        let snap = c.read_all();
        assert_eq!(snap.seq, 2);
        assert_eq!(snap.cell(Coord::new(0, 0)).unwrap().color, BLUE);
        assert_eq!(storage.feed_state().await.unwrap().last_seq, Some(2));
    }
}
