use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use tess_storage::CanvasStorage;
use tess_types::{ChangeDraft, ChangeRecord, Seq, TessError};

/// Records fetched per catch-up read, from the tail or from storage.
const READ_BATCH: usize = 256;

/// Sequence number bookkeeping. Only ever locked briefly, never across an
/// `.await`.
#[derive(Debug, Default)]
struct Sequencer {
    /// Every record up to here is durable and visible to readers.
    published: Seq,
    /// Highest sequence number handed out.
    allocated: Seq,
    /// Handed out, then released by a failed storage write.
    free: BTreeSet<Seq>,
    /// Durable but waiting for a lower sequence number to be published.
    ready: BTreeMap<Seq, Arc<ChangeRecord>>,
}

impl Sequencer {
    fn reserve(&mut self, floor: Seq) -> Seq {
        if let Some(&seq) = self.free.range(floor + 1..).next() {
            self.free.remove(&seq);
            return seq;
        }
        self.allocated += 1;
        self.allocated
    }

    fn release(&mut self, seq: Seq) {
        if seq != self.allocated {
            self.free.insert(seq);
            return;
        }
        self.allocated -= 1;
        while self.allocated > self.published {
            let top = self.allocated;
            if !self.free.remove(&top) {
                break;
            }
            self.allocated -= 1;
        }
    }
}

/// Append-only, sequence-ordered stream of committed changes.
///
/// Writers reserve a sequence number, write to storage concurrently, and
/// hand the durable record back with [`ChangeFeed::publish`]. Records are
/// published strictly in sequence order: one that becomes durable early
/// waits in a reorder buffer until everything before it is durable too.
/// Readers use the in-memory `tail` (or storage, for older history) and
/// wait on `head_tx` for new records.
pub struct ChangeFeed<S> {
    storage: Arc<S>,
    sequencer: Mutex<Sequencer>,
    tail: RwLock<VecDeque<Arc<ChangeRecord>>>,
    tail_capacity: usize,
    head_tx: watch::Sender<Seq>,
}

impl<S: CanvasStorage> ChangeFeed<S> {
    /// Resume the feed from what `storage` already holds.
    ///
    /// Writes that were in flight when the process stopped can leave gaps in
    /// the retained log. Records after the first gap are renumbered so the
    /// recovered feed is contiguous again.
    pub async fn recover(storage: Arc<S>, tail_capacity: usize) -> Result<Self, TessError> {
        let state = storage.feed_state().await?;
        let retained = storage.read_log(state.resumable_from() + 1, state.head()).await?;

        let mut head = state.resumable_from();
        let mut moves = Vec::new();
        let mut records = Vec::with_capacity(retained.len());
        for mut record in retained {
            head += 1;
            if record.seq != head {
                let old = record.seq;
                record.seq = head;
                moves.push((old, record.clone()));
            }
            records.push(record);
        }
        if !moves.is_empty() {
            tracing::warn!(renumbered = moves.len(), head, "closing gaps in the change log");
            storage.renumber(moves).await?;
        }

        let skip = records.len().saturating_sub(tail_capacity);
        let tail: VecDeque<Arc<ChangeRecord>> =
            records.into_iter().skip(skip).map(Arc::new).collect();

        tracing::info!(head, tail = tail.len(), "change feed recovered");
        let (head_tx, _) = watch::channel(head);
        let sequencer = Sequencer { published: head, allocated: head, ..Default::default() };
        Ok(ChangeFeed {
            storage,
            sequencer: Mutex::new(sequencer),
            tail: RwLock::new(tail),
            tail_capacity,
            head_tx,
        })
    }

    /// Sequence number of the newest published record (0 if none).
    pub fn head(&self) -> Seq {
        *self.head_tx.borrow()
    }

    /// Follows [`ChangeFeed::head`].
    pub fn watch_head(&self) -> watch::Receiver<Seq> {
        self.head_tx.subscribe()
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Sequence `draft` above `floor` and write it to storage.
    ///
    /// Writes for different records overlap freely. On failure the sequence
    /// number is released and handed to a later write. On success the record
    /// must be passed to [`ChangeFeed::publish`]; until then nothing after it
    /// becomes visible, so callers must not let this future be dropped
    /// half-way.
    pub(crate) async fn stage(
        &self,
        draft: ChangeDraft,
        commit_ns: i64,
        floor: Seq,
    ) -> Result<ChangeRecord, TessError> {
        let seq = self.sequencer.lock().reserve(floor);
        let record = draft.sequence(seq, commit_ns);
        if let Err(e) = self.storage.commit(record.clone()).await {
            self.sequencer.lock().release(seq);
            return Err(e);
        }
        Ok(record)
    }

    /// Make a staged record visible, together with every record it was
    /// holding back.
    ///
    /// `install` runs for each record as it is published, in sequence order,
    /// before readers can see it and while [`ChangeFeed::quiesced`] is
    /// excluded.
    pub(crate) fn publish(
        &self,
        record: ChangeRecord,
        mut install: impl FnMut(&ChangeRecord),
    ) -> Arc<ChangeRecord> {
        let record = Arc::new(record);
        let mut guard = self.sequencer.lock();
        let state = &mut *guard;
        state.ready.insert(record.seq, record.clone());

        let before = state.published;
        while let Some(next) = state.ready.remove(&(state.published + 1)) {
            install(&next);
            state.published = next.seq;
            self.push_tail(next);
        }
        if state.published != before {
            self.head_tx.send_replace(state.published);
        }
        record
    }

    fn push_tail(&self, record: Arc<ChangeRecord>) {
        if self.tail_capacity == 0 {
            return;
        }
        let mut tail = self.tail.write();
        if tail.len() == self.tail_capacity {
            tail.pop_front();
        }
        tail.push_back(record);
    }

    /// Run `f` while nothing is being published, passing the current head.
    pub fn quiesced<R>(&self, f: impl FnOnce(Seq) -> R) -> R {
        let state = self.sequencer.lock();
        f(state.published)
    }

    /// Open a cursor that yields every record with `seq > after`, in order.
    ///
    /// Fails with `HistoryTruncated` when records following `after` are no
    /// longer retained, or when `after` is beyond the head.
    pub async fn subscribe_from(
        self: &Arc<Self>,
        after: Seq,
    ) -> Result<FeedCursor<S>, TessError> {
        let head = self.head();
        if after > head {
            return Err(TessError::HistoryTruncated { requested: after, earliest: head });
        }
        let in_tail = {
            let tail = self.tail.read();
            tail.front().map_or(after == head, |front| after + 1 >= front.seq)
        };
        if !in_tail {
            let state = self.storage.feed_state().await?;
            if after < state.resumable_from() {
                return Err(TessError::HistoryTruncated {
                    requested: after,
                    earliest: state.resumable_from(),
                });
            }
        }
        Ok(FeedCursor {
            feed: self.clone(),
            after,
            head_rx: self.head_tx.subscribe(),
            buffered: VecDeque::new(),
        })
    }

    /// Up to `limit` records following `after`, gap-free. Empty when `after`
    /// is the head.
    pub async fn read_after(
        &self,
        after: Seq,
        limit: usize,
    ) -> Result<Vec<Arc<ChangeRecord>>, TessError> {
        let head = self.head();
        if after > head {
            return Err(TessError::HistoryTruncated { requested: after, earliest: head });
        }
        if after == head || limit == 0 {
            return Ok(Vec::new());
        }

        let tail_first = {
            let tail = self.tail.read();
            match tail.front() {
                Some(front) if after + 1 >= front.seq => {
                    let skip = (after + 1 - front.seq) as usize;
                    return Ok(tail.iter().skip(skip).take(limit).cloned().collect());
                }
                Some(front) => Some(front.seq),
                None => None,
            }
        };

        // Older than the in-memory tail: serve from the storage log.
        let state = self.storage.feed_state().await?;
        if after < state.resumable_from() {
            return Err(TessError::HistoryTruncated {
                requested: after,
                earliest: state.resumable_from(),
            });
        }
        let upper = tail_first.map_or(head, |first| first - 1);
        let to = upper.min(after + limit as u64);
        let records = self.storage.read_log(after + 1, to).await?;

        // A purge may have raced with the read.
        let contiguous = records
            .iter()
            .zip(after + 1..)
            .all(|(rec, expected)| rec.seq == expected);
        if records.is_empty() || !contiguous {
            let state = self.storage.feed_state().await?;
            return Err(TessError::HistoryTruncated {
                requested: after,
                earliest: state.resumable_from(),
            });
        }
        Ok(records.into_iter().map(Arc::new).collect())
    }
}

/// A reader's position in a [`ChangeFeed`].
///
/// Each cursor reads at its own pace: a slow cursor only delays itself, and
/// once it falls behind the retained history it gets `HistoryTruncated`.
pub struct FeedCursor<S> {
    feed: Arc<ChangeFeed<S>>,
    after: Seq,
    head_rx: watch::Receiver<Seq>,
    buffered: VecDeque<Arc<ChangeRecord>>,
}

impl<S: CanvasStorage> FeedCursor<S> {
    /// Next record after the current position, waiting for one to be
    /// appended if necessary.
    pub async fn next(&mut self) -> Result<Arc<ChangeRecord>, TessError> {
        loop {
            if let Some(record) = self.buffered.pop_front() {
                self.after = record.seq;
                return Ok(record);
            }

            let head = *self.head_rx.borrow_and_update();
            if head > self.after {
                let batch = self.feed.read_after(self.after, READ_BATCH).await?;
                if batch.is_empty() {
                    return Err(TessError::StorageUnavailable(format!(
                        "feed head is {head} but no record follows {}",
                        self.after
                    )));
                }
                self.buffered.extend(batch);
                continue;
            }

            if self.head_rx.changed().await.is_err() {
                return Err(TessError::TransportClosed);
            }
        }
    }
}
