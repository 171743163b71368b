use std::future::Future;

use tess_types::{Cell, ChangeRecord, Seq, TessError};

use crate::types::FeedState;

/// Durable home of the canvas cells and of the sequence-ordered change log.
///
/// Methods use RPITIT (`-> impl Future + Send`) so that generic callers in
/// `tess-core` can `.await` across threads without an `async-trait`
/// dependency.
///
/// Commits for different cells may arrive concurrently and out of sequence
/// order; the change feed decides the numbering and publishes in order.
/// Implementations only have to make each commit atomic and refuse writes
/// that would move a cell backwards.
pub trait CanvasStorage: Send + Sync + 'static {
    /// First and highest sequence numbers present in the change log, plus
    /// the purge point.
    fn feed_state(&self) -> impl Future<Output = Result<FeedState, TessError>> + Send;

    /// Upsert the cell addressed by `record.coord`, append `record` to the
    /// change log and raise the stored high-water mark, all in one atomic
    /// write. On error nothing is visible.
    ///
    /// Fails with `InvalidArgument` if `record.seq` is already logged or is
    /// not newer than the cell's current state.
    fn commit(&self, record: ChangeRecord)
        -> impl Future<Output = Result<(), TessError>> + Send;

    /// Move logged records to new sequence numbers in one atomic write.
    ///
    /// Each `(old, record)` removes the entry at `old` and logs `record` at
    /// `record.seq`; a cell whose state came from `old` is rewritten from
    /// `record`. The high-water mark becomes the largest new sequence number.
    fn renumber(&self, moves: Vec<(Seq, ChangeRecord)>)
        -> impl Future<Output = Result<(), TessError>> + Send;

    /// Every cell that has been written at least once.
    fn load_cells(&self) -> impl Future<Output = Result<Vec<Cell>, TessError>> + Send;

    /// All change records in the inclusive range `[from, to_inclusive]` that
    /// are still retained, in sequence order.
    fn read_log(&self, from: Seq, to_inclusive: Seq)
        -> impl Future<Output = Result<Vec<ChangeRecord>, TessError>> + Send;

    /// Delete all change records with `seq <= up_to` and remember `up_to`
    /// as the purge point. Cells are untouched.
    fn purge(&self, up_to: Seq) -> impl Future<Output = Result<(), TessError>> + Send;
}
