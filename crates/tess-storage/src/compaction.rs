use std::sync::Arc;
use std::time::Duration;

use tess_types::{Seq, TessError};
use tokio::sync::watch;

use crate::traits::CanvasStorage;

/// Keeps the change log bounded by purging its oldest records.
///
/// Resume requests older than the purge point are answered with
/// `HistoryTruncated`; those sessions resynchronize from a snapshot.
pub struct LogCompactionTask<S> {
    storage: Arc<S>,
    max_log_entries: u64,
    interval: Duration,
    ceiling: Option<watch::Receiver<Seq>>,
}

impl<S: CanvasStorage> LogCompactionTask<S> {
    pub fn new(storage: Arc<S>, max_log_entries: u64, interval: Duration) -> Self {
        LogCompactionTask { storage, max_log_entries, interval, ceiling: None }
    }

    /// Never purge past the value last sent on `ceiling`.
    ///
    /// The log may hold records above the published feed head while an
    /// earlier sequence number is still being written; purging past the head
    /// would drop the gap before it is filled.
    pub fn with_ceiling(mut self, ceiling: watch::Receiver<Seq>) -> Self {
        self.ceiling = Some(ceiling);
        self
    }

    /// Run one compaction pass. Returns the new purge point if anything was
    /// purged.
    pub async fn compact_once(&self) -> Result<Option<Seq>, TessError> {
        let state = self.storage.feed_state().await?;
        if state.retained() <= self.max_log_entries {
            return Ok(None);
        }
        let mut up_to = state.head() - self.max_log_entries;
        if let Some(ceiling) = &self.ceiling {
            up_to = up_to.min(*ceiling.borrow());
        }
        if up_to <= state.resumable_from() {
            return Ok(None);
        }
        self.storage.purge(up_to).await?;
        Ok(Some(up_to))
    }

    /// Run the compaction loop until the task is cancelled.
    ///
    /// Storage errors are logged and retried on the next tick.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.compact_once().await {
                Ok(Some(up_to)) => tracing::debug!(up_to, "change log compacted"),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "change log compaction failed"),
            }
        }
    }
}
