use tess_types::Seq;

/// Summary of the change log extent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FeedState {
    /// Smallest sequence number still in the log (`None` if the log is empty).
    pub first_seq: Option<Seq>,
    /// Largest sequence number committed (`None` before the first commit).
    /// Survives purging; only renumbering on recovery lowers it.
    pub last_seq: Option<Seq>,
    /// Largest sequence number that has been purged.
    pub last_purged: Option<Seq>,
}

impl FeedState {
    pub fn head(&self) -> Seq {
        self.last_seq.unwrap_or(0)
    }

    /// Smallest `after` for which every record `> after` is still in the log.
    pub fn resumable_from(&self) -> Seq {
        self.last_purged.unwrap_or(0)
    }

    /// Number of records currently retained.
    pub fn retained(&self) -> u64 {
        match (self.first_seq, self.last_seq) {
            (Some(first), Some(last)) if last >= first => last - first + 1,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_state() {
        let s = FeedState::default();
        assert_eq!(s.head(), 0);
        assert_eq!(s.resumable_from(), 0);
        assert_eq!(s.retained(), 0);
    }

    #[test]
    fn purged_state() {
        let s = FeedState { first_seq: Some(11), last_seq: Some(20), last_purged: Some(10) };
        assert_eq!(s.head(), 20);
        assert_eq!(s.resumable_from(), 10);
        assert_eq!(s.retained(), 10);
    }
}
