use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use tess_types::UserId;

use crate::clock::Clock;

/// Proof of a successful admission. Hand it back to
/// [`AdmissionController::release`] if the write it guarded did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionTicket {
    stamp_ns: i64,
    previous_ns: Option<i64>,
}

impl AdmissionTicket {
    pub fn stamp_ns(&self) -> i64 {
        self.stamp_ns
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted(AdmissionTicket),
    Denied { retry_after: Duration },
}

/// Per-user cooldown gate.
///
/// The check and the stamp happen under the same `DashMap` shard lock via
/// the `entry` API, so two racing attempts from one user can never both be
/// admitted. Different users only contend when they hash to the same shard,
/// and only for the duration of the comparison.
pub struct AdmissionController {
    cooldown: Duration,
    last_accepted: DashMap<UserId, i64>,
}

impl AdmissionController {
    pub fn new(cooldown: Duration) -> Self {
        AdmissionController { cooldown, last_accepted: DashMap::new() }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    fn cooldown_ns(&self) -> i64 {
        i64::try_from(self.cooldown.as_nanos()).unwrap_or(i64::MAX)
    }

    /// Atomically decide whether `user` may place at `now_ns`, stamping the
    /// admission if so.
    pub fn try_admit(&self, user: &UserId, now_ns: i64) -> Admission {
        let cooldown_ns = self.cooldown_ns();
        match self.last_accepted.entry(user.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(now_ns);
                Admission::Admitted(AdmissionTicket { stamp_ns: now_ns, previous_ns: None })
            }
            Entry::Occupied(mut slot) => {
                let last = *slot.get();
                let ready_at = last.saturating_add(cooldown_ns);
                if now_ns >= ready_at {
                    slot.insert(now_ns);
                    Admission::Admitted(AdmissionTicket { stamp_ns: now_ns, previous_ns: Some(last) })
                } else {
                    // A clock that stepped backwards never asks for more than one cooldown.
                    let wait_ns = (ready_at - now_ns).min(cooldown_ns);
                    Admission::Denied { retry_after: Duration::from_nanos(wait_ns as u64) }
                }
            }
        }
    }

    /// Undo an admission whose write failed. Only takes effect while the
    /// user's stamp is still the one `ticket` set.
    pub fn release(&self, user: &UserId, ticket: AdmissionTicket) -> bool {
        match self.last_accepted.entry(user.clone()) {
            Entry::Occupied(mut slot) if *slot.get() == ticket.stamp_ns => {
                match ticket.previous_ns {
                    Some(previous) => {
                        slot.insert(previous);
                    }
                    None => {
                        slot.remove();
                    }
                }
                true
            }
            _ => false,
        }
    }

    /// Remaining wait for `user` at `now_ns`, without stamping anything.
    pub fn remaining(&self, user: &UserId, now_ns: i64) -> Option<Duration> {
        let last = *self.last_accepted.get(user)?;
        let ready_at = last.saturating_add(self.cooldown_ns());
        (now_ns < ready_at).then(|| {
            Duration::from_nanos((ready_at - now_ns).min(self.cooldown_ns()) as u64)
        })
    }

    /// Forget users whose cooldown has expired. Returns how many were dropped.
    pub fn prune(&self, now_ns: i64) -> usize {
        let cooldown_ns = self.cooldown_ns();
        let before = self.last_accepted.len();
        self.last_accepted.retain(|_, last| now_ns < last.saturating_add(cooldown_ns));
        before.saturating_sub(self.last_accepted.len())
    }

    /// Number of users currently holding cooldown state.
    pub fn tracked_users(&self) -> usize {
        self.last_accepted.len()
    }

    /// Periodically prune expired cooldown state until the task is cancelled.
    pub async fn run_pruner(self: Arc<Self>, clock: Arc<dyn Clock>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let dropped = self.prune(clock.now_ns());
            if dropped > 0 {
                tracing::debug!(dropped, remaining = self.tracked_users(), "pruned cooldown state");
            }
        }
    }
}
