use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use tess_storage::CanvasStorage;
use tess_types::{CanvasSnapshot, ChangeRecord, Seq, TessError, UserId};

use crate::canvas::Canvas;
use crate::feed::FeedCursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Next event is a full snapshot.
    Bootstrapping,
    /// Next event is the change following `last_delivered`.
    Streaming,
    /// Transport lost; `last_delivered` is kept until [`SyncSession::resume`].
    Reconnecting,
    Closed,
}

/// What a session hands to its observer.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Replace the observer's view wholesale.
    Snapshot(Arc<CanvasSnapshot>),
    /// Apply one change on top of the current view.
    Change(Arc<ChangeRecord>),
}

impl SyncEvent {
    pub fn seq(&self) -> Seq {
        match self {
            SyncEvent::Snapshot(snap) => snap.seq,
            SyncEvent::Change(rec) => rec.seq,
        }
    }
}

/// Live sessions, keyed by session id.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<Uuid, UserId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session; it stays listed until the ticket is dropped.
    pub fn register(&self, user: UserId) -> SessionTicket {
        let id = Uuid::new_v4();
        self.sessions.insert(id, user);
        SessionTicket { id, sessions: self.sessions.clone() }
    }

    pub fn active(&self) -> usize {
        self.sessions.len()
    }
}

/// Registration held by one session.
pub struct SessionTicket {
    id: Uuid,
    sessions: Arc<DashMap<Uuid, UserId>>,
}

impl SessionTicket {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for SessionTicket {
    fn drop(&mut self) {
        self.sessions.remove(&self.id);
    }
}

/// Server-side cursor of one observer.
///
/// Holds no shared state beyond a read position: it never mutates the
/// canvas, and tearing it down at any point has no effect on other sessions.
pub struct SyncSession<S> {
    canvas: Arc<Canvas<S>>,
    user: UserId,
    ticket: Option<SessionTicket>,
    id: Uuid,
    state: SessionState,
    last_delivered: Seq,
    cursor: Option<FeedCursor<S>>,
}

impl<S: CanvasStorage> SyncSession<S> {
    /// A fresh session; the first event will be a snapshot.
    pub fn new(canvas: Arc<Canvas<S>>, user: UserId, ticket: SessionTicket) -> Self {
        let id = ticket.id();
        tracing::debug!(session = %id, user = %user, "sync session opened");
        SyncSession {
            canvas,
            user,
            ticket: Some(ticket),
            id,
            state: SessionState::Bootstrapping,
            last_delivered: 0,
            cursor: None,
        }
    }

    /// A session for an observer that already holds everything up to
    /// `last_delivered`. Falls back to a snapshot if that position is no
    /// longer resumable.
    pub async fn resuming(
        canvas: Arc<Canvas<S>>,
        user: UserId,
        ticket: SessionTicket,
        last_delivered: Seq,
    ) -> Self {
        let mut session = Self::new(canvas, user, ticket);
        session.last_delivered = last_delivered;
        session.state = SessionState::Reconnecting;
        session.resume().await;
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_delivered(&self) -> Seq {
        self.last_delivered
    }

    /// Next event for the observer, waiting for new changes if caught up.
    ///
    /// Cancel-safe at the change boundary: a change is only counted as
    /// delivered once it is returned.
    pub async fn next_event(&mut self) -> Result<SyncEvent, TessError> {
        loop {
            match self.state {
                SessionState::Bootstrapping => {
                    let snapshot = self.canvas.read_all();
                    match self.canvas.feed().subscribe_from(snapshot.seq).await {
                        Ok(cursor) => {
                            self.cursor = Some(cursor);
                            self.last_delivered = snapshot.seq;
                            self.state = SessionState::Streaming;
                            return Ok(SyncEvent::Snapshot(Arc::new(snapshot)));
                        }
                        Err(TessError::HistoryTruncated { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
                SessionState::Streaming => {
                    let Some(cursor) = self.cursor.as_mut() else {
                        self.state = SessionState::Bootstrapping;
                        continue;
                    };
                    match cursor.next().await {
                        Ok(record) => {
                            self.last_delivered = record.seq;
                            return Ok(SyncEvent::Change(record));
                        }
                        Err(TessError::HistoryTruncated { requested, earliest }) => {
                            tracing::warn!(
                                session = %self.id,
                                requested,
                                earliest,
                                "session fell behind retained history, resyncing"
                            );
                            self.cursor = None;
                            self.state = SessionState::Bootstrapping;
                        }
                        Err(e) => return Err(e),
                    }
                }
                SessionState::Reconnecting | SessionState::Closed => {
                    return Err(TessError::TransportClosed);
                }
            }
        }
    }

    /// Transport lost: drop the feed cursor but remember the position.
    pub fn disconnect(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.cursor = None;
        self.state = SessionState::Reconnecting;
    }

    /// Re-attach after [`SyncSession::disconnect`], continuing strictly after
    /// the last delivered change, or via a fresh snapshot if that is no
    /// longer possible.
    pub async fn resume(&mut self) -> SessionState {
        if self.state != SessionState::Reconnecting {
            return self.state;
        }
        match self.canvas.feed().subscribe_from(self.last_delivered).await {
            Ok(cursor) => {
                self.cursor = Some(cursor);
                self.state = SessionState::Streaming;
            }
            Err(e) => {
                tracing::debug!(
                    session = %self.id,
                    last_delivered = self.last_delivered,
                    error = %e,
                    "resume not possible, resyncing from snapshot"
                );
                self.state = SessionState::Bootstrapping;
            }
        }
        self.state
    }

    /// Terminal. Releases the cursor and the registry entry.
    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            tracing::debug!(session = %self.id, last_delivered = self.last_delivered, "sync session closed");
        }
        self.cursor = None;
        self.ticket = None;
        self.state = SessionState::Closed;
    }
}
