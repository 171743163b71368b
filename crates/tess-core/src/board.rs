use std::sync::Arc;
use std::time::Duration;

use tess_storage::CanvasStorage;
use tess_types::{CanvasSnapshot, Cell, ChangeRecord, Color, Seq, TessError, UserId};

use crate::admission::{Admission, AdmissionController};
use crate::canvas::Canvas;
use crate::clock::Clock;
use crate::session::{SessionRegistry, SyncSession};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardConfig {
    /// Side length of the square canvas.
    pub size: u32,
    pub cooldown: Duration,
    /// Accepted colors. Empty accepts any RGB value.
    pub palette: Vec<Color>,
    /// Change records kept in memory for catch-up.
    pub tail_capacity: usize,
}

impl BoardConfig {
    pub fn default_palette() -> Vec<Color> {
        [
            0xFF0000, 0xFF7F00, 0xFFFF00, 0x00FF00, 0x0000FF, 0x4B0082, 0x8A2BE2, 0xFF1493,
            0xFFD700, 0x32CD32, 0xFFFFFF, 0x000000,
        ]
        .into_iter()
        .filter_map(|raw| Color::from_u32(raw).ok())
        .collect()
    }
}

impl Default for BoardConfig {
    fn default() -> Self {
        BoardConfig {
            size: 50,
            cooldown: Duration::from_secs(300),
            palette: Self::default_palette(),
            tail_capacity: 4096,
        }
    }
}

/// What clients need to know to draw and to pace themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardStatus {
    pub size: u32,
    pub head_seq: Seq,
    pub cooldown: Duration,
    pub palette: Vec<Color>,
    pub active_sessions: usize,
}

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------

/// The placement and subscription entry points, wired together.
pub struct Board<S> {
    canvas: Arc<Canvas<S>>,
    admission: Arc<AdmissionController>,
    clock: Arc<dyn Clock>,
    palette: Vec<Color>,
    sessions: SessionRegistry,
}

impl<S: CanvasStorage> Board<S> {
    pub async fn open(
        storage: Arc<S>,
        config: BoardConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TessError> {
        let canvas =
            Canvas::open(storage, config.size, config.tail_capacity, clock.clone()).await?;
        tracing::info!(
            size = config.size,
            cooldown_secs = config.cooldown.as_secs(),
            palette = config.palette.len(),
            "board ready"
        );
        Ok(Board {
            canvas: Arc::new(canvas),
            admission: Arc::new(AdmissionController::new(config.cooldown)),
            clock,
            palette: config.palette,
            sessions: SessionRegistry::new(),
        })
    }

    pub fn canvas(&self) -> &Arc<Canvas<S>> {
        &self.canvas
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    fn check_palette(&self, color: Color) -> Result<(), TessError> {
        if self.palette.is_empty() || self.palette.contains(&color) {
            Ok(())
        } else {
            Err(TessError::InvalidColor(format!("{color} is not in the palette")))
        }
    }

    /// Paint one pixel for `user`.
    ///
    /// Range and palette errors are reported before the cooldown is looked
    /// at, so they never cost the user a placement. A cooldown denial comes
    /// back as [`TessError::CooldownActive`].
    pub async fn place_pixel(
        &self,
        user: &UserId,
        x: i64,
        y: i64,
        color: Color,
    ) -> Result<Arc<ChangeRecord>, TessError> {
        let coord = self.canvas.locate(x, y)?;
        self.check_palette(color)?;

        let ticket = match self.admission.try_admit(user, self.clock.now_ns()) {
            Admission::Admitted(ticket) => ticket,
            Admission::Denied { retry_after } => {
                tracing::debug!(
                    user = %user,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "placement denied by cooldown"
                );
                return Err(TessError::CooldownActive { retry_after });
            }
        };

        match self.canvas.commit(coord, color, user.clone()).await {
            Ok(record) => {
                tracing::debug!(user = %user, seq = record.seq, %coord, %color, "pixel placed");
                Ok(record)
            }
            Err(e) => {
                let released = self.admission.release(user, ticket);
                tracing::warn!(user = %user, %coord, error = %e, released, "placement failed");
                Err(e)
            }
        }
    }

    pub fn read_cell(&self, x: i64, y: i64) -> Result<Cell, TessError> {
        self.canvas.read(self.canvas.locate(x, y)?)
    }

    pub fn snapshot(&self) -> CanvasSnapshot {
        self.canvas.read_all()
    }

    /// Remaining cooldown for `user`, if any.
    pub fn cooldown_remaining(&self, user: &UserId) -> Option<Duration> {
        self.admission.remaining(user, self.clock.now_ns())
    }

    /// A new session whose first event is a full snapshot.
    pub fn open_session(&self, user: UserId) -> SyncSession<S> {
        let ticket = self.sessions.register(user.clone());
        SyncSession::new(self.canvas.clone(), user, ticket)
    }

    /// A session continuing strictly after `last_seq`, or from a fresh
    /// snapshot if that position is not resumable.
    pub async fn resume_session(&self, user: UserId, last_seq: Seq) -> SyncSession<S> {
        let ticket = self.sessions.register(user.clone());
        SyncSession::resuming(self.canvas.clone(), user, ticket, last_seq).await
    }

    pub fn status(&self) -> BoardStatus {
        BoardStatus {
            size: self.canvas.size(),
            head_seq: self.canvas.feed().head(),
            cooldown: self.admission.cooldown(),
            palette: self.palette.clone(),
            active_sessions: self.sessions.active(),
        }
    }
}
