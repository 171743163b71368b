pub mod admission;
pub mod board;
pub mod canvas;
pub mod clock;
pub mod feed;
pub mod session;

pub use admission::{Admission, AdmissionController, AdmissionTicket};
pub use board::{Board, BoardConfig, BoardStatus};
pub use canvas::Canvas;
pub use clock::{Clock, ManualClock, SystemClock};
pub use feed::{ChangeFeed, FeedCursor};
pub use session::{SessionRegistry, SessionState, SessionTicket, SyncEvent, SyncSession};
