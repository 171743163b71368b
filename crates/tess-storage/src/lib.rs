pub mod compaction;
pub mod fjall;
pub mod keys;
pub mod mem;
pub mod traits;
pub mod types;

pub use compaction::LogCompactionTask;
pub use fjall::{FjallCanvasStorage, FjallStore};
pub use mem::MemCanvasStorage;
pub use traits::CanvasStorage;
pub use types::FeedState;
