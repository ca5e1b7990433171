//! Feed-driven synchronization into the records store.
//!
//! Data flows leaf-first:
//!
//! - **Decode**: raw feed entry → [`ChangeRecord`](crate::model::ChangeRecord)
//! - **Map**: source snapshot → target row fields
//! - **Orchestrate**: change + current row → one atomic write
//! - **Run**: feed window → outcomes → cursor advance, retries, quarantine
//!
//! # Example
//!
//! ```ignore
//! use trs_sync::sync::{BatchRunner, JsonlFeed, SqliteCursorStore, SyncOptions};
//!
//! let feed = JsonlFeed::new(feed_dir);
//! let cursors = SqliteCursorStore::open(&db_path, "worker-1")?;
//! let mut runner = BatchRunner::new(&feed, &mut storage, &cursors, SyncOptions::default());
//! let result = runner.run_until_idle(EntityType::Contact, None)?;
//! ```

pub mod cursor;
pub mod decode;
pub mod feed;
pub mod hash;
pub mod mapper;
pub mod orchestrator;
pub mod replay;
pub mod repository;
pub mod runner;
pub mod status;
pub mod types;

pub use cursor::{CursorLocks, CursorStore, MemoryCursorStore, SqliteCursorStore};
pub use decode::decode;
pub use feed::{FeedPage, FeedSource, JsonlFeed, MemoryFeed, RawFeedEntry};
pub use hash::{content_hash, has_changed, row_hash};
pub use mapper::{map, Mapped, MappingError};
pub use orchestrator::{plan, Clock, FixedClock, Orchestrator, SystemClock, Transition};
pub use replay::{replay_quarantined, ReplayReport};
pub use repository::{RetryLedger, SyncStateRepository};
pub use runner::{BatchRunner, CancellationToken};
pub use status::{get_sync_status, print_status, EntityStatus, SyncStatus};
pub use types::{
    ApplyOutcome, BatchResult, FeedCursor, QuarantineEntry, RetryPolicy, StopReason, SyncError,
    SyncOptions, SyncResult,
};
