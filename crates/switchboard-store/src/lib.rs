//! # switchboard-store
//!
//! Durable storage for the agent host: append-only segmented JSONL history,
//! an append-only event journal, and an active/completed task store. All
//! index and state files are written atomically (temp file + rename) so an
//! abrupt process death leaves the store recoverable.

pub mod fsutil;
pub mod history;
pub mod journal;
pub mod migrate;
pub mod tasks;

pub use history::{HistoryAppend, HistoryEntry, HistoryStore, SegmentIndex, SegmentMeta};
pub use journal::{Journal, JournalEntry, JournalEvent};
pub use tasks::{PersistedTask, TaskPhase, TaskStore};
