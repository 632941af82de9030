//! Leveled compaction core.
//!
//! Architecture:
//! ```text
//!   flush/stream events ──► Manifest (L0 .. Ln bookkeeping)
//!                               │  compaction_candidates()
//!                               ▼
//!                        LeveledStrategy (single task slot)
//!                               │
//!                               ▼
//!                        CompactionTask ──► LeveledScanner(s) ──► merge
//!                               │                                   │
//!                               └────── promote(removed, added) ◄───┘
//! ```
//!
//! Key properties:
//! - L1+ levels hold pairwise non-overlapping sstables; L0 makes no such
//!   guarantee (freshly flushed tables land there).
//! - At most one compaction task per strategy instance is in flight; repeated
//!   candidate queries while a task runs never hand out overlapping work.
//! - A failed compaction leaves its inputs in place and discards partial
//!   outputs.

pub mod compaction;
pub mod manifest;
pub mod metadata;
pub mod scanner;
pub mod sst;
pub mod store;

pub use compaction::{
    CompactionConfig, CompactionMetricsSnapshot, CompactionResult, CompactionTask, LeveledStrategy,
};
pub use manifest::Manifest;
pub use metadata::{HistogramBucket, SstableStats};
pub use scanner::{LeveledScanner, MergingRowIterator};
pub use sst::{
    sstable_from_rows, sstable_with_source, Row, RowScanner, Sstable, SstableBuilder, SstableId,
    SstableSource, UNPLACED_LEVEL,
};
pub use store::TableStore;
