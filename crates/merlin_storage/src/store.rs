//! Per-table façade over the compaction core.
//!
//! A `TableStore` is what the repair side talks to: it owns the table's
//! leveled strategy, answers key-sample queries for Merkle splitting, and
//! produces the ordered row stream a validation (read-only) compaction
//! consumes. Snapshots are recorded as named tags; actual file hard-linking
//! belongs to the table format.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use merlin_common::{DecoratedKey, Range, StorageError};

use crate::compaction::{CompactionConfig, LeveledStrategy};
use crate::manifest::Manifest;
use crate::scanner::MergingRowIterator;
use crate::sst::Sstable;

/// Default tombstone grace period: ten days, in seconds.
const DEFAULT_GC_GRACE_SECONDS: i64 = 864_000;

/// Sampling stride for `key_samples`; every Nth key in range is reported.
const KEY_SAMPLE_STRIDE: usize = 8;

pub struct TableStore {
    pub keyspace: String,
    pub table: String,
    gc_grace_seconds: i64,
    strategy: Arc<LeveledStrategy>,
    snapshots: Mutex<Vec<String>>,
}

impl TableStore {
    pub fn new(keyspace: impl Into<String>, table: impl Into<String>, config: CompactionConfig) -> TableStore {
        TableStore {
            keyspace: keyspace.into(),
            table: table.into(),
            gc_grace_seconds: DEFAULT_GC_GRACE_SECONDS,
            strategy: Arc::new(LeveledStrategy::new(config)),
            snapshots: Mutex::new(Vec::new()),
        }
    }

    pub fn with_gc_grace(mut self, gc_grace_seconds: i64) -> TableStore {
        self.gc_grace_seconds = gc_grace_seconds;
        self
    }

    pub fn gc_grace_seconds(&self) -> i64 {
        self.gc_grace_seconds
    }

    pub fn strategy(&self) -> &Arc<LeveledStrategy> {
        &self.strategy
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        self.strategy.manifest()
    }

    /// Introduce a flushed or streamed-in sstable.
    pub fn add_sstable(&self, sstable: Arc<Sstable>) {
        self.manifest().add(sstable);
    }

    /// Sampled keys within `range`, ascending, from every sstable's index.
    /// Used by the validator to pick Merkle split points.
    pub fn key_samples(&self, range: &Range) -> Result<Vec<DecoratedKey>, StorageError> {
        let mut samples = Vec::new();
        let mut seen = HashSet::new();
        for level in 0..self.strategy.config().max_levels {
            for sstable in self.manifest().level(level) {
                let mut scanner = sstable.scan(Some(*range))?;
                let mut index = 0usize;
                while let Some(row) = scanner.next_row()? {
                    if index % KEY_SAMPLE_STRIDE == 0 && seen.insert(row.key.clone()) {
                        samples.push(row.key);
                    }
                    index += 1;
                }
                scanner.close()?;
            }
        }
        samples.sort();
        Ok(samples)
    }

    /// Ordered, reconciled row stream over every sstable in `range` — the
    /// read-only compaction backing tree validation.
    pub fn validation_scan(&self, range: &Range) -> Result<MergingRowIterator, StorageError> {
        let mut all = Vec::new();
        for level in 0..self.strategy.config().max_levels {
            all.extend(self.manifest().level(level));
        }
        let scanners = self.strategy.scanners(&all, Some(*range));
        Ok(MergingRowIterator::new(scanners))
    }

    /// Record a snapshot tag. The `ephemeral` flag is carried through from
    /// the snapshot command; its full meaning is owned by the table format.
    pub fn snapshot(&self, tag: &str, ephemeral: bool) {
        debug!(keyspace = %self.keyspace, table = %self.table, tag, ephemeral, "snapshot");
        self.snapshots.lock().push(tag.to_string());
    }

    pub fn snapshot_tags(&self) -> Vec<String> {
        self.snapshots.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sst::{sstable_from_rows, Row};
    use merlin_common::Token;

    fn dk(t: u128) -> DecoratedKey {
        DecoratedKey::new(Token(t), t.to_be_bytes().to_vec())
    }

    fn store_with_rows(tokens: &[u128]) -> TableStore {
        let store = TableStore::new("ks1", "events", CompactionConfig::default());
        let rows = tokens.iter().map(|&t| Row::live(dk(t), 1, b"v".to_vec())).collect();
        store.add_sstable(sstable_from_rows(rows));
        store
    }

    #[test]
    fn test_key_samples_respect_range_and_order() {
        let store = store_with_rows(&(1..=40).collect::<Vec<_>>());
        let samples = store.key_samples(&Range::new(Token(10), Token(30))).unwrap();
        assert!(!samples.is_empty());
        for pair in samples.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        for key in &samples {
            assert!(key.token > Token(10) && key.token <= Token(30));
        }
    }

    #[test]
    fn test_validation_scan_merges_levels() {
        let store = store_with_rows(&[1, 3, 5]);
        store.add_sstable(sstable_from_rows(vec![
            Row::live(dk(2), 1, b"v".to_vec()),
            Row::live(dk(4), 1, b"v".to_vec()),
        ]));

        let mut scan = store.validation_scan(&Range::full_ring()).unwrap();
        let mut seen = Vec::new();
        while let Some(row) = scan.next_row().unwrap() {
            seen.push(row.key.token.0);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_snapshot_tags_accumulate() {
        let store = store_with_rows(&[1]);
        store.snapshot("repair-abc", false);
        store.snapshot("repair-def", false);
        assert_eq!(store.snapshot_tags(), vec!["repair-abc", "repair-def"]);
    }
}
