//! Leveled compaction strategy and task execution.
//!
//! The strategy wraps a manifest and owns a single task slot: at most one
//! compaction per strategy instance is scheduled at a time, so candidate
//! selection can never hand overlapping work to two tasks. A task merges
//! its claimed inputs through `MergingRowIterator`, purges GC-eligible
//! tombstones, and rolls output sstables bounded by the configured byte
//! cap before promoting them in one atomic manifest exchange.
//!
//! Failure semantics: an error anywhere in the merge discards the partial
//! outputs, leaves the inputs in place, and clears the slot; the next
//! scheduler tick retries.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use merlin_common::{DecoratedKey, Range, StorageError};

use crate::manifest::Manifest;
use crate::scanner::{LeveledScanner, MergingRowIterator};
use crate::sst::{Row, Sstable, SstableBuilder, SstableId};

/// Option key for the target sstable size, in megabytes.
const SSTABLE_SIZE_OPTION: &str = "sstable_size_in_mb";

/// Default target sstable size when unset or unparseable.
const DEFAULT_SSTABLE_SIZE_MB: u64 = 5;

// ── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Byte cap for compaction output sstables; also the base of the
    /// per-level byte budget (`cap(i) = base × multiplier^i`).
    pub max_sstable_bytes: u64,
    /// Number of L0 tables that triggers a sweep.
    pub l0_compaction_trigger: usize,
    /// Geometric growth factor between level budgets.
    pub level_size_multiplier: u64,
    /// Number of levels tracked by the manifest.
    pub max_levels: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            max_sstable_bytes: DEFAULT_SSTABLE_SIZE_MB * 1024 * 1024,
            l0_compaction_trigger: 4,
            level_size_multiplier: 10,
            max_levels: 9,
        }
    }
}

impl CompactionConfig {
    /// Build a config from a string option map. An unparseable
    /// `sstable_size_in_mb` logs a warning and falls back to the default.
    pub fn from_options(options: &HashMap<String, String>) -> CompactionConfig {
        let mut config = CompactionConfig::default();
        if let Some(value) = options.get(SSTABLE_SIZE_OPTION) {
            match value.parse::<u64>() {
                Ok(mb) => config.max_sstable_bytes = mb * 1024 * 1024,
                Err(_) => warn!(
                    "{} is not a parsable int (base10) for {}, using default value",
                    value, SSTABLE_SIZE_OPTION
                ),
            }
        }
        config
    }
}

// ── Metrics ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct CompactionMetrics {
    pub runs_completed: AtomicU64,
    pub runs_failed: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub files_consumed: AtomicU64,
    pub files_produced: AtomicU64,
    pub tombstones_purged: AtomicU64,
}

impl CompactionMetrics {
    pub fn snapshot(&self) -> CompactionMetricsSnapshot {
        CompactionMetricsSnapshot {
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            files_consumed: self.files_consumed.load(Ordering::Relaxed),
            files_produced: self.files_produced.load(Ordering::Relaxed),
            tombstones_purged: self.tombstones_purged.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompactionMetricsSnapshot {
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub files_consumed: u64,
    pub files_produced: u64,
    pub tombstones_purged: u64,
}

// ── Result ──────────────────────────────────────────────────────────────────

/// Outcome of one completed compaction.
#[derive(Debug)]
pub struct CompactionResult {
    pub consumed: Vec<Arc<Sstable>>,
    pub produced: Vec<Arc<Sstable>>,
    pub target_level: usize,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub rows_written: u64,
    pub tombstones_purged: u64,
}

// ── Task ────────────────────────────────────────────────────────────────────

/// One scheduled compaction: an exclusive claim on its input set.
pub struct CompactionTask {
    inputs: Vec<Arc<Sstable>>,
    gc_before: i64,
    done: AtomicBool,
}

impl CompactionTask {
    fn new(inputs: Vec<Arc<Sstable>>, gc_before: i64) -> CompactionTask {
        CompactionTask { inputs, gc_before, done: AtomicBool::new(false) }
    }

    pub fn inputs(&self) -> &[Arc<Sstable>] {
        &self.inputs
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

// ── Strategy ────────────────────────────────────────────────────────────────

pub struct LeveledStrategy {
    manifest: Arc<Manifest>,
    config: CompactionConfig,
    metrics: CompactionMetrics,
    current_task: Mutex<Option<Arc<CompactionTask>>>,
}

impl LeveledStrategy {
    pub fn new(config: CompactionConfig) -> LeveledStrategy {
        let manifest = Arc::new(Manifest::new(config.clone()));
        LeveledStrategy { manifest, config, metrics: CompactionMetrics::default(), current_task: Mutex::new(None) }
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    pub fn metrics(&self) -> &CompactionMetrics {
        &self.metrics
    }

    pub fn max_sstable_bytes(&self) -> u64 {
        self.config.max_sstable_bytes
    }

    /// Claim the next compaction, if any. Returns `None` while a previous
    /// task is still in flight (the single-slot guarantee) or when no level
    /// is over budget.
    pub fn next_background_task(&self, gc_before: i64) -> Option<Arc<CompactionTask>> {
        let mut slot = self.current_task.lock();
        if let Some(task) = slot.as_ref() {
            if !task.is_done() {
                debug!("compaction still in progress, not scheduling another");
                return None;
            }
        }

        let candidates = self.manifest.compaction_candidates();
        if candidates.is_empty() {
            return None;
        }

        let task = Arc::new(CompactionTask::new(candidates, gc_before));
        *slot = Some(task.clone());
        Some(task)
    }

    /// Run a claimed task to completion. Always releases the slot.
    pub fn execute(&self, task: &Arc<CompactionTask>) -> Result<CompactionResult, StorageError> {
        let result = self.run_task(task);

        task.done.store(true, Ordering::SeqCst);
        {
            let mut slot = self.current_task.lock();
            if slot.as_ref().is_some_and(|t| Arc::ptr_eq(t, task)) {
                *slot = None;
            }
        }

        match &result {
            Ok(r) => {
                self.metrics.runs_completed.fetch_add(1, Ordering::Relaxed);
                self.metrics.bytes_read.fetch_add(r.bytes_read, Ordering::Relaxed);
                self.metrics.bytes_written.fetch_add(r.bytes_written, Ordering::Relaxed);
                self.metrics.files_consumed.fetch_add(r.consumed.len() as u64, Ordering::Relaxed);
                self.metrics.files_produced.fetch_add(r.produced.len() as u64, Ordering::Relaxed);
                self.metrics.tombstones_purged.fetch_add(r.tombstones_purged, Ordering::Relaxed);
                info!(
                    consumed = r.consumed.len(),
                    produced = r.produced.len(),
                    target = r.target_level,
                    bytes_written = r.bytes_written,
                    "compaction completed"
                );
            }
            Err(e) => {
                self.metrics.runs_failed.fetch_add(1, Ordering::Relaxed);
                warn!("compaction failed, inputs left in place: {}", e);
            }
        }
        result
    }

    fn run_task(&self, task: &CompactionTask) -> Result<CompactionResult, StorageError> {
        let levels: Vec<usize> =
            task.inputs.iter().map(|s| self.manifest.level_of(s).max(0) as usize).collect();
        let min_level = levels.iter().copied().min().unwrap_or(0);
        let max_level = levels.iter().copied().max().unwrap_or(0);
        let target = Manifest::target_for(min_level, max_level);

        // key intervals of target-level residents that are not being
        // consumed; output tables must not straddle them
        let input_ids: HashSet<SstableId> = task.inputs.iter().map(|s| s.id).collect();
        let forbidden: Vec<(DecoratedKey, DecoratedKey)> = self
            .manifest
            .level(target)
            .into_iter()
            .filter(|s| !input_ids.contains(&s.id))
            .map(|s| (s.first_key.clone(), s.last_key.clone()))
            .collect();

        let mut merge = MergingRowIterator::new(self.scanners(&task.inputs, None));
        let mut writer =
            RollingWriter::new(self.config.max_sstable_bytes, target as i32, forbidden);
        let mut rows_written = 0u64;
        let mut tombstones_purged = 0u64;

        while let Some(row) = merge.next_row()? {
            if row.deleted && row.timestamp < task.gc_before {
                tombstones_purged += 1;
                continue;
            }
            rows_written += 1;
            writer.add(row);
        }

        let bytes_read = merge.length();
        merge.close()?;
        let produced = writer.finish();
        let bytes_written = produced.iter().map(|s| s.uncompressed_length).sum();

        let target_level = self.manifest.promote(&task.inputs, &produced);

        Ok(CompactionResult {
            consumed: task.inputs.clone(),
            produced,
            target_level,
            bytes_read,
            bytes_written,
            rows_written,
            tombstones_purged,
        })
    }

    /// Scanners for an input set: `L0` (and unplaced) tables may overlap
    /// and get one scanner each; each `L1+` level gets a single-cursor
    /// `LeveledScanner` over its non-overlapping members.
    pub fn scanners(
        &self,
        sstables: &[Arc<Sstable>],
        range: Option<Range>,
    ) -> Vec<LeveledScanner> {
        let mut by_level: BTreeMap<i32, Vec<Arc<Sstable>>> = BTreeMap::new();
        for sstable in sstables {
            by_level.entry(self.manifest.level_of(sstable)).or_default().push(sstable.clone());
        }

        let mut out = Vec::with_capacity(sstables.len());
        for (level, group) in by_level {
            if level <= 0 {
                for sstable in group {
                    out.push(LeveledScanner::new(vec![sstable], range));
                }
            } else {
                out.push(LeveledScanner::new(group, range));
            }
        }
        out
    }

    /// Cost heuristic for point-lookup planning: with many L0 tables plus
    /// many levels, existence checks have to touch too many files.
    pub fn is_key_lookup_expensive(&self, ignore: &HashSet<SstableId>) -> bool {
        let l0_remaining =
            self.manifest.level(0).iter().filter(|s| !ignore.contains(&s.id)).count();
        l0_remaining + self.manifest.level_count() > 20
    }
}

// ── Rolling writer ──────────────────────────────────────────────────────────

/// Splits the merged row stream into byte-capped output sstables, also
/// rolling at the boundary of any target-level resident the task did not
/// consume (so outputs never straddle a kept table's key range).
struct RollingWriter {
    max_bytes: u64,
    level: i32,
    forbidden: Vec<(DecoratedKey, DecoratedKey)>,
    outputs: Vec<Arc<Sstable>>,
    current: SstableBuilder,
}

impl RollingWriter {
    fn new(
        max_bytes: u64,
        level: i32,
        forbidden: Vec<(DecoratedKey, DecoratedKey)>,
    ) -> RollingWriter {
        RollingWriter { max_bytes, level, forbidden, outputs: Vec::new(), current: SstableBuilder::new() }
    }

    fn add(&mut self, row: Row) {
        assert!(
            !self.forbidden.iter().any(|(f, l)| row.key >= *f && row.key <= *l),
            "merged row {} falls inside a target-level table the task did not claim",
            row.key
        );

        if let Some(first) = self.current.first_key() {
            let straddles = self
                .forbidden
                .iter()
                .any(|(f, l)| *f <= row.key && *first <= *l && *f >= *first);
            if straddles {
                self.roll();
            }
        }

        self.current.add(row);
        if self.current.byte_len() >= self.max_bytes {
            self.roll();
        }
    }

    fn roll(&mut self) {
        if !self.current.is_empty() {
            let builder = std::mem::take(&mut self.current);
            self.outputs.push(builder.finish(self.level));
        }
    }

    fn finish(mut self) -> Vec<Arc<Sstable>> {
        self.roll();
        self.outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sst::{sstable_from_rows, sstable_with_source, RowScanner, SstableSource};
    use merlin_common::{DecoratedKey, Token};

    fn dk(t: u128) -> DecoratedKey {
        DecoratedKey::new(Token(t), t.to_be_bytes().to_vec())
    }

    fn small_config() -> CompactionConfig {
        CompactionConfig {
            max_sstable_bytes: 256,
            l0_compaction_trigger: 4,
            level_size_multiplier: 10,
            max_levels: 8,
        }
    }

    fn flush(strategy: &LeveledStrategy, tokens: &[u128]) {
        let rows = tokens.iter().map(|&t| Row::live(dk(t), 1, vec![0u8; 32])).collect();
        strategy.manifest().add(sstable_from_rows(rows));
    }

    #[test]
    fn test_options_parse_with_default() {
        let mut options = HashMap::new();
        options.insert(SSTABLE_SIZE_OPTION.to_string(), "7".to_string());
        assert_eq!(CompactionConfig::from_options(&options).max_sstable_bytes, 7 * 1024 * 1024);

        options.insert(SSTABLE_SIZE_OPTION.to_string(), "not-a-number".to_string());
        assert_eq!(
            CompactionConfig::from_options(&options).max_sstable_bytes,
            DEFAULT_SSTABLE_SIZE_MB * 1024 * 1024
        );
    }

    #[test]
    fn test_single_task_slot() {
        let strategy = LeveledStrategy::new(small_config());
        for i in 0..4u128 {
            flush(&strategy, &[i * 100, i * 100 + 50]);
        }
        let first = strategy.next_background_task(0).expect("L0 at trigger");
        assert!(strategy.next_background_task(0).is_none(), "slot is taken");

        let result = strategy.execute(&first).unwrap();
        assert!(first.is_done());
        assert_eq!(result.target_level, 1);
    }

    #[test]
    fn test_l0_sweep_produces_capped_l1_tables() {
        let strategy = LeveledStrategy::new(small_config());
        for i in 0..4u128 {
            flush(&strategy, &[i * 100, i * 100 + 10, i * 100 + 20]);
        }
        let task = strategy.next_background_task(0).expect("candidates");
        let result = strategy.execute(&task).unwrap();

        assert_eq!(result.target_level, 1);
        assert!(!result.produced.is_empty());
        for sstable in &result.produced {
            assert!(sstable.uncompressed_length <= 256 + 100, "writer rolls near the cap");
        }
        assert_eq!(strategy.manifest().level_size(0), 0);
        assert_eq!(strategy.manifest().level_size(1), result.produced.len());
    }

    #[test]
    fn test_duplicate_keys_reconciled_across_l0() {
        let strategy = LeveledStrategy::new(small_config());
        strategy.manifest().add(sstable_from_rows(vec![Row::live(dk(1), 1, b"old".to_vec())]));
        strategy.manifest().add(sstable_from_rows(vec![Row::live(dk(1), 9, b"new".to_vec())]));
        strategy.manifest().add(sstable_from_rows(vec![Row::live(dk(2), 1, b"x".to_vec())]));
        strategy.manifest().add(sstable_from_rows(vec![Row::live(dk(3), 1, b"y".to_vec())]));

        let task = strategy.next_background_task(0).unwrap();
        let result = strategy.execute(&task).unwrap();
        assert_eq!(result.rows_written, 3, "key 1 merged to a single row");

        let mut scanner = LeveledScanner::new(result.produced.clone(), None);
        let first = scanner.next_row().unwrap().unwrap();
        assert_eq!(first.payload, b"new");
    }

    #[test]
    fn test_gc_purges_old_tombstones() {
        let strategy = LeveledStrategy::new(small_config());
        strategy.manifest().add(sstable_from_rows(vec![
            Row::tombstone(dk(1), 100),
            Row::live(dk(2), 100, b"keep".to_vec()),
        ]));
        strategy.manifest().add(sstable_from_rows(vec![Row::tombstone(dk(3), 900)]));
        strategy.manifest().add(sstable_from_rows(vec![Row::live(dk(4), 1, b"v".to_vec())]));
        strategy.manifest().add(sstable_from_rows(vec![Row::live(dk(5), 1, b"v".to_vec())]));

        // gc_before = 500: the tombstone at ts 100 is purged, ts 900 kept
        let task = strategy.next_background_task(500).unwrap();
        let result = strategy.execute(&task).unwrap();
        assert_eq!(result.tombstones_purged, 1);
        assert_eq!(result.rows_written, 4);
    }

    struct FailingSource;

    impl SstableSource for FailingSource {
        fn open(
            &self,
            _sstable: &Sstable,
            _range: Option<Range>,
        ) -> Result<Box<dyn RowScanner>, StorageError> {
            Err(StorageError::ScanFailed { sstable_id: 0, detail: "injected open failure".into() })
        }
    }

    #[test]
    fn test_failed_compaction_leaves_inputs_and_frees_slot() {
        let strategy = LeveledStrategy::new(small_config());
        for i in 0..3u128 {
            flush(&strategy, &[i * 100]);
        }
        strategy
            .manifest()
            .add(sstable_with_source(dk(900), dk(950), 64, -1, Arc::new(FailingSource)));

        let task = strategy.next_background_task(0).expect("L0 at trigger");
        assert!(strategy.execute(&task).is_err());

        assert_eq!(strategy.manifest().level_size(0), 4, "inputs left in place");
        assert_eq!(strategy.manifest().level_size(1), 0, "no partial outputs");
        assert_eq!(strategy.metrics().snapshot().runs_failed, 1);
        assert!(strategy.next_background_task(0).is_some(), "slot was cleared");
    }

    #[test]
    fn test_compaction_cascade_reaches_l2() {
        let config = CompactionConfig {
            max_sstable_bytes: 200,
            l0_compaction_trigger: 4,
            level_size_multiplier: 2, // L1 cap 400 bytes: overflows quickly
            max_levels: 8,
        };
        let strategy = LeveledStrategy::new(config);

        let mut round = 0u128;
        while strategy.manifest().level_size(2) == 0 {
            assert!(round < 64, "cascade failed to reach L2");
            // four disjoint flushes fill L0 to its trigger
            for i in 0..4u128 {
                let base = (round * 4 + i) * 1000;
                flush(&strategy, &[base, base + 10, base + 20]);
            }
            while let Some(task) = strategy.next_background_task(0) {
                strategy.execute(&task).unwrap();
            }
            round += 1;
        }

        // level invariants hold (insertions assert non-overlap) and byte
        // accounting matches the membership
        assert!(strategy.manifest().level_size(1) > 0 || strategy.manifest().level_size(2) > 0);
        let l1 = strategy.manifest().level(1);
        for (i, a) in l1.iter().enumerate() {
            for b in &l1[i + 1..] {
                assert!(!a.overlaps(b), "L1 overlap between {} and {}", a.id, b.id);
            }
        }
        let l2 = strategy.manifest().level(2);
        for (i, a) in l2.iter().enumerate() {
            for b in &l2[i + 1..] {
                assert!(!a.overlaps(b), "L2 overlap between {} and {}", a.id, b.id);
            }
        }
    }

    #[test]
    fn test_is_key_lookup_expensive() {
        let strategy = LeveledStrategy::new(CompactionConfig {
            l0_compaction_trigger: 1000, // keep everything in L0
            ..small_config()
        });
        assert!(!strategy.is_key_lookup_expensive(&HashSet::new()));
        for i in 0..25u128 {
            flush(&strategy, &[i * 10]);
        }
        assert!(strategy.is_key_lookup_expensive(&HashSet::new()));

        let ignore: HashSet<SstableId> =
            strategy.manifest().level(0).iter().map(|s| s.id).collect();
        assert!(!strategy.is_key_lookup_expensive(&ignore));
    }
}
