//! Per-level sstable bookkeeping and compaction-candidate selection.
//!
//! Levels `L1..Ln` hold pairwise non-overlapping sstables; `L0` holds
//! freshly flushed tables in arrival order and makes no overlap guarantee.
//! Level byte budgets grow geometrically: `cap(i) = base × multiplier^i`.
//!
//! All mutation is under one coarse lock; `add`/`replace`/`promote` are
//! atomic and readers see consistent snapshots. Candidate selection is a
//! pure function of manifest state, so repeated queries between mutations
//! return the same set — the strategy's single task slot is what prevents
//! the same set from being handed to two tasks.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use merlin_common::DecoratedKey;

use crate::compaction::CompactionConfig;
use crate::sst::{Sstable, SstableId};

pub struct Manifest {
    config: CompactionConfig,
    inner: Mutex<Inner>,
}

struct Inner {
    levels: Vec<Vec<Arc<Sstable>>>,
    level_by_id: HashMap<SstableId, usize>,
    /// Monotonic stamp of the last compaction that produced each sstable;
    /// 0 for flushed tables. Drives the LRU pick within a level.
    last_compacted: HashMap<SstableId, u64>,
    stamp: u64,
}

impl Manifest {
    pub fn new(config: CompactionConfig) -> Manifest {
        let levels = (0..config.max_levels).map(|_| Vec::new()).collect();
        Manifest {
            config,
            inner: Mutex::new(Inner {
                levels,
                level_by_id: HashMap::new(),
                last_compacted: HashMap::new(),
                stamp: 0,
            }),
        }
    }

    /// Byte budget for level `i`.
    pub fn level_cap(&self, level: usize) -> u64 {
        self.config
            .max_sstable_bytes
            .saturating_mul(self.config.level_size_multiplier.saturating_pow(level as u32))
    }

    /// Insert a newly introduced sstable. Lands in `L0` unless the table
    /// carries a non-negative level tag. Never triggers compaction itself.
    pub fn add(&self, sstable: Arc<Sstable>) {
        let level = if sstable.level >= 0 { sstable.level as usize } else { 0 };
        let mut inner = self.inner.lock();
        assert!(level < inner.levels.len(), "level {} out of bounds", level);
        Self::insert_at(&mut inner, level, sstable.clone());
        debug!(sstable = %sstable.id, level, "added sstable to manifest");
    }

    /// Atomic set exchange for cleanup/scrub/upgrade style rewrites.
    ///
    /// Never promotes: the replacements keep the level of the tables they
    /// replace, or fall back to `L0` when the removed set spans levels.
    pub fn replace(&self, removed: &[Arc<Sstable>], added: &[Arc<Sstable>]) {
        let mut inner = self.inner.lock();
        let mut removed_levels: Vec<usize> = Vec::with_capacity(removed.len());
        for sstable in removed {
            removed_levels.push(Self::take(&mut inner, sstable));
        }
        let uniform = match (removed_levels.first(), removed_levels.iter().all(|l| Some(l) == removed_levels.first())) {
            (Some(&level), true) => Some(level),
            _ => None,
        };
        let level = match uniform {
            Some(level) => level,
            None => {
                if !removed_levels.is_empty() {
                    warn!("replace spans levels {:?}; replacements land in L0", removed_levels);
                }
                0
            }
        };
        let stamp = Self::next_stamp(&mut inner);
        for sstable in added {
            Self::insert_at(&mut inner, level, sstable.clone());
            inner.last_compacted.insert(sstable.id, stamp);
        }
    }

    /// Post-compaction exchange. Outputs are placed at the target level
    /// derived from the inputs:
    ///
    /// - all inputs in `L0`         → `L1`
    /// - single-level inputs `L[k]` → `L[k+1]`
    /// - mixed `L[k]` + `L[k+1]`    → `L[k+1]` (the sweep replaces the
    ///   consumed upper-level tables in place)
    ///
    /// Returns the target level.
    pub fn promote(&self, removed: &[Arc<Sstable>], added: &[Arc<Sstable>]) -> usize {
        assert!(!removed.is_empty(), "promote with no inputs");
        let mut inner = self.inner.lock();

        let mut min_level = usize::MAX;
        let mut max_level = 0usize;
        for sstable in removed {
            let level = Self::take(&mut inner, sstable);
            min_level = min_level.min(level);
            max_level = max_level.max(level);
        }
        let target = Self::target_for(min_level, max_level);
        assert!(target < inner.levels.len(), "level {} out of bounds", target);

        let stamp = Self::next_stamp(&mut inner);
        for sstable in added {
            Self::insert_at(&mut inner, target, sstable.clone());
            inner.last_compacted.insert(sstable.id, stamp);
        }
        debug!(
            removed = removed.len(),
            added = added.len(),
            target,
            "promoted compaction outputs"
        );
        target
    }

    /// Target level for a compaction consuming tables at `[min, max]`.
    pub fn target_for(min_level: usize, max_level: usize) -> usize {
        if max_level == 0 {
            1
        } else if min_level == max_level {
            max_level + 1
        } else {
            max_level
        }
    }

    /// Number of sstables in a level.
    pub fn level_size(&self, level: usize) -> usize {
        self.inner.lock().levels.get(level).map_or(0, |l| l.len())
    }

    /// Total uncompressed bytes in a level.
    pub fn level_bytes(&self, level: usize) -> u64 {
        self.inner
            .lock()
            .levels
            .get(level)
            .map_or(0, |l| l.iter().map(|s| s.uncompressed_length).sum())
    }

    /// Number of non-empty levels.
    pub fn level_count(&self) -> usize {
        self.inner.lock().levels.iter().filter(|l| !l.is_empty()).count()
    }

    /// The level an sstable currently occupies, or -1.
    pub fn level_of(&self, sstable: &Sstable) -> i32 {
        self.inner.lock().level_by_id.get(&sstable.id).map_or(-1, |&l| l as i32)
    }

    /// Snapshot of a level's membership, sorted by first key.
    pub fn level(&self, level: usize) -> Vec<Arc<Sstable>> {
        self.inner.lock().levels.get(level).cloned().unwrap_or_default()
    }

    /// Sstables in `level` whose key range intersects `[first, last]`.
    pub fn overlapping(
        &self,
        level: usize,
        first: &DecoratedKey,
        last: &DecoratedKey,
    ) -> Vec<Arc<Sstable>> {
        self.inner
            .lock()
            .levels
            .get(level)
            .map_or_else(Vec::new, |l| {
                l.iter().filter(|s| s.overlaps_keys(first, last)).cloned().collect()
            })
    }

    /// Compaction score of a level: bytes over budget for `L1+`, table
    /// count over the flush trigger for `L0`.
    pub fn score(&self, level: usize) -> f64 {
        if level == 0 {
            self.level_size(0) as f64 / self.config.l0_compaction_trigger as f64
        } else {
            self.level_bytes(level) as f64 / self.level_cap(level) as f64
        }
    }

    /// Select the next set of sstables to compact, possibly empty.
    ///
    /// `L0` reaching its trigger takes priority and sweeps: all of `L0`
    /// plus every overlapping `L1` table. Otherwise the most oversized
    /// `L1+` level contributes its least-recently-compacted table plus the
    /// overlapping slice of the level above. Selection does not mutate the
    /// manifest, so the answer is stable until `replace`/`promote` run.
    pub fn compaction_candidates(&self) -> Vec<Arc<Sstable>> {
        let inner = self.inner.lock();

        // L0 sweep
        let l0 = &inner.levels[0];
        if !l0.is_empty() && l0.len() >= self.config.l0_compaction_trigger {
            let mut out = l0.clone();
            let first = l0.iter().map(|s| s.first_key.clone()).min().expect("non-empty L0");
            let last = l0.iter().map(|s| s.last_key.clone()).max().expect("non-empty L0");
            if let Some(l1) = inner.levels.get(1) {
                out.extend(l1.iter().filter(|s| s.overlaps_keys(&first, &last)).cloned());
            }
            return out;
        }

        // most oversized L1+ level; strict > keeps the lowest index on ties
        let mut best: Option<(usize, f64)> = None;
        for level in 1..inner.levels.len() {
            if inner.levels[level].is_empty() {
                continue;
            }
            let bytes: u64 = inner.levels[level].iter().map(|s| s.uncompressed_length).sum();
            let score = bytes as f64 / self.level_cap(level) as f64;
            if score > 1.0 && best.map_or(true, |(_, b)| score > b) {
                best = Some((level, score));
            }
        }

        let (level, _) = match best {
            Some(found) => found,
            None => return Vec::new(),
        };

        // LRU by last-compaction stamp, tie-break smallest first key
        let victim = inner.levels[level]
            .iter()
            .min_by(|a, b| {
                let sa = inner.last_compacted.get(&a.id).copied().unwrap_or(0);
                let sb = inner.last_compacted.get(&b.id).copied().unwrap_or(0);
                sa.cmp(&sb).then_with(|| a.first_key.cmp(&b.first_key))
            })
            .cloned()
            .expect("non-empty level");

        let mut out = vec![victim.clone()];
        if let Some(next_level) = inner.levels.get(level + 1) {
            out.extend(
                next_level
                    .iter()
                    .filter(|s| s.overlaps_keys(&victim.first_key, &victim.last_key))
                    .cloned(),
            );
        }
        out
    }

    // ── internals ───────────────────────────────────────────────────────────

    fn insert_at(inner: &mut Inner, level: usize, sstable: Arc<Sstable>) {
        assert!(
            !inner.level_by_id.contains_key(&sstable.id),
            "{} is already in the manifest",
            sstable.id
        );
        if level >= 1 {
            for resident in &inner.levels[level] {
                assert!(
                    !resident.overlaps(&sstable),
                    "{} overlaps {} in L{}",
                    sstable.id,
                    resident.id,
                    level
                );
            }
        }
        let slot = inner.levels[level]
            .partition_point(|s| s.first_key < sstable.first_key);
        inner.levels[level].insert(slot, sstable.clone());
        inner.level_by_id.insert(sstable.id, level);
    }

    fn take(inner: &mut Inner, sstable: &Sstable) -> usize {
        let level = inner
            .level_by_id
            .remove(&sstable.id)
            .unwrap_or_else(|| panic!("{} is not in the manifest", sstable.id));
        inner.levels[level].retain(|s| s.id != sstable.id);
        inner.last_compacted.remove(&sstable.id);
        level
    }

    fn next_stamp(inner: &mut Inner) -> u64 {
        inner.stamp += 1;
        inner.stamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sst::{sstable_from_rows, Row};
    use merlin_common::{DecoratedKey, Token};

    fn config() -> CompactionConfig {
        CompactionConfig {
            max_sstable_bytes: 1024,
            l0_compaction_trigger: 4,
            level_size_multiplier: 10,
            max_levels: 8,
        }
    }

    fn dk(t: u128) -> DecoratedKey {
        DecoratedKey::new(Token(t), t.to_be_bytes().to_vec())
    }

    fn sst(lo: u128, hi: u128) -> Arc<Sstable> {
        sstable_from_rows(vec![
            Row::live(dk(lo), 1, b"v".to_vec()),
            Row::live(dk(hi), 1, b"v".to_vec()),
        ])
    }

    fn sized_sst(lo: u128, hi: u128, bytes: usize) -> Arc<Sstable> {
        // pad the first row's payload so uncompressed_length lands near `bytes`
        let pad = bytes.saturating_sub(100);
        sstable_from_rows(vec![
            Row::live(dk(lo), 1, vec![0u8; pad]),
            Row::live(dk(hi), 1, b"v".to_vec()),
        ])
    }

    #[test]
    fn test_add_lands_in_l0() {
        let manifest = Manifest::new(config());
        let table = sst(0, 10);
        manifest.add(table.clone());
        assert_eq!(manifest.level_size(0), 1);
        assert_eq!(manifest.level_of(&table), 0);
    }

    #[test]
    fn test_add_honors_level_tag() {
        let manifest = Manifest::new(config());
        let mut builder = crate::sst::SstableBuilder::new();
        builder.add(Row::live(dk(5), 1, b"v".to_vec()));
        let table = builder.finish(3);
        manifest.add(table.clone());
        assert_eq!(manifest.level_of(&table), 3);
    }

    #[test]
    fn test_replace_keeps_level_and_is_noop_for_same_table() {
        let manifest = Manifest::new(config());
        let a = sst(0, 10);
        manifest.add(a.clone());
        manifest.promote(&[a.clone()], &[a.clone()]); // park it in L1
        assert_eq!(manifest.level_of(&a), 1);

        manifest.replace(&[a.clone()], &[a.clone()]);
        assert_eq!(manifest.level_of(&a), 1);
        assert_eq!(manifest.level_size(1), 1);
        assert_eq!(manifest.level_size(0), 0);
    }

    #[test]
    fn test_replace_ambiguous_levels_fall_back_to_l0() {
        let manifest = Manifest::new(config());
        let a = sst(0, 10);
        let b = sst(20, 30);
        manifest.add(a.clone());
        manifest.add(b.clone());
        manifest.promote(&[a.clone()], &[a.clone()]); // a now L1, b still L0

        let replacement = sst(40, 50);
        manifest.replace(&[a, b], &[replacement.clone()]);
        assert_eq!(manifest.level_of(&replacement), 0);
    }

    #[test]
    fn test_promote_pure_l0_targets_l1() {
        let manifest = Manifest::new(config());
        let a = sst(0, 10);
        let b = sst(5, 15);
        manifest.add(a.clone());
        manifest.add(b.clone());
        let out = sst(0, 15);
        let target = manifest.promote(&[a, b], &[out.clone()]);
        assert_eq!(target, 1);
        assert_eq!(manifest.level_of(&out), 1);
    }

    #[test]
    fn test_promote_single_level_moves_up() {
        let manifest = Manifest::new(config());
        let a = sst(0, 10);
        manifest.add(a.clone());
        manifest.promote(&[a.clone()], &[a.clone()]); // L1
        let target = manifest.promote(&[a.clone()], &[a.clone()]);
        assert_eq!(target, 2);
        assert_eq!(manifest.level_of(&a), 2);
    }

    #[test]
    fn test_promote_mixed_levels_replaces_in_place() {
        assert_eq!(Manifest::target_for(0, 1), 1);
        assert_eq!(Manifest::target_for(1, 2), 2);
        assert_eq!(Manifest::target_for(2, 2), 3);
    }

    #[test]
    #[should_panic(expected = "overlaps")]
    fn test_overlap_in_upper_level_is_fatal() {
        let manifest = Manifest::new(config());
        let a = sst(0, 10);
        let b = sst(5, 15);
        manifest.add(a.clone());
        manifest.add(b.clone());
        manifest.promote(&[a.clone()], &[a]); // a → L1
        manifest.promote(&[b.clone()], &[b]); // b → L1, overlapping
    }

    #[test]
    fn test_l0_sweep_candidates() {
        let manifest = Manifest::new(config());
        for i in 0..4u128 {
            manifest.add(sst(i * 10, i * 10 + 5));
        }
        // L1 resident overlapping the sweep range
        let l1 = sst(7, 8);
        manifest.add(l1.clone());
        manifest.promote(&[l1.clone()], &[l1.clone()]);

        let candidates = manifest.compaction_candidates();
        assert_eq!(candidates.len(), 5, "all of L0 plus the overlapping L1 table");
        assert!(candidates.iter().any(|s| s.id == l1.id));
    }

    #[test]
    fn test_no_candidates_below_thresholds() {
        let manifest = Manifest::new(config());
        manifest.add(sst(0, 10));
        manifest.add(sst(20, 30));
        assert!(manifest.compaction_candidates().is_empty());
    }

    #[test]
    fn test_oversized_level_picks_lru_plus_overlap() {
        let manifest = Manifest::new(config());
        // two large L1 tables blow the 10 KiB cap for L1
        let a = sized_sst(0, 10, 9000);
        let b = sized_sst(20, 30, 9000);
        manifest.add(a.clone());
        manifest.add(b.clone());
        manifest.promote(&[a.clone()], &[a.clone()]);
        manifest.promote(&[b.clone()], &[b.clone()]);
        assert!(manifest.score(1) > 1.0);

        // overlapping L2 resident for `a`
        let mut builder = crate::sst::SstableBuilder::new();
        builder.add(Row::live(dk(5), 1, b"v".to_vec()));
        builder.add(Row::live(dk(6), 1, b"v".to_vec()));
        let c = builder.finish(2);
        manifest.add(c.clone());
        assert_eq!(manifest.level_of(&c), 2);

        let candidates = manifest.compaction_candidates();
        // `a` was stamped before `b`, so `a` is the LRU victim; `c` overlaps it
        assert!(candidates.iter().any(|s| s.id == a.id));
        assert!(candidates.iter().any(|s| s.id == c.id));
        assert!(!candidates.iter().any(|s| s.id == b.id));
    }

    #[test]
    fn test_candidates_stable_between_mutations() {
        let manifest = Manifest::new(config());
        for i in 0..4u128 {
            manifest.add(sst(i * 10, i * 10 + 5));
        }
        let first = manifest.compaction_candidates();
        let second = manifest.compaction_candidates();
        let ids = |v: &Vec<Arc<Sstable>>| {
            let mut ids: Vec<_> = v.iter().map(|s| s.id).collect();
            ids.sort();
            ids
        };
        assert_eq!(ids(&first), ids(&second));
    }

    #[test]
    fn test_level_accounting() {
        let manifest = Manifest::new(config());
        let a = sst(0, 10);
        manifest.add(a.clone());
        assert_eq!(manifest.level_count(), 1);
        assert_eq!(manifest.level_bytes(0), a.uncompressed_length);
        manifest.promote(&[a.clone()], &[a]);
        assert_eq!(manifest.level_count(), 1);
        assert_eq!(manifest.level_bytes(0), 0);
    }
}
