//! Merged row scanning.
//!
//! `LeveledScanner` walks a set of sstables known to be non-overlapping
//! (one `L1+` level) with a single cursor: tables are opened one at a time
//! in first-key order and the previous scanner is closed before the next
//! opens. `L0` tables may overlap and therefore get one scanner each;
//! `MergingRowIterator` then k-way-merges any mix of scanners into one
//! ascending, reconciled row stream.

use std::sync::Arc;

use merlin_common::{Range, StorageError};

use crate::sst::{Row, RowScanner, Sstable};

// ── LeveledScanner ──────────────────────────────────────────────────────────

/// Single-cursor scan across same-level, non-overlapping sstables.
pub struct LeveledScanner {
    sstables: Vec<Arc<Sstable>>,
    range: Option<Range>,
    next_index: usize,
    current: Option<Box<dyn RowScanner>>,
    /// Bytes attributed to scanners already exhausted and closed.
    position_offset: u64,
    total_length: u64,
}

impl LeveledScanner {
    pub fn new(mut sstables: Vec<Arc<Sstable>>, range: Option<Range>) -> LeveledScanner {
        sstables.sort_by(|a, b| a.first_key.cmp(&b.first_key));
        let total_length = sstables.iter().map(|s| s.uncompressed_length).sum();
        LeveledScanner { sstables, range, next_index: 0, current: None, position_offset: 0, total_length }
    }

    pub fn next_row(&mut self) -> Result<Option<Row>, StorageError> {
        loop {
            if self.current.is_none() {
                let Some(sstable) = self.sstables.get(self.next_index) else {
                    return Ok(None);
                };
                self.next_index += 1;
                self.current = Some(sstable.scan(self.range)?);
            }

            let scanner = self.current.as_mut().expect("scanner just opened");
            match scanner.next_row() {
                Ok(Some(row)) => return Ok(Some(row)),
                Ok(None) => {
                    self.position_offset += scanner.length();
                    scanner.close()?;
                    self.current = None;
                }
                Err(e) => {
                    // fatal to the driving compaction; close what we hold
                    let _ = scanner.close();
                    self.current = None;
                    return Err(e);
                }
            }
        }
    }

    /// Bytes of closed scanners plus the open scanner's position.
    pub fn current_position(&self) -> u64 {
        self.position_offset + self.current.as_ref().map_or(0, |s| s.position())
    }

    /// Sum of the uncompressed lengths of the input sstables.
    pub fn length(&self) -> u64 {
        self.total_length
    }

    /// Idempotent.
    pub fn close(&mut self) -> Result<(), StorageError> {
        if let Some(mut scanner) = self.current.take() {
            scanner.close()?;
        }
        Ok(())
    }
}

// ── MergingRowIterator ──────────────────────────────────────────────────────

/// K-way merge over scanners, yielding each key once in ascending order.
///
/// Rows for the same key across scanners are reconciled by newest write
/// timestamp, tombstones winning ties. The result feeds both the compaction
/// writer and the repair validator (which requires strictly ascending keys).
pub struct MergingRowIterator {
    scanners: Vec<LeveledScanner>,
    heads: Vec<Option<Row>>,
    primed: bool,
}

impl MergingRowIterator {
    pub fn new(scanners: Vec<LeveledScanner>) -> MergingRowIterator {
        let heads = scanners.iter().map(|_| None).collect();
        MergingRowIterator { scanners, heads, primed: false }
    }

    fn prime(&mut self) -> Result<(), StorageError> {
        for i in 0..self.scanners.len() {
            self.heads[i] = self.scanners[i].next_row()?;
        }
        self.primed = true;
        Ok(())
    }

    /// The next reconciled row, or `None` when every scanner is exhausted.
    pub fn next_row(&mut self) -> Result<Option<Row>, StorageError> {
        if !self.primed {
            self.prime()?;
        }

        let min_key = match self
            .heads
            .iter()
            .flatten()
            .map(|row| row.key.clone())
            .min()
        {
            Some(key) => key,
            None => return Ok(None),
        };

        let mut merged: Option<Row> = None;
        for i in 0..self.heads.len() {
            let matches = self.heads[i].as_ref().is_some_and(|row| row.key == min_key);
            if !matches {
                continue;
            }
            let row = self.heads[i].take().expect("head checked above");
            self.heads[i] = self.scanners[i].next_row()?;
            merged = Some(match merged {
                None => row,
                Some(winner) => reconcile(winner, row),
            });
        }

        Ok(merged)
    }

    /// Aggregate progress across the underlying scanners.
    pub fn current_position(&self) -> u64 {
        self.scanners.iter().map(|s| s.current_position()).sum()
    }

    pub fn length(&self) -> u64 {
        self.scanners.iter().map(|s| s.length()).sum()
    }

    pub fn close(&mut self) -> Result<(), StorageError> {
        for scanner in &mut self.scanners {
            scanner.close()?;
        }
        Ok(())
    }
}

/// Newest timestamp wins; a tombstone beats a live row of the same age.
fn reconcile(a: Row, b: Row) -> Row {
    let a_rank = (a.timestamp, a.deleted);
    let b_rank = (b.timestamp, b.deleted);
    if b_rank > a_rank {
        b
    } else {
        a
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

    fn sst(tokens: &[u128]) -> Arc<Sstable> {
        sstable_from_rows(tokens.iter().map(|&t| Row::live(dk(t), 1, b"v".to_vec())).collect())
    }

    #[test]
    fn test_empty_input() {
        let mut scanner = LeveledScanner::new(Vec::new(), None);
        assert!(scanner.next_row().unwrap().is_none());
        assert_eq!(scanner.length(), 0);
        assert_eq!(scanner.current_position(), 0);
    }

    #[test]
    fn test_emits_union_in_key_order() {
        let a = sst(&[1, 2]);
        let b = sst(&[5, 6]);
        let c = sst(&[3, 4]);
        let mut scanner = LeveledScanner::new(vec![a, b, c], None);
        let mut seen = Vec::new();
        while let Some(row) = scanner.next_row().unwrap() {
            seen.push(row.key.token.0);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_position_reaches_total_length() {
        let a = sst(&[1, 2]);
        let b = sst(&[3, 4]);
        let expected = a.uncompressed_length + b.uncompressed_length;
        let mut scanner = LeveledScanner::new(vec![a, b], None);
        while scanner.next_row().unwrap().is_some() {}
        assert_eq!(scanner.current_position(), expected);
        assert_eq!(scanner.length(), expected);
    }

    #[test]
    fn test_range_restriction() {
        let a = sst(&[1, 2, 3]);
        let b = sst(&[4, 5, 6]);
        let range = Range::new(Token(2), Token(5));
        let mut scanner = LeveledScanner::new(vec![a, b], Some(range));
        let mut seen = Vec::new();
        while let Some(row) = scanner.next_row().unwrap() {
            seen.push(row.key.token.0);
        }
        assert_eq!(seen, vec![3, 4, 5]);
    }

    struct FailingSource;

    impl SstableSource for FailingSource {
        fn open(
            &self,
            _sstable: &Sstable,
            _range: Option<Range>,
        ) -> Result<Box<dyn RowScanner>, StorageError> {
            Ok(Box::new(FailingScanner))
        }
    }

    struct FailingScanner;

    impl RowScanner for FailingScanner {
        fn next_row(&mut self) -> Result<Option<Row>, StorageError> {
            Err(StorageError::ScanFailed { sstable_id: 0, detail: "injected".into() })
        }
        fn position(&self) -> u64 {
            0
        }
        fn length(&self) -> u64 {
            0
        }
        fn close(&mut self) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[test]
    fn test_scan_error_is_fatal() {
        let bad = sstable_with_source(dk(0), dk(10), 64, 1, Arc::new(FailingSource));
        let mut scanner = LeveledScanner::new(vec![bad], None);
        assert!(scanner.next_row().is_err());
    }

    #[test]
    fn test_merge_dedups_by_newest_timestamp() {
        let old = sstable_from_rows(vec![Row::live(dk(1), 1, b"old".to_vec())]);
        let new = sstable_from_rows(vec![Row::live(dk(1), 9, b"new".to_vec())]);
        let mut merge = MergingRowIterator::new(vec![
            LeveledScanner::new(vec![old], None),
            LeveledScanner::new(vec![new], None),
        ]);
        let row = merge.next_row().unwrap().expect("one merged row");
        assert_eq!(row.payload, b"new");
        assert!(merge.next_row().unwrap().is_none());
    }

    #[test]
    fn test_merge_tombstone_wins_tie() {
        let live = sstable_from_rows(vec![Row::live(dk(1), 5, b"x".to_vec())]);
        let dead = sstable_from_rows(vec![Row::tombstone(dk(1), 5)]);
        let mut merge = MergingRowIterator::new(vec![
            LeveledScanner::new(vec![live], None),
            LeveledScanner::new(vec![dead], None),
        ]);
        let row = merge.next_row().unwrap().expect("one merged row");
        assert!(row.deleted);
    }

    #[test]
    fn test_merge_interleaves_sorted_streams() {
        let a = sst(&[1, 4, 7]);
        let b = sst(&[2, 5, 8]);
        let c = sst(&[3, 6, 9]);
        let mut merge = MergingRowIterator::new(vec![
            LeveledScanner::new(vec![a], None),
            LeveledScanner::new(vec![b], None),
            LeveledScanner::new(vec![c], None),
        ]);
        let mut seen = Vec::new();
        while let Some(row) = merge.next_row().unwrap() {
            seen.push(row.key.token.0);
        }
        assert_eq!(seen, (1..=9).collect::<Vec<_>>());
    }
}
