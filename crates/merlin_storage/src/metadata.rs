//! Sstable stats sidecar.
//!
//! A compact, human-renderable summary of one sstable, persisted as JSON
//! next to the table. The `sstmeta` tool pretty-prints these; the core
//! treats them as read-only inputs.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use merlin_common::StorageError;

use crate::sst::Sstable;

/// Row-size histogram bucket: `count` rows at most `le` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramBucket {
    pub le: u64,
    pub count: u64,
}

const ROW_SIZE_BUCKETS: [u64; 8] = [64, 128, 256, 1024, 4096, 16_384, 65_536, u64::MAX];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SstableStats {
    pub sstable_id: u64,
    pub level: i32,
    pub uncompressed_length: u64,
    pub estimated_row_count: u64,
    pub tombstone_count: u64,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub row_size_histogram: Vec<HistogramBucket>,
}

impl SstableStats {
    /// Scan an sstable and summarize it.
    pub fn collect(sstable: &Sstable) -> Result<SstableStats, StorageError> {
        let mut scanner = sstable.scan(None)?;
        let mut row_count = 0u64;
        let mut tombstone_count = 0u64;
        let mut min_timestamp = i64::MAX;
        let mut max_timestamp = i64::MIN;
        let mut buckets = vec![0u64; ROW_SIZE_BUCKETS.len()];

        while let Some(row) = scanner.next_row()? {
            row_count += 1;
            if row.deleted {
                tombstone_count += 1;
            }
            min_timestamp = min_timestamp.min(row.timestamp);
            max_timestamp = max_timestamp.max(row.timestamp);
            let size = row.encoded_len();
            let slot = ROW_SIZE_BUCKETS.iter().position(|&le| size <= le).unwrap_or(0);
            buckets[slot] += 1;
        }
        scanner.close()?;

        if row_count == 0 {
            min_timestamp = 0;
            max_timestamp = 0;
        }

        Ok(SstableStats {
            sstable_id: sstable.id.0,
            level: sstable.level,
            uncompressed_length: sstable.uncompressed_length,
            estimated_row_count: row_count,
            tombstone_count,
            min_timestamp,
            max_timestamp,
            row_size_histogram: ROW_SIZE_BUCKETS
                .iter()
                .zip(buckets)
                .map(|(&le, count)| HistogramBucket { le, count })
                .collect(),
        })
    }

    pub fn write_json(&self, path: &Path) -> Result<(), StorageError> {
        let body = serde_json::to_vec_pretty(self)
            .map_err(|e| StorageError::ScanFailed { sstable_id: self.sstable_id, detail: e.to_string() })?;
        fs::write(path, body)?;
        Ok(())
    }

    pub fn read_json(path: &Path) -> Result<SstableStats, std::io::Error> {
        let body = fs::read(path)?;
        serde_json::from_slice(&body)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Text rendering, one field per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("SSTable:              sst-{}\n", self.sstable_id));
        out.push_str(&format!("Level:                {}\n", self.level));
        out.push_str(&format!("Uncompressed length:  {} bytes\n", self.uncompressed_length));
        out.push_str(&format!("Estimated rows:       {}\n", self.estimated_row_count));
        out.push_str(&format!("Tombstones:           {}\n", self.tombstone_count));
        out.push_str(&format!("Timestamps:           [{}, {}]\n", self.min_timestamp, self.max_timestamp));
        out.push_str("Row size histogram:\n");
        for bucket in &self.row_size_histogram {
            if bucket.le == u64::MAX {
                out.push_str(&format!("  <= inf:   {}\n", bucket.count));
            } else {
                out.push_str(&format!("  <= {}: {}\n", bucket.le, bucket.count));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sst::{sstable_from_rows, Row};
    use merlin_common::{DecoratedKey, Token};

    fn dk(t: u128) -> DecoratedKey {
        DecoratedKey::new(Token(t), t.to_be_bytes().to_vec())
    }

    fn sample_stats() -> SstableStats {
        let table = sstable_from_rows(vec![
            Row::live(dk(1), 100, b"small".to_vec()),
            Row::tombstone(dk(2), 250),
            Row::live(dk(3), 50, vec![0u8; 500]),
        ]);
        SstableStats::collect(&table).unwrap()
    }

    #[test]
    fn test_collect_counts_rows_and_tombstones() {
        let stats = sample_stats();
        assert_eq!(stats.estimated_row_count, 3);
        assert_eq!(stats.tombstone_count, 1);
        assert_eq!(stats.min_timestamp, 50);
        assert_eq!(stats.max_timestamp, 250);
        let histogram_total: u64 = stats.row_size_histogram.iter().map(|b| b.count).sum();
        assert_eq!(histogram_total, 3);
    }

    #[test]
    fn test_json_round_trip() {
        let stats = sample_stats();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sst-1.stats.json");
        stats.write_json(&path).unwrap();
        let loaded = SstableStats::read_json(&path).unwrap();
        assert_eq!(loaded, stats);
    }

    #[test]
    fn test_render_mentions_key_fields() {
        let stats = sample_stats();
        let text = stats.render();
        assert!(text.contains("Level:"));
        assert!(text.contains("Estimated rows:       3"));
        assert!(text.contains("Row size histogram:"));
    }
}
