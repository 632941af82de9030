//! Sorted-table records and row scanners.
//!
//! The on-disk format is owned elsewhere; the compaction core sees an
//! `Sstable` as an immutable record — id, level tag, key bounds, byte
//! length — plus an opener that yields a row scanner restricted to an
//! optional token range. The in-memory source backs tests and the
//! validation path.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use merlin_common::{DecoratedKey, Range, StorageError};

/// Level tag for sstables not yet placed in a manifest.
pub const UNPLACED_LEVEL: i32 = -1;

/// Global id counter; sstable ids double as flush-order sequence numbers.
static NEXT_SSTABLE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SstableId(pub u64);

impl fmt::Display for SstableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sst-{}", self.0)
    }
}

/// One partition row as streamed by compaction and validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub key: DecoratedKey,
    /// Write timestamp in seconds; drives reconciliation and tombstone GC.
    pub timestamp: i64,
    /// Row-level tombstone marker.
    pub deleted: bool,
    pub payload: Vec<u8>,
}

impl Row {
    pub fn live(key: DecoratedKey, timestamp: i64, payload: impl Into<Vec<u8>>) -> Row {
        Row { key, timestamp, deleted: false, payload: payload.into() }
    }

    pub fn tombstone(key: DecoratedKey, timestamp: i64) -> Row {
        Row { key, timestamp, deleted: true, payload: Vec::new() }
    }

    /// Uncompressed length this row accounts for: token image + key +
    /// timestamp + flag + payload.
    pub fn encoded_len(&self) -> u64 {
        (16 + self.key.key.len() + 8 + 1 + self.payload.len()) as u64
    }

    /// Stable byte image fed to the repair digest.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len() as usize);
        out.extend_from_slice(&self.key.token.to_be_bytes());
        out.extend_from_slice(&self.key.key);
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.push(self.deleted as u8);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Cursor over the rows of one sstable, in key order.
///
/// `close` must be idempotent; read failures surface as `StorageError` and
/// abort the driving compaction.
pub trait RowScanner: Send {
    fn next_row(&mut self) -> Result<Option<Row>, StorageError>;

    /// Bytes consumed so far.
    fn position(&self) -> u64;

    /// Uncompressed length of the backing sstable.
    fn length(&self) -> u64;

    fn close(&mut self) -> Result<(), StorageError>;
}

/// Opener behind an `Sstable`; the seam between the compaction core and the
/// table format.
pub trait SstableSource: Send + Sync {
    fn open(
        &self,
        sstable: &Sstable,
        range: Option<Range>,
    ) -> Result<Box<dyn RowScanner>, StorageError>;
}

/// Immutable sorted-table record.
#[derive(Clone)]
pub struct Sstable {
    pub id: SstableId,
    /// Level this table was tagged with at creation; `UNPLACED_LEVEL` until
    /// a manifest places it. The manifest's view is authoritative.
    pub level: i32,
    pub first_key: DecoratedKey,
    pub last_key: DecoratedKey,
    pub uncompressed_length: u64,
    source: Arc<dyn SstableSource>,
}

impl Sstable {
    /// Two sstables overlap iff their closed `[first_key, last_key]`
    /// intervals intersect.
    pub fn overlaps(&self, other: &Sstable) -> bool {
        self.first_key <= other.last_key && other.first_key <= self.last_key
    }

    pub fn overlaps_keys(&self, first: &DecoratedKey, last: &DecoratedKey) -> bool {
        self.first_key <= *last && *first <= self.last_key
    }

    pub fn scan(&self, range: Option<Range>) -> Result<Box<dyn RowScanner>, StorageError> {
        self.source.open(self, range)
    }
}

impl fmt::Debug for Sstable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sstable")
            .field("id", &self.id)
            .field("level", &self.level)
            .field("first_key", &self.first_key)
            .field("last_key", &self.last_key)
            .field("uncompressed_length", &self.uncompressed_length)
            .finish()
    }
}

// ── In-memory source ────────────────────────────────────────────────────────

struct MemSource {
    rows: Arc<Vec<Row>>,
}

impl SstableSource for MemSource {
    fn open(
        &self,
        sstable: &Sstable,
        range: Option<Range>,
    ) -> Result<Box<dyn RowScanner>, StorageError> {
        Ok(Box::new(MemScanner {
            rows: self.rows.clone(),
            range,
            index: 0,
            consumed: 0,
            length: sstable.uncompressed_length,
            closed: false,
        }))
    }
}

struct MemScanner {
    rows: Arc<Vec<Row>>,
    range: Option<Range>,
    index: usize,
    consumed: u64,
    length: u64,
    closed: bool,
}

impl RowScanner for MemScanner {
    fn next_row(&mut self) -> Result<Option<Row>, StorageError> {
        while self.index < self.rows.len() {
            let row = &self.rows[self.index];
            self.index += 1;
            self.consumed += row.encoded_len();
            let in_range = self.range.map_or(true, |r| r.contains_token(row.key.token));
            if in_range {
                return Ok(Some(row.clone()));
            }
        }
        Ok(None)
    }

    fn position(&self) -> u64 {
        self.consumed
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn close(&mut self) -> Result<(), StorageError> {
        self.closed = true;
        Ok(())
    }
}

/// Accumulates sorted rows into a new in-memory sstable. Used by the
/// compaction writer and by tests.
pub struct SstableBuilder {
    rows: Vec<Row>,
    bytes: u64,
}

impl SstableBuilder {
    pub fn new() -> SstableBuilder {
        SstableBuilder { rows: Vec::new(), bytes: 0 }
    }

    /// Append a row. Keys MUST arrive in ascending order.
    pub fn add(&mut self, row: Row) {
        if let Some(last) = self.rows.last() {
            assert!(
                last.key < row.key,
                "row {} added out of order wrt {}",
                row.key,
                last.key
            );
        }
        self.bytes += row.encoded_len();
        self.rows.push(row);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn byte_len(&self) -> u64 {
        self.bytes
    }

    pub fn first_key(&self) -> Option<&DecoratedKey> {
        self.rows.first().map(|r| &r.key)
    }

    pub fn last_key(&self) -> Option<&DecoratedKey> {
        self.rows.last().map(|r| &r.key)
    }

    /// Seal the builder into an sstable tagged with `level`.
    ///
    /// Panics if no rows were added; empty output tables are never written.
    pub fn finish(self, level: i32) -> Arc<Sstable> {
        assert!(!self.rows.is_empty(), "refusing to build an empty sstable");
        let first_key = self.rows.first().map(|r| r.key.clone()).expect("non-empty");
        let last_key = self.rows.last().map(|r| r.key.clone()).expect("non-empty");
        Arc::new(Sstable {
            id: SstableId(NEXT_SSTABLE_ID.fetch_add(1, Ordering::Relaxed)),
            level,
            first_key,
            last_key,
            uncompressed_length: self.bytes,
            source: Arc::new(MemSource { rows: Arc::new(self.rows) }),
        })
    }
}

impl Default for SstableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Build an unplaced in-memory sstable from pre-sorted rows.
pub fn sstable_from_rows(rows: Vec<Row>) -> Arc<Sstable> {
    let mut builder = SstableBuilder::new();
    for row in rows {
        builder.add(row);
    }
    builder.finish(UNPLACED_LEVEL)
}

/// Wrap a custom source, for fault-injection in tests.
pub fn sstable_with_source(
    first_key: DecoratedKey,
    last_key: DecoratedKey,
    uncompressed_length: u64,
    level: i32,
    source: Arc<dyn SstableSource>,
) -> Arc<Sstable> {
    Arc::new(Sstable {
        id: SstableId(NEXT_SSTABLE_ID.fetch_add(1, Ordering::Relaxed)),
        level,
        first_key,
        last_key,
        uncompressed_length,
        source,
    })
}
