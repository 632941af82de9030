//! Merkle tree builder.
//!
//! Lifecycle, driven by a read-only compaction over one table's sstables:
//!
//! 1. `prepare()` — shape the tree. Order-preserving partitioners sample
//!    keys from the table index and split until the tree refuses; hashed
//!    partitioners get an even split.
//! 2. `add()` — once per row, in strictly ascending key order. Skipped
//!    leaves are flushed as empty; the row's SHA-256 digest is XOR-folded
//!    into its leaf.
//! 3. `complete()` — flush the remaining leaves; the finished tree is then
//!    handed to the anti-entropy stage for response.
//!
//! Out-of-order rows are a programmer bug and assert, never silently
//! reorder.

use rand::seq::SliceRandom;
use sha2::{Digest as _, Sha256};
use tracing::debug;

use merlin_common::{DecoratedKey, Partitioner, StorageError};
use merlin_storage::{Row, TableStore};

use crate::config::RepairConfig;
use crate::merkle::{Digest, MerkleTree, EMPTY_DIGEST};
use crate::messages::TreeRequest;

pub struct Validator {
    pub request: TreeRequest,
    tree: MerkleTree,
    leaf_ranges: Vec<merlin_common::Range>,
    /// In-order index of the leaf currently being filled; `None` until the
    /// first row arrives.
    current_leaf: Option<usize>,
    last_key: Option<DecoratedKey>,
    validated: u64,
    prepared: bool,
    completed: bool,
}

impl Validator {
    pub fn new(request: TreeRequest, config: &RepairConfig) -> Validator {
        let tree = MerkleTree::new(request.range, config.tree_max_depth, config.tree_max_size);
        Validator {
            request,
            tree,
            leaf_ranges: Vec::new(),
            current_leaf: None,
            last_key: None,
            validated: 0,
            prepared: false,
            completed: false,
        }
    }

    /// Shape the tree from the table's key distribution.
    pub fn prepare(
        &mut self,
        store: &TableStore,
        partitioner: &dyn Partitioner,
    ) -> Result<(), StorageError> {
        if !partitioner.preserves_order() {
            // you can't beat an even distribution for a uniform hash
            self.tree.init();
        } else {
            let samples = store.key_samples(&self.request.range)?;
            for sample in &samples {
                assert!(
                    self.request.range.contains_token(sample.token),
                    "sampled token {} is not within range {}",
                    sample.token,
                    self.request.range
                );
            }
            if samples.is_empty() {
                self.tree.init();
            } else {
                let mut rng = rand::thread_rng();
                loop {
                    let sample = samples.choose(&mut rng).expect("samples checked non-empty");
                    if !self.tree.split(sample.token) {
                        break;
                    }
                }
            }
        }
        self.leaf_ranges = self.tree.leaf_ranges();
        self.prepared = true;
        debug!(
            session = %self.request.session_id,
            leaves = self.leaf_ranges.len(),
            "prepared validation tree for {}",
            self.request
        );
        Ok(())
    }

    /// Fold one row into the tree. Rows MUST arrive in ascending key order
    /// and inside the requested range.
    pub fn add(&mut self, row: &Row) {
        assert!(self.prepared, "Validator was not prepared()");
        assert!(!self.completed, "add after complete()");
        assert!(
            self.request.range.contains_token(row.key.token),
            "{} is not contained in {}",
            row.key.token,
            self.request.range
        );
        assert!(
            self.last_key.as_ref().map_or(true, |last| last < &row.key),
            "row {} received out of order wrt {:?}",
            row.key,
            self.last_key
        );
        self.last_key = Some(row.key.clone());

        let mut leaf = self.current_leaf.unwrap_or(0);
        // flush skipped leaves as empty until we reach the row's leaf
        while !self.leaf_ranges[leaf].contains_token(row.key.token) {
            self.tree.add_leaf_hash(leaf, EMPTY_DIGEST);
            leaf += 1;
            assert!(leaf < self.leaf_ranges.len(), "row {} beyond the last leaf", row.key);
        }
        self.current_leaf = Some(leaf);

        self.tree.add_leaf_hash(leaf, row_digest(row));
        self.validated += 1;
    }

    /// Flush every remaining leaf as empty and seal the tree.
    pub fn complete(&mut self) {
        assert!(self.prepared, "Validator was not prepared()");
        assert!(!self.completed, "complete() called twice");
        let start = self.current_leaf.unwrap_or(0);
        for leaf in start..self.leaf_ranges.len() {
            self.tree.add_leaf_hash(leaf, EMPTY_DIGEST);
        }
        self.completed = true;
        debug!(
            session = %self.request.session_id,
            validated = self.validated,
            "validated rows into repair tree for {}",
            self.request
        );
    }

    pub fn validated_rows(&self) -> u64 {
        self.validated
    }

    /// The finished tree. Panics if called before `complete()`.
    pub fn into_tree(self) -> MerkleTree {
        assert!(self.completed, "tree taken before complete()");
        self.tree
    }

    pub fn tree(&self) -> &MerkleTree {
        &self.tree
    }
}

/// SHA-256 of the row's canonical byte image. XOR-folding needs every
/// output bit to carry entropy, hence a full-width digest.
fn row_digest(row: &Row) -> Digest {
    let digest = Sha256::digest(row.canonical_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Digest(out)
}
