//! Balanced binary hash tree over a token range.
//!
//! Leaves summarize the rows of their sub-range with a 256-bit digest; an
//! inner node's hash is the XOR of its children. XOR makes a node's hash
//! equal to the XOR of every row hash below it regardless of leaf
//! structure, which is what lets two replicas with identical data agree on
//! every aligned sub-range.
//!
//! A freshly built leaf is *invalid* (no digest) until the validator folds
//! at least one hash into it; `EMPTY_DIGEST` marks an empty-but-validated
//! leaf.

use std::fmt;

use merlin_common::{Range, Token};

/// 256-bit leaf digest, folded by XOR.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest(pub [u8; 32]);

/// Digest of an empty leaf: the XOR identity.
pub const EMPTY_DIGEST: Digest = Digest([0u8; 32]);

impl Digest {
    pub fn xor_with(&mut self, other: &Digest) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a ^= b;
        }
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..")
    }
}

/// One tree node. Public so the wire serializer can walk the structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MerkleNode {
    Leaf { digest: Option<Digest> },
    Inner { midpoint: Token, left: Box<MerkleNode>, right: Box<MerkleNode> },
}

impl MerkleNode {
    fn leaf() -> MerkleNode {
        MerkleNode::Leaf { digest: None }
    }

    fn subtree_hash(&self) -> Option<Digest> {
        match self {
            MerkleNode::Leaf { digest } => *digest,
            MerkleNode::Inner { left, right, .. } => {
                let (l, r) = (left.subtree_hash()?, right.subtree_hash()?);
                let mut out = l;
                out.xor_with(&r);
                Some(out)
            }
        }
    }

    fn count_leaves(&self) -> usize {
        match self {
            MerkleNode::Leaf { .. } => 1,
            MerkleNode::Inner { left, right, .. } => left.count_leaves() + right.count_leaves(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    range: Range,
    max_depth: u8,
    max_size: usize,
    root: MerkleNode,
    leaf_count: usize,
}

/// Default depth cap; enough to isolate single rows at practical sizes.
pub const RECOMMENDED_DEPTH: u8 = 64;

/// Default leaf budget (2^15 leaves).
pub const RECOMMENDED_MAX_SIZE: usize = 1 << 15;

enum SplitStep {
    /// The token is now (or already was) a leaf boundary.
    Done,
    /// Depth or size cap reached; sampling must stop.
    Capped,
    /// One split performed, token not yet a boundary.
    Again,
}

impl MerkleTree {
    pub fn new(range: Range, max_depth: u8, max_size: usize) -> MerkleTree {
        assert!(max_size >= 1);
        MerkleTree { range, max_depth, max_size, root: MerkleNode::leaf(), leaf_count: 1 }
    }

    pub fn with_defaults(range: Range) -> MerkleTree {
        MerkleTree::new(range, RECOMMENDED_DEPTH, RECOMMENDED_MAX_SIZE)
    }

    /// Rebuild a tree from its wire parts.
    pub fn from_parts(range: Range, max_depth: u8, max_size: usize, root: MerkleNode) -> MerkleTree {
        let leaf_count = root.count_leaves();
        MerkleTree { range, max_depth, max_size, root, leaf_count }
    }

    pub fn range(&self) -> Range {
        self.range
    }

    pub fn max_depth(&self) -> u8 {
        self.max_depth
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn root(&self) -> &MerkleNode {
        &self.root
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Split every leaf evenly until the leaf budget is spent. The right
    /// starting point when key distribution is unknown or uniform.
    pub fn init(&mut self) {
        while self.leaf_count * 2 <= self.max_size {
            if !self.split_all_leaves() {
                break;
            }
        }
    }

    fn split_all_leaves(&mut self) -> bool {
        fn go(node: &mut MerkleNode, range: Range, depth: u8, max_depth: u8, split: &mut usize) {
            match node {
                MerkleNode::Leaf { .. } => {
                    if depth >= max_depth {
                        return;
                    }
                    let mid = range.midpoint();
                    if mid == range.left || mid == range.right {
                        return;
                    }
                    *node = MerkleNode::Inner {
                        midpoint: mid,
                        left: Box::new(MerkleNode::leaf()),
                        right: Box::new(MerkleNode::leaf()),
                    };
                    *split += 1;
                }
                MerkleNode::Inner { midpoint, left, right } => {
                    let mid = *midpoint;
                    go(left, Range::new(range.left, mid), depth + 1, max_depth, split);
                    go(right, Range::new(mid, range.right), depth + 1, max_depth, split);
                }
            }
        }
        let mut split = 0;
        go(&mut self.root, self.range, 0, self.max_depth, &mut split);
        self.leaf_count += split;
        split > 0
    }

    /// Split the leaf containing `token` at its midpoint, repeatedly, until
    /// the token becomes a leaf boundary. Returns `false` when the depth or
    /// size cap stops the process first — the sampling loop's exit signal.
    pub fn split(&mut self, token: Token) -> bool {
        assert!(self.range.contains_token(token), "{} outside tree range {}", token, self.range);
        loop {
            match self.split_once(token) {
                SplitStep::Done => return true,
                SplitStep::Capped => return false,
                SplitStep::Again => continue,
            }
        }
    }

    fn split_once(&mut self, token: Token) -> SplitStep {
        fn go(
            node: &mut MerkleNode,
            range: Range,
            depth: u8,
            max_depth: u8,
            leaf_count: &mut usize,
            max_size: usize,
            token: Token,
        ) -> SplitStep {
            match node {
                MerkleNode::Leaf { .. } => {
                    if token == range.right {
                        return SplitStep::Done;
                    }
                    if depth >= max_depth || *leaf_count >= max_size {
                        return SplitStep::Capped;
                    }
                    let mid = range.midpoint();
                    if mid == range.left || mid == range.right {
                        return SplitStep::Capped;
                    }
                    *node = MerkleNode::Inner {
                        midpoint: mid,
                        left: Box::new(MerkleNode::leaf()),
                        right: Box::new(MerkleNode::leaf()),
                    };
                    *leaf_count += 1;
                    if mid == token {
                        SplitStep::Done
                    } else {
                        SplitStep::Again
                    }
                }
                MerkleNode::Inner { midpoint, left, right } => {
                    let mid = *midpoint;
                    let left_range = Range::new(range.left, mid);
                    if left_range.contains_token(token) {
                        go(left, left_range, depth + 1, max_depth, leaf_count, max_size, token)
                    } else {
                        go(
                            right,
                            Range::new(mid, range.right),
                            depth + 1,
                            max_depth,
                            leaf_count,
                            max_size,
                            token,
                        )
                    }
                }
            }
        }
        go(
            &mut self.root,
            self.range,
            0,
            self.max_depth,
            &mut self.leaf_count,
            self.max_size,
            token,
        )
    }

    /// Leaf sub-ranges in ring order.
    pub fn leaf_ranges(&self) -> Vec<Range> {
        fn go(node: &MerkleNode, range: Range, out: &mut Vec<Range>) {
            match node {
                MerkleNode::Leaf { .. } => out.push(range),
                MerkleNode::Inner { midpoint, left, right } => {
                    go(left, Range::new(range.left, *midpoint), out);
                    go(right, Range::new(*midpoint, range.right), out);
                }
            }
        }
        let mut out = Vec::with_capacity(self.leaf_count);
        go(&self.root, self.range, &mut out);
        out
    }

    /// XOR `digest` into the leaf at in-order position `index`, validating
    /// it. Folding `EMPTY_DIGEST` marks an empty leaf as validated.
    pub fn add_leaf_hash(&mut self, index: usize, digest: Digest) {
        fn go(node: &mut MerkleNode, remaining: &mut usize, digest: &Digest) -> bool {
            match node {
                MerkleNode::Leaf { digest: slot } => {
                    if *remaining == 0 {
                        let mut current = slot.unwrap_or(EMPTY_DIGEST);
                        current.xor_with(digest);
                        *slot = Some(current);
                        true
                    } else {
                        *remaining -= 1;
                        false
                    }
                }
                MerkleNode::Inner { left, right, .. } => {
                    go(left, remaining, digest) || go(right, remaining, digest)
                }
            }
        }
        let mut remaining = index;
        let found = go(&mut self.root, &mut remaining, &digest);
        assert!(found, "leaf index {} out of bounds ({} leaves)", index, self.leaf_count);
    }

    /// Root digest; `None` while any leaf is still invalid.
    pub fn root_hash(&self) -> Option<Digest> {
        self.root.subtree_hash()
    }

    /// Hash of an aligned sub-range: the subtree hash when `target` lands
    /// exactly on a node, `None` when the target is below leaf granularity
    /// or any involved leaf is invalid.
    pub fn hash_of_range(&self, target: &Range) -> Option<Digest> {
        fn go(node: &MerkleNode, range: Range, target: &Range) -> Option<Digest> {
            if range == *target {
                return node.subtree_hash();
            }
            match node {
                MerkleNode::Leaf { .. } => None,
                MerkleNode::Inner { midpoint, left, right } => {
                    let left_range = Range::new(range.left, *midpoint);
                    let right_range = Range::new(*midpoint, range.right);
                    if left_range.contains_range(target) {
                        go(left, left_range, target)
                    } else if right_range.contains_range(target) {
                        go(right, right_range, target)
                    } else {
                        None
                    }
                }
            }
        }
        go(&self.root, self.range, target)
    }

    fn has_children_in(&self, target: &Range) -> bool {
        fn go(node: &MerkleNode, range: Range, target: &Range) -> bool {
            if range == *target {
                return matches!(node, MerkleNode::Inner { .. });
            }
            match node {
                MerkleNode::Leaf { .. } => false,
                MerkleNode::Inner { midpoint, left, right } => {
                    let left_range = Range::new(range.left, *midpoint);
                    let right_range = Range::new(*midpoint, range.right);
                    if left_range.contains_range(target) {
                        go(left, left_range, target)
                    } else if right_range.contains_range(target) {
                        go(right, right_range, target)
                    } else {
                        false
                    }
                }
            }
        }
        go(&self.root, self.range, target)
    }

    /// Sub-ranges where the two trees disagree. Both trees must cover the
    /// same full range. Recursion follows aligned midpoint bisection and
    /// stops at the coarser tree's leaves, so structure mismatches yield
    /// conservative (over-wide) ranges rather than misses.
    pub fn difference(a: &MerkleTree, b: &MerkleTree) -> Vec<Range> {
        assert_eq!(a.range, b.range, "cannot difference trees over different ranges");
        let mut out = Vec::new();
        Self::diff_range(a, b, a.range, &mut out);
        out
    }

    fn diff_range(a: &MerkleTree, b: &MerkleTree, range: Range, out: &mut Vec<Range>) {
        let ha = a.hash_of_range(&range);
        let hb = b.hash_of_range(&range);
        match (ha, hb) {
            (Some(x), Some(y)) if x == y => {}
            (Some(_), Some(_)) => {
                if a.has_children_in(&range) && b.has_children_in(&range) {
                    let mid = range.midpoint();
                    if mid == range.left || mid == range.right {
                        out.push(range);
                        return;
                    }
                    Self::diff_range(a, b, Range::new(range.left, mid), out);
                    Self::diff_range(a, b, Range::new(mid, range.right), out);
                } else {
                    out.push(range);
                }
            }
            // one side cannot resolve the range: stream it conservatively
            _ => out.push(range),
        }
    }
}
