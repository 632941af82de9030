//! Repair message shapes. Wire encodings live in `merlin_protocol`.

use std::fmt;
use std::sync::Arc;

use merlin_common::{Endpoint, Range, SessionId};

use crate::merkle::MerkleTree;

/// A request for one replica to build a Merkle tree over `range`.
///
/// `endpoint` is contextual: on the initiator it names the replica the
/// request is addressed to, on the replica it names the initiator the
/// finished tree must be returned to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TreeRequest {
    pub session_id: SessionId,
    pub endpoint: Endpoint,
    /// Rows with a deletion timestamp older than this (seconds) are
    /// GC-eligible and excluded from the digest.
    pub gc_before: i32,
    pub keyspace: String,
    pub table: String,
    pub range: Range,
}

impl fmt::Display for TreeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#<TreeRequest {}, {}, {}, {}.{}, {}>",
            self.session_id, self.endpoint, self.gc_before, self.keyspace, self.table, self.range
        )
    }
}

/// A completed tree, paired with the replica that built it.
#[derive(Debug, Clone)]
pub struct TreeResponse {
    pub endpoint: Endpoint,
    pub tree: Arc<MerkleTree>,
}

/// Asks `src` and `dst` to exchange data for the disagreeing ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub initiator: Endpoint,
    pub src: Endpoint,
    pub dst: Endpoint,
    pub ranges: Vec<Range>,
}

/// Pre-repair snapshot instruction sent to every endpoint of a sequential
/// session. The `ephemeral` flag is carried opaquely (always `false` here)
/// pending clarification of its exact semantics on the table-format side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotCommand {
    pub keyspace: String,
    pub table: String,
    pub session_id: SessionId,
    pub ephemeral: bool,
}
