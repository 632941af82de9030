//! Repair configuration.

use crate::merkle::{RECOMMENDED_DEPTH, RECOMMENDED_MAX_SIZE};

#[derive(Debug, Clone)]
pub struct RepairConfig {
    /// Parallelism of the sessions pool.
    pub session_threads: usize,
    /// Parallelism of the validation (read-only compaction) pool.
    pub validation_threads: usize,
    /// Base phi threshold; sessions require twice this confidence before
    /// failing on a conviction, since wrongly failing a repair is costly.
    pub phi_convict_threshold: f64,
    /// Name of the datacenter this node lives in, for `--local` sessions.
    pub local_datacenter: String,
    /// Depth cap of validator Merkle trees.
    pub tree_max_depth: u8,
    /// Leaf budget of validator Merkle trees.
    pub tree_max_size: usize,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            session_threads: 4,
            validation_threads: 2,
            phi_convict_threshold: 8.0,
            local_datacenter: "datacenter1".to_string(),
            tree_max_depth: RECOMMENDED_DEPTH,
            tree_max_size: RECOMMENDED_MAX_SIZE,
        }
    }
}
