//! Anti-entropy repair core.
//!
//! A repair session compares one token range across the replicas that
//! share it:
//!
//! ```text
//!  operator ──▶ RepairService ──▶ RepairSession ──▶ RepairJob (per table)
//!                    │                  │               │ tree requests
//!                    │           FailureDetector        ▼
//!                    │                           Validator (per replica)
//!                    │                                   │ tree responses
//!                    ▼                                   ▼
//!             anti-entropy stage ◀── rendezvous ── all trees received
//!                    │
//!                    ▼
//!              Differencer (per tree pair) ──▶ StreamingRepairTask
//! ```
//!
//! Trees are built by a read-only compaction on each replica, compared
//! pairwise on a single-threaded stage, and disagreeing ranges are handed
//! to streaming. A failure-detector conviction of any session member fails
//! the whole session — repairing against a dead or restarted peer would
//! reconcile incorrectly.

pub mod config;
pub mod coordinator;
pub mod differencer;
pub mod failure;
pub mod hints;
pub mod merkle;
pub mod messages;
pub mod service;
pub mod session;
pub mod topology;
pub mod validator;

pub use config::RepairConfig;
pub use coordinator::{DispatchPolicy, RequestCoordinator};
pub use differencer::{
    Differencer, NoopStreamExecutor, StreamCallback, StreamExecutor, StreamingRepairTask,
};
pub use failure::{FailureDetector, FailureListener};
pub use hints::{
    HintSink, HintStore, HintsConfig, HintsDescriptor, HintsDispatchExecutor, RateLimiter,
};
pub use merkle::{Digest, MerkleNode, MerkleTree, EMPTY_DIGEST};
pub use messages::{SnapshotCommand, SyncRequest, TreeRequest, TreeResponse};
pub use service::{
    RepairMetricsSnapshot, RepairService, RepairTransport, StaticStoreResolver, StoreResolver,
};
pub use session::{RepairSession, SessionState};
pub use topology::{neighbors, ReplicaMap, StaticReplicaMap};
pub use validator::Validator;
