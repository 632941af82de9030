//! Tree comparison and streaming repair glue.
//!
//! A `Differencer` compares one pair of trees on the anti-entropy stage.
//! Disagreeing ranges become a `SyncRequest` executed by a
//! `StreamingRepairTask`; the task's completion callback reports back so
//! the owning job can count the pair as synced. Stream transfer itself is
//! an external collaborator behind `StreamExecutor`.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use merlin_common::{Range, SessionId};

use crate::merkle::MerkleTree;
use crate::messages::{SyncRequest, TreeResponse};
use crate::service::RepairService;

/// Compares two replicas' trees for one table.
///
/// Identity (equality, hashing) is the `(session, table, endpoint pair)`
/// triple — what the differencer coordinator counts completions against.
#[derive(Clone)]
pub struct Differencer {
    pub session_id: SessionId,
    pub keyspace: String,
    pub cfname: String,
    pub r1: TreeResponse,
    pub r2: TreeResponse,
}

impl PartialEq for Differencer {
    fn eq(&self, other: &Self) -> bool {
        self.session_id == other.session_id
            && self.cfname == other.cfname
            && self.r1.endpoint == other.r1.endpoint
            && self.r2.endpoint == other.r2.endpoint
    }
}

impl Eq for Differencer {}

impl Hash for Differencer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.session_id.hash(state);
        self.cfname.hash(state);
        self.r1.endpoint.hash(state);
        self.r2.endpoint.hash(state);
    }
}

impl fmt::Debug for Differencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#<Differencer {}<->{}/{}>", self.r1.endpoint, self.r2.endpoint, self.cfname)
    }
}

impl Differencer {
    /// Compare the trees and either complete immediately (consistent) or
    /// launch streaming repair for the disagreeing ranges. Runs on the
    /// anti-entropy stage.
    pub fn run(&self, service: &Arc<RepairService>) {
        let differences = MerkleTree::difference(&self.r1.tree, &self.r2.tree);

        if differences.is_empty() {
            info!(
                "[repair #{}] Endpoints {} and {} are consistent for {}",
                self.session_id, self.r1.endpoint, self.r2.endpoint, self.cfname
            );
            service.sync_complete(self);
            return;
        }

        info!(
            "[repair #{}] Endpoints {} and {} have {} range(s) out of sync for {}",
            self.session_id,
            self.r1.endpoint,
            self.r2.endpoint,
            differences.len(),
            self.cfname
        );

        let request = SyncRequest {
            initiator: service.local_endpoint(),
            src: self.r1.endpoint,
            dst: self.r2.endpoint,
            ranges: differences,
        };
        let task = StreamingRepairTask::new(&self.keyspace, &self.cfname, request);

        let service_cb = service.clone();
        let key = self.clone();
        service.launch_stream(
            task,
            Box::new(move |succeeded| {
                if succeeded {
                    service_cb.sync_complete(&key);
                } else {
                    service_cb.stream_failed(&key);
                }
            }),
        );
    }
}

/// One streaming exchange between a pair of replicas.
///
/// The id is task-local (a fresh random id per launch, as on the legacy
/// wire); session attribution travels in the keyspace/table description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingRepairTask {
    pub id: Uuid,
    pub keyspace: String,
    pub cfname: String,
    pub request: SyncRequest,
}

impl StreamingRepairTask {
    pub fn new(keyspace: &str, cfname: &str, request: SyncRequest) -> StreamingRepairTask {
        StreamingRepairTask {
            id: Uuid::new_v4(),
            keyspace: keyspace.to_string(),
            cfname: cfname.to_string(),
            request,
        }
    }

    pub fn ranges(&self) -> &[Range] {
        &self.request.ranges
    }
}

/// Completion callback for a launched stream; `true` means both directions
/// finished.
pub type StreamCallback = Box<dyn FnOnce(bool) + Send>;

/// Seam to the streaming subsystem.
pub trait StreamExecutor: Send + Sync {
    fn stream(&self, task: StreamingRepairTask, on_done: StreamCallback);
}

/// Completes every stream immediately. Stands in where data movement is
/// external (and in tests that only observe control flow).
pub struct NoopStreamExecutor;

impl StreamExecutor for NoopStreamExecutor {
    fn stream(&self, task: StreamingRepairTask, on_done: StreamCallback) {
        info!(
            task = %task.id,
            src = %task.request.src,
            dst = %task.request.dst,
            ranges = task.request.ranges.len(),
            "streaming repair (no-op executor)"
        );
        on_done(true);
    }
}
