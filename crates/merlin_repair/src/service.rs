//! Process-scoped repair coordinator.
//!
//! Owns the active-session map, the thread stages, and the seams to the
//! outside world (transport, streaming, store resolution, placement).
//! Handlers receive the service explicitly; there is no global instance.
//!
//! Threading:
//! - sessions pool      — runs `RepairSession::run`, parallel across sessions
//! - validation pool    — read-only compactions building trees
//! - anti-entropy stage — single-threaded; rendezvous, differencing and
//!   completion accounting are linearizable per node

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use merlin_common::{
    Endpoint, Partitioner, Range, RepairError, SessionId, StageExecutor, StorageError,
};
use merlin_storage::TableStore;

use crate::config::RepairConfig;
use crate::differencer::{Differencer, StreamCallback, StreamExecutor, StreamingRepairTask};
use crate::failure::{FailureDetector, FailureListener};
use crate::merkle::MerkleTree;
use crate::messages::{SnapshotCommand, TreeRequest};
use crate::session::{RepairSession, SessionState};
use crate::topology::{neighbors, ReplicaMap};
use crate::validator::Validator;

/// Fallback tombstone grace when a table cannot be resolved locally.
const FALLBACK_GC_GRACE_SECONDS: i64 = 864_000;

/// Outgoing message seam. Implementations must not call back into the
/// service on the sending thread (deliveries are expected to arrive on
/// their own threads, as a real transport's would).
pub trait RepairTransport: Send + Sync {
    fn tree_request(&self, to: Endpoint, from: Endpoint, request: TreeRequest);
    fn tree_response(&self, to: Endpoint, from: Endpoint, request: TreeRequest, tree: MerkleTree);
    fn snapshot_command(
        &self,
        to: Endpoint,
        command: SnapshotCommand,
        ack: Box<dyn FnOnce() + Send>,
    );
}

/// Table lookup for gc-grace and validation scans.
pub trait StoreResolver: Send + Sync {
    fn resolve(&self, keyspace: &str, table: &str) -> Option<Arc<TableStore>>;
}

/// Resolver over a fixed set of registered stores.
#[derive(Default)]
pub struct StaticStoreResolver {
    stores: DashMap<(String, String), Arc<TableStore>>,
}

impl StaticStoreResolver {
    pub fn new() -> StaticStoreResolver {
        StaticStoreResolver::default()
    }

    pub fn register(&self, store: Arc<TableStore>) {
        self.stores.insert((store.keyspace.clone(), store.table.clone()), store);
    }
}

impl StoreResolver for StaticStoreResolver {
    fn resolve(&self, keyspace: &str, table: &str) -> Option<Arc<TableStore>> {
        self.stores.get(&(keyspace.to_string(), table.to_string())).map(|e| e.value().clone())
    }
}

#[derive(Debug, Default)]
pub struct RepairMetrics {
    pub sessions_started: AtomicU64,
    pub sessions_succeeded: AtomicU64,
    pub sessions_failed: AtomicU64,
    pub trees_received: AtomicU64,
    pub validations_run: AtomicU64,
    pub streams_launched: AtomicU64,
}

impl RepairMetrics {
    pub fn snapshot(&self) -> RepairMetricsSnapshot {
        RepairMetricsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_succeeded: self.sessions_succeeded.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            trees_received: self.trees_received.load(Ordering::Relaxed),
            validations_run: self.validations_run.load(Ordering::Relaxed),
            streams_launched: self.streams_launched.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RepairMetricsSnapshot {
    pub sessions_started: u64,
    pub sessions_succeeded: u64,
    pub sessions_failed: u64,
    pub trees_received: u64,
    pub validations_run: u64,
    pub streams_launched: u64,
}

pub struct RepairService {
    config: RepairConfig,
    partitioner: Arc<dyn Partitioner>,
    transport: Arc<dyn RepairTransport>,
    streamer: Arc<dyn StreamExecutor>,
    resolver: Arc<dyn StoreResolver>,
    replica_map: Arc<dyn ReplicaMap>,
    failure_detector: Arc<FailureDetector>,
    sessions: DashMap<SessionId, Arc<RepairSession>>,
    session_pool: StageExecutor,
    validation_pool: StageExecutor,
    anti_entropy_stage: StageExecutor,
    metrics: RepairMetrics,
}

impl RepairService {
    pub fn new(
        config: RepairConfig,
        partitioner: Arc<dyn Partitioner>,
        transport: Arc<dyn RepairTransport>,
        streamer: Arc<dyn StreamExecutor>,
        resolver: Arc<dyn StoreResolver>,
        replica_map: Arc<dyn ReplicaMap>,
    ) -> Arc<RepairService> {
        let failure_detector = Arc::new(FailureDetector::new(config.phi_convict_threshold));
        let session_pool = StageExecutor::new("AntiEntropySessions", config.session_threads);
        let validation_pool = StageExecutor::new("ValidationExecutor", config.validation_threads);
        let anti_entropy_stage = StageExecutor::single("AntiEntropyStage");
        Arc::new(RepairService {
            config,
            partitioner,
            transport,
            streamer,
            resolver,
            replica_map,
            failure_detector,
            sessions: DashMap::new(),
            session_pool,
            validation_pool,
            anti_entropy_stage,
            metrics: RepairMetrics::default(),
        })
    }

    pub fn config(&self) -> &RepairConfig {
        &self.config
    }

    pub fn failure_detector(&self) -> &Arc<FailureDetector> {
        &self.failure_detector
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.replica_map.local_endpoint()
    }

    pub fn metrics(&self) -> &RepairMetrics {
        &self.metrics
    }

    pub(crate) fn transport(&self) -> Arc<dyn RepairTransport> {
        self.transport.clone()
    }

    pub(crate) fn submit_to_stage(&self, task: impl FnOnce() + Send + 'static) {
        self.anti_entropy_stage.submit(task);
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<RepairSession>> {
        self.sessions.get(&id).map(|e| e.value().clone())
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Start a repair of `range` for the named tables. Returns the session
    /// handle; a session with no neighbors to repair with is immediately
    /// `Done` and never queued.
    pub fn submit_repair_session(
        self: &Arc<Self>,
        range: Range,
        keyspace: &str,
        is_sequential: bool,
        is_local: bool,
        cfnames: &[&str],
    ) -> Result<Arc<RepairSession>, RepairError> {
        let endpoints = neighbors(
            self.replica_map.as_ref(),
            keyspace,
            &range,
            is_local,
            &self.config.local_datacenter,
        )?;

        let session = RepairSession::new(
            SessionId::new_v4(),
            keyspace.to_string(),
            cfnames.iter().map(|s| s.to_string()).collect(),
            range,
            is_sequential,
            endpoints,
            self.local_endpoint(),
            self.config.phi_convict_threshold,
        );

        if session.endpoints().is_empty() {
            info!(
                "[repair #{}] no neighbors to repair with on range {}: session completed",
                session.id(),
                range
            );
            session.set_state(SessionState::Done);
            session.differencing_done.signal_all();
            session.completed.signal_all();
            return Ok(session);
        }

        self.sessions.insert(session.id(), session.clone());
        let listener: Arc<dyn FailureListener> = session.clone();
        self.failure_detector.register(&listener);
        self.metrics.sessions_started.fetch_add(1, Ordering::Relaxed);

        let service = self.clone();
        let running = session.clone();
        self.session_pool.submit(move || {
            running.run(&service);
            match running.state() {
                SessionState::Done => {
                    service.metrics.sessions_succeeded.fetch_add(1, Ordering::Relaxed)
                }
                _ => service.metrics.sessions_failed.fetch_add(1, Ordering::Relaxed),
            };
            let listener: Arc<dyn FailureListener> = running.clone();
            service.failure_detector.unregister(&listener);
            service.sessions.remove(&running.id());
        });

        Ok(session)
    }

    /// Force-shutdown every active session.
    pub fn terminate_sessions(&self) {
        for entry in self.sessions.iter() {
            entry.value().force_shutdown();
        }
    }

    /// Verb handler: a peer (or this node) asked us to build a tree.
    /// Submits a read-only validation compaction; the finished tree is
    /// returned to `from` via the anti-entropy stage.
    pub fn handle_tree_request(self: &Arc<Self>, from: Endpoint, request: TreeRequest) {
        // respond to the requester, whoever the request named
        let request = TreeRequest { endpoint: from, ..request };
        let service = self.clone();
        self.validation_pool.submit(move || service.run_validation(request));
    }

    fn run_validation(self: &Arc<Self>, request: TreeRequest) {
        let store = match self.resolver.resolve(&request.keyspace, &request.table) {
            Some(store) => store,
            None => {
                warn!("dropping tree request for unknown table {}.{}", request.keyspace, request.table);
                return;
            }
        };

        debug!("queueing validation compaction for {}", request);
        let mut validator = Validator::new(request.clone(), &self.config);
        let outcome: Result<(), StorageError> = (|| {
            validator.prepare(&store, self.partitioner.as_ref())?;
            let mut scan = store.validation_scan(&request.range)?;
            while let Some(row) = scan.next_row()? {
                if row.deleted && row.timestamp < request.gc_before as i64 {
                    continue;
                }
                validator.add(&row);
            }
            scan.close()?;
            Ok(())
        })();

        match outcome {
            Ok(()) => {
                validator.complete();
                self.metrics.validations_run.fetch_add(1, Ordering::Relaxed);
                let service = self.clone();
                self.anti_entropy_stage.submit(move || service.respond(validator));
            }
            Err(e) => {
                // the initiator's rendezvous never completes for this tree
                warn!("[repair #{}] validation failed for {}: {}", request.session_id, request, e);
            }
        }
    }

    /// Send a completed tree back to the node that requested it. Runs on
    /// the anti-entropy stage.
    fn respond(self: &Arc<Self>, validator: Validator) {
        let request = validator.request.clone();
        let local = self.local_endpoint();
        if request.endpoint != local {
            info!(
                "[repair #{}] sending completed merkle tree to {} for {}.{}",
                request.session_id, request.endpoint, request.keyspace, request.table
            );
        }
        let tree = validator.into_tree();
        self.transport.tree_response(request.endpoint, local, request, tree);
    }

    /// Verb handler: a completed tree arrived from `from`.
    pub fn handle_tree_response(self: &Arc<Self>, from: Endpoint, request: TreeRequest, tree: MerkleTree) {
        let request = TreeRequest { endpoint: from, ..request };
        self.rendezvous(request, tree);
    }

    /// Verb handler: snapshot request from a sequential session initiator.
    pub fn handle_snapshot_command(
        &self,
        command: SnapshotCommand,
        ack: Box<dyn FnOnce() + Send>,
    ) {
        if let Some(store) = self.resolver.resolve(&command.keyspace, &command.table) {
            store.snapshot(&command.session_id.to_string(), command.ephemeral);
        }
        ack();
    }

    /// Register a received tree for comparison once all trees for the
    /// current job have arrived. All rendezvous work is linearized on the
    /// anti-entropy stage; exactly one tree arrival observes the
    /// all-received transition and triggers differencing.
    pub fn rendezvous(self: &Arc<Self>, request: TreeRequest, tree: MerkleTree) {
        let service = self.clone();
        self.anti_entropy_stage.submit(move || {
            let session = match service.session(request.session_id) {
                Some(session) => session,
                None => {
                    warn!(
                        "got a merkle tree response for unknown repair session {}: either this \
                         node has been restarted since the session was started, or the session \
                         has been interrupted for an unknown reason",
                        request.session_id
                    );
                    return;
                }
            };

            let job = match session.front_job() {
                Some(job) => job,
                None => {
                    assert!(session.terminated(), "no jobs queued on a live session");
                    return;
                }
            };

            info!(
                "[repair #{}] received merkle tree for {} from {}",
                session.id(),
                request.table,
                request.endpoint
            );
            service.metrics.trees_received.fetch_add(1, Ordering::Relaxed);

            if job.add_tree(&request, tree) == 0 {
                debug!("all trees received for {}/{}", session.id(), request.table);
                session.set_state(SessionState::Differencing);
                job.submit_differencers(&session, &service);

                // this job is complete; switch to the next in line (only
                // one stage thread, so only one caller ever does this)
                session.pop_job();
                match session.front_job() {
                    Some(next) => next.send_tree_requests(&session, &service),
                    None => {
                        session.differencing_done.signal_all();
                        session.set_state(SessionState::Streaming);
                    }
                }
            }
        });
    }

    /// Launch a streaming repair task.
    pub(crate) fn launch_stream(&self, task: StreamingRepairTask, on_done: StreamCallback) {
        self.metrics.streams_launched.fetch_add(1, Ordering::Relaxed);
        self.streamer.stream(task, on_done);
    }

    /// A differencer (or its stream) finished; account for it on the
    /// anti-entropy stage. Results for sessions no longer in the active
    /// map are discarded.
    pub(crate) fn sync_complete(self: &Arc<Self>, differencer: &Differencer) {
        let service = self.clone();
        let differencer = differencer.clone();
        self.anti_entropy_stage.submit(move || {
            if let Some(session) = service.session(differencer.session_id) {
                session.completed_differencer(&differencer);
            }
        });
    }

    /// Stream failure: fail the owning session.
    pub(crate) fn stream_failed(self: &Arc<Self>, differencer: &Differencer) {
        if let Some(session) = self.session(differencer.session_id) {
            session.fail(RepairError::Stream(format!(
                "streaming between {} and {} failed for {}",
                differencer.r1.endpoint, differencer.r2.endpoint, differencer.cfname
            )));
        }
    }

    /// `now − gc_grace(keyspace, table)`, in epoch seconds.
    pub(crate) fn gc_before(&self, keyspace: &str, table: &str) -> i32 {
        let grace = self
            .resolver
            .resolve(keyspace, table)
            .map(|store| store.gc_grace_seconds())
            .unwrap_or(FALLBACK_GC_GRACE_SECONDS);
        (unix_now_seconds() - grace) as i32
    }

    /// Drain the stages; used by orderly process shutdown.
    pub fn shutdown(&self) {
        self.terminate_sessions();
        self.session_pool.shutdown();
        self.validation_pool.shutdown();
        self.anti_entropy_stage.shutdown();
    }
}

fn unix_now_seconds() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}
