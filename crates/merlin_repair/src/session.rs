//! Repair session and per-table job lifecycle.
//!
//! ```text
//! New ──start──▶ AwaitingTrees ──all trees for job──▶ (next job | Differencing)
//!                    │                                        │
//!                    ├─ endpoint convicted ──▶ Failed        ▼
//!                    │                                Streaming ──all diffs──▶ Done
//!                    └─ peer dead / terminate ──▶ Failed ◀────┘
//! ```
//!
//! A session owns a FIFO of jobs, one per table; jobs run one at a time.
//! The session thread blocks on `completed` until the last differencer (or
//! a failure) signals it. Rendezvous work happens on the anti-entropy
//! stage; the session holds no back-pointer to the service — every
//! transition receives it as an argument.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use merlin_common::{CountdownLatch, Endpoint, Latch, Range, RepairError, SessionId};

use crate::coordinator::{DispatchPolicy, RequestCoordinator};
use crate::differencer::Differencer;
use crate::failure::FailureListener;
use crate::merkle::MerkleTree;
use crate::messages::{SnapshotCommand, TreeRequest, TreeResponse};
use crate::service::RepairService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    AwaitingTrees,
    Differencing,
    Streaming,
    Done,
    Failed,
}

pub struct RepairSession {
    id: SessionId,
    keyspace: String,
    cfnames: Vec<String>,
    range: Range,
    is_sequential: bool,
    endpoints: Vec<Endpoint>,
    local: Endpoint,
    /// Base detector threshold; conviction requires twice this phi.
    phi_convict_threshold: f64,

    state: Mutex<SessionState>,
    exception: Mutex<Option<RepairError>>,
    is_failed: AtomicBool,
    terminated: AtomicBool,

    jobs: Mutex<VecDeque<Arc<RepairJob>>>,
    active_jobs: Mutex<HashMap<String, Arc<RepairJob>>>,

    /// Signaled when every job's differencing has been kicked off.
    pub differencing_done: Latch,
    /// Signaled when the last differencer completes, or on failure.
    pub completed: Latch,
}

impl RepairSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: SessionId,
        keyspace: String,
        cfnames: Vec<String>,
        range: Range,
        is_sequential: bool,
        endpoints: Vec<Endpoint>,
        local: Endpoint,
        phi_convict_threshold: f64,
    ) -> Arc<RepairSession> {
        assert!(!cfnames.is_empty(), "Repairing no column families seems pointless, doesn't it");
        Arc::new(RepairSession {
            id,
            keyspace,
            cfnames,
            range,
            is_sequential,
            endpoints,
            local,
            phi_convict_threshold,
            state: Mutex::new(SessionState::New),
            exception: Mutex::new(None),
            is_failed: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            jobs: Mutex::new(VecDeque::new()),
            active_jobs: Mutex::new(HashMap::new()),
            differencing_done: Latch::new(),
            completed: Latch::new(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn range(&self) -> Range {
        self.range
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn is_sequential(&self) -> bool {
        self.is_sequential
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.local
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    pub fn terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn exception_message(&self) -> Option<String> {
        self.exception.lock().as_ref().map(|e| e.to_string())
    }

    fn repaired_nodes(&self) -> String {
        let mut out = self.local.to_string();
        for endpoint in &self.endpoints {
            out.push_str(", ");
            out.push_str(&endpoint.to_string());
        }
        out
    }

    /// Session body, run on the sessions pool. Blocks until completion or
    /// failure; the caller removes the session from the active map after.
    pub(crate) fn run(self: &Arc<Self>, service: &Arc<RepairService>) {
        info!(
            "[repair #{}] new session: will sync {} on range {} for {}.{:?}",
            self.id,
            self.repaired_nodes(),
            self.range,
            self.keyspace,
            self.cfnames
        );

        for endpoint in &self.endpoints {
            if !service.failure_detector().is_alive(*endpoint) {
                let cause = RepairError::DeadNeighbor(*endpoint);
                error!("[repair #{}] {}", self.id, cause);
                *self.exception.lock() = Some(cause);
                self.set_state(SessionState::Failed);
                self.differencing_done.signal_all();
                self.completed.signal_all();
                return;
            }
        }

        self.set_state(SessionState::AwaitingTrees);
        {
            let mut jobs = self.jobs.lock();
            let mut active = self.active_jobs.lock();
            for cfname in &self.cfnames {
                let job = Arc::new(RepairJob::new(cfname.clone()));
                jobs.push_back(job.clone());
                active.insert(cfname.clone(), job);
            }
        }

        let first = self.front_job().expect("jobs were just queued");
        first.send_tree_requests(self, service);

        // block until all differencers have reported (or failure); the
        // session keeps completing in the background if this thread dies
        self.completed.wait();

        let failed = self.exception.lock().is_some();
        let work_done =
            self.active_jobs.lock().is_empty() && self.jobs.lock().is_empty();

        if failed {
            self.set_state(SessionState::Failed);
            error!(
                "[repair #{}] session completed with the following error: {}",
                self.id,
                self.exception_message().unwrap_or_default()
            );
        } else if self.terminated() || !work_done {
            *self.exception.lock() = Some(RepairError::Terminated);
            self.set_state(SessionState::Failed);
            info!("[repair #{}] session terminated before completion", self.id);
        } else {
            self.set_state(SessionState::Done);
            info!("[repair #{}] session completed successfully", self.id);
        }

        self.terminate();
    }

    pub(crate) fn front_job(&self) -> Option<Arc<RepairJob>> {
        self.jobs.lock().front().cloned()
    }

    pub(crate) fn pop_job(&self) {
        self.jobs.lock().pop_front();
    }

    /// Mark terminated: drain snapshot latches and drop all job state.
    /// In-flight remote operations may still finish; their results are
    /// ignored once the session leaves the active map.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        let jobs: Vec<Arc<RepairJob>> = self.jobs.lock().iter().cloned().collect();
        for job in jobs {
            job.terminate();
        }
        for job in self.active_jobs.lock().values() {
            job.terminate();
        }
        self.jobs.lock().clear();
        self.active_jobs.lock().clear();
    }

    /// Forced shutdown: release every waiter and terminate.
    pub fn force_shutdown(&self) {
        self.differencing_done.signal_all();
        self.completed.signal_all();
        self.terminate();
    }

    /// Record a failure exactly once and shut the session down.
    pub(crate) fn fail(&self, cause: RepairError) {
        if self.is_failed.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err()
        {
            return;
        }
        error!("[repair #{}] {}", self.id, cause);
        {
            let mut exception = self.exception.lock();
            if exception.is_none() {
                *exception = Some(cause);
            }
        }
        self.force_shutdown();
    }

    /// A differencer finished; count it against its job and, on the last
    /// one, complete the session. Runs on the anti-entropy stage.
    pub(crate) fn completed_differencer(&self, differencer: &Differencer) {
        debug!(
            "[repair #{}] repair completed between {} and {} on {}",
            self.id, differencer.r1.endpoint, differencer.r2.endpoint, differencer.cfname
        );
        let job = match self.active_jobs.lock().get(&differencer.cfname).cloned() {
            Some(job) => job,
            None => {
                assert!(self.terminated(), "job missing for a live session");
                return;
            }
        };

        if job.completed_synchronization(differencer) {
            self.active_jobs.lock().remove(&differencer.cfname);
            let remaining = self.active_jobs.lock().len();
            let suffix = if remaining == 0 {
                String::new()
            } else {
                format!(" ({} remaining column family to sync for this session)", remaining)
            };
            info!("[repair #{}] {} is fully synced{}", self.id, differencer.cfname, suffix);
            if remaining == 0 {
                self.completed.signal_all();
            }
        }
    }
}

impl FailureListener for RepairSession {
    /// Fail the session when a member endpoint is convicted. A higher
    /// confidence than usual is required because wrongly failing a repair
    /// has a high cost.
    fn convict(&self, endpoint: Endpoint, phi: f64) {
        if !self.endpoints.contains(&endpoint) {
            return;
        }
        if phi < 2.0 * self.phi_convict_threshold {
            return;
        }
        self.fail(RepairError::EndpointDied(endpoint));
    }
}

// ── RepairJob ───────────────────────────────────────────────────────────────

/// One table's slice of a session: tree requests out, responses in, then a
/// differencer per tree pair.
pub struct RepairJob {
    pub cfname: String,
    tree_requests: Mutex<Option<RequestCoordinator<TreeRequest>>>,
    differencers: Mutex<Option<RequestCoordinator<Differencer>>>,
    trees: Mutex<Vec<TreeResponse>>,
    /// Signaled once every tree request has been handed to the
    /// coordinator; `add_tree` waits on it so a fast response can never
    /// race request dispatch.
    requests_sent: Latch,
    snapshot_latch: Mutex<Option<CountdownLatch>>,
}

impl RepairJob {
    fn new(cfname: String) -> RepairJob {
        RepairJob {
            cfname,
            tree_requests: Mutex::new(None),
            differencers: Mutex::new(None),
            trees: Mutex::new(Vec::new()),
            requests_sent: Latch::new(),
            snapshot_latch: Mutex::new(None),
        }
    }

    /// Send a tree request to every involved endpoint (including self).
    /// Sequential sessions snapshot all endpoints first and wait for the
    /// acks; a termination while waiting aborts before any request is sent.
    pub(crate) fn send_tree_requests(
        &self,
        session: &Arc<RepairSession>,
        service: &Arc<RepairService>,
    ) {
        if session.is_sequential {
            self.make_snapshots(session, service);
            if session.terminated() {
                debug!(
                    "[repair #{}] terminated while awaiting snapshots, not requesting trees",
                    session.id
                );
                return;
            }
        }

        let gc_before = service.gc_before(&session.keyspace, &self.cfname);
        let mut all_endpoints = session.endpoints.clone();
        all_endpoints.push(session.local);

        let policy = if session.is_sequential {
            DispatchPolicy::Sequential
        } else {
            DispatchPolicy::Parallel
        };
        let transport = service.transport();
        let local = session.local;
        let mut coordinator = RequestCoordinator::new(policy, move |request: &TreeRequest| {
            transport.tree_request(request.endpoint, local, request.clone());
        });

        for endpoint in &all_endpoints {
            coordinator.add(TreeRequest {
                session_id: session.id,
                endpoint: *endpoint,
                gc_before,
                keyspace: session.keyspace.clone(),
                table: self.cfname.clone(),
                range: session.range,
            });
        }

        info!(
            "[repair #{}] requesting merkle trees for {} (to {:?})",
            session.id, self.cfname, all_endpoints
        );
        coordinator.start();
        *self.tree_requests.lock() = Some(coordinator);
        self.requests_sent.signal_all();
    }

    fn make_snapshots(&self, session: &Arc<RepairSession>, service: &Arc<RepairService>) {
        if session.terminated() {
            return;
        }
        let latch = CountdownLatch::new(session.endpoints.len());
        *self.snapshot_latch.lock() = Some(latch.clone());
        if session.terminated() {
            // a concurrent terminate may have run before the latch was
            // visible to it
            self.snapshot_latch.lock().take();
            return;
        }
        for endpoint in &session.endpoints {
            let ack = latch.clone();
            let command = SnapshotCommand {
                keyspace: session.keyspace.clone(),
                table: self.cfname.clone(),
                session_id: session.id,
                ephemeral: false,
            };
            service.transport().snapshot_command(*endpoint, command, Box::new(move || ack.count_down()));
        }
        latch.wait();
        *self.snapshot_latch.lock() = None;
    }

    /// Record a received tree; returns how many responses are still
    /// outstanding. Exactly one caller observes zero.
    pub(crate) fn add_tree(&self, request: &TreeRequest, tree: MerkleTree) -> usize {
        // wait for every request to have been handed out first
        self.requests_sent.wait();
        assert_eq!(request.table, self.cfname);
        self.trees
            .lock()
            .push(TreeResponse { endpoint: request.endpoint, tree: Arc::new(tree) });
        self.tree_requests
            .lock()
            .as_mut()
            .expect("requests_sent implies the coordinator exists")
            .completed(request)
    }

    /// Pair every tree against every other and hand the differencers to
    /// the anti-entropy stage. All trees must have been received.
    pub(crate) fn submit_differencers(
        &self,
        session: &Arc<RepairSession>,
        service: &Arc<RepairService>,
    ) {
        let policy = if session.is_sequential {
            DispatchPolicy::Sequential
        } else {
            DispatchPolicy::Parallel
        };
        let service_send = service.clone();
        let mut coordinator = RequestCoordinator::new(policy, move |differencer: &Differencer| {
            let differencer = differencer.clone();
            let service = service_send.clone();
            service_send.submit_to_stage(move || differencer.run(&service));
        });

        {
            let mut trees = self.trees.lock();
            for i in 0..trees.len().saturating_sub(1) {
                for j in (i + 1)..trees.len() {
                    let differencer = Differencer {
                        session_id: session.id,
                        keyspace: session.keyspace.clone(),
                        cfname: self.cfname.clone(),
                        r1: trees[i].clone(),
                        r2: trees[j].clone(),
                    };
                    debug!("queueing comparison {:?}", differencer);
                    coordinator.add(differencer);
                }
            }
            // the pairs hold the only references now
            trees.clear();
        }

        coordinator.start();
        *self.differencers.lock() = Some(coordinator);
    }

    /// Returns true when this differencer was the last one outstanding.
    fn completed_synchronization(&self, differencer: &Differencer) -> bool {
        self.differencers
            .lock()
            .as_mut()
            .map_or(false, |coordinator| coordinator.completed(differencer) == 0)
    }

    /// Drain the snapshot latch so a blocked `make_snapshots` returns.
    pub(crate) fn terminate(&self) {
        if let Some(latch) = self.snapshot_latch.lock().take() {
            latch.drain();
        }
    }
}
