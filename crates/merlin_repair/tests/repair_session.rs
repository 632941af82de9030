//! End-to-end repair scenarios over an in-process loopback cluster.
//!
//! Every node gets its own `RepairService`, store set and replica map; the
//! loopback transport delivers messages on fresh threads, like a real
//! transport would.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use merlin_common::{DecoratedKey, Endpoint, HashedPartitioner, Range, Token};
use merlin_repair::{
    RepairConfig, RepairService, RepairTransport, SessionState, SnapshotCommand,
    StaticStoreResolver, StreamCallback, StreamExecutor, StreamingRepairTask, TreeRequest,
};
use merlin_repair::merkle::MerkleTree;
use merlin_storage::{sstable_from_rows, CompactionConfig, Row, TableStore};
use merlin_repair::StaticReplicaMap;

// ── Harness ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Registry {
    services: RwLock<HashMap<Endpoint, Arc<RepairService>>>,
    /// Swallow snapshot commands entirely (acks never arrive).
    drop_snapshot_acks: AtomicBool,
    /// Tree requests to these endpoints vanish.
    unresponsive: Mutex<HashSet<Endpoint>>,
    tree_requests_sent: AtomicU64,
}

struct LoopbackTransport {
    registry: Arc<Registry>,
}

impl RepairTransport for LoopbackTransport {
    fn tree_request(&self, to: Endpoint, from: Endpoint, request: TreeRequest) {
        self.registry.tree_requests_sent.fetch_add(1, Ordering::SeqCst);
        if self.registry.unresponsive.lock().contains(&to) {
            return;
        }
        let registry = self.registry.clone();
        thread::spawn(move || {
            if let Some(service) = registry.services.read().get(&to).cloned() {
                service.handle_tree_request(from, request);
            }
        });
    }

    fn tree_response(&self, to: Endpoint, from: Endpoint, request: TreeRequest, tree: MerkleTree) {
        let registry = self.registry.clone();
        thread::spawn(move || {
            if let Some(service) = registry.services.read().get(&to).cloned() {
                service.handle_tree_response(from, request, tree);
            }
        });
    }

    fn snapshot_command(
        &self,
        to: Endpoint,
        command: SnapshotCommand,
        ack: Box<dyn FnOnce() + Send>,
    ) {
        if self.registry.drop_snapshot_acks.load(Ordering::SeqCst) {
            return;
        }
        let registry = self.registry.clone();
        thread::spawn(move || {
            if let Some(service) = registry.services.read().get(&to).cloned() {
                service.handle_snapshot_command(command, ack);
            }
        });
    }
}

#[derive(Default)]
struct RecordingStreamer {
    launched: Mutex<Vec<StreamingRepairTask>>,
}

impl StreamExecutor for RecordingStreamer {
    fn stream(&self, task: StreamingRepairTask, on_done: StreamCallback) {
        self.launched.lock().push(task);
        on_done(true);
    }
}

struct TestCluster {
    registry: Arc<Registry>,
    services: HashMap<Endpoint, Arc<RepairService>>,
    streamers: HashMap<Endpoint, Arc<RecordingStreamer>>,
    stores: HashMap<(Endpoint, String), Arc<TableStore>>,
}

fn dk(t: u128) -> DecoratedKey {
    DecoratedKey::new(Token(t), t.to_be_bytes().to_vec())
}

fn repair_range() -> Range {
    Range::new(Token(0), Token(1 << 20))
}

/// Thirty rows spread across the repair range.
fn base_rows() -> Vec<Row> {
    (1..=30u128).map(|i| Row::live(dk(i * 10_000), 7, b"payload".to_vec())).collect()
}

fn cluster(
    members: &[Endpoint],
    tables: &[&str],
    rows_for: impl Fn(Endpoint, &str) -> Vec<Row>,
) -> TestCluster {
    let registry = Arc::new(Registry::default());
    let mut services = HashMap::new();
    let mut streamers = HashMap::new();
    let mut stores = HashMap::new();

    for &endpoint in members {
        let resolver = Arc::new(StaticStoreResolver::new());
        for &table in tables {
            let store = Arc::new(
                TableStore::new("ks1", table, CompactionConfig::default()).with_gc_grace(864_000),
            );
            let rows = rows_for(endpoint, table);
            if !rows.is_empty() {
                store.add_sstable(sstable_from_rows(rows));
            }
            resolver.register(store.clone());
            stores.insert((endpoint, table.to_string()), store);
        }

        let replica_map = StaticReplicaMap::new(endpoint)
            .with_range(repair_range(), members.to_vec());
        let streamer = Arc::new(RecordingStreamer::default());
        let transport = Arc::new(LoopbackTransport { registry: registry.clone() });
        let config = RepairConfig {
            tree_max_depth: 32,
            tree_max_size: 64,
            ..RepairConfig::default()
        };
        let service = RepairService::new(
            config,
            Arc::new(HashedPartitioner),
            transport,
            streamer.clone(),
            resolver,
            Arc::new(replica_map),
        );
        registry.services.write().insert(endpoint, service.clone());
        services.insert(endpoint, service);
        streamers.insert(endpoint, streamer);
    }

    // everyone sees everyone else alive
    for service in services.values() {
        for &endpoint in members {
            service.failure_detector().mark_up(endpoint);
        }
    }

    TestCluster { registry, services, streamers, stores }
}

fn ep(n: u8) -> Endpoint {
    Endpoint::v4(10, 0, 0, n)
}

// ── Scenarios ───────────────────────────────────────────────────────────────

/// Three replicas, one diverged key on B: exactly the two pairs involving
/// B stream, and only the leaf holding the divergent token.
#[test]
fn test_single_table_repair_one_diverged_key() {
    let (a, b, c) = (ep(1), ep(2), ep(3));
    let divergent_token = 155_555u128;

    let cluster = cluster(&[a, b, c], &["events"], |endpoint, _| {
        let mut rows = base_rows();
        if endpoint == b {
            rows.push(Row::live(dk(divergent_token), 9, b"only-on-b".to_vec()));
            rows.sort_by(|x, y| x.key.cmp(&y.key));
        }
        rows
    });

    let service = &cluster.services[&a];
    let session = service
        .submit_repair_session(repair_range(), "ks1", false, false, &["events"])
        .expect("session starts");

    assert!(session.completed.wait_timeout(Duration::from_secs(10)), "session must finish");
    // the pool thread flips the final state right after the latch
    wait_for(|| session.state() == SessionState::Done, Duration::from_secs(5));

    let launched = cluster.streamers[&a].launched.lock();
    assert_eq!(launched.len(), 2, "only the two pairs involving B disagree");
    for task in launched.iter() {
        assert!(
            task.request.src == b || task.request.dst == b,
            "every stream involves the diverged replica"
        );
        assert!(!task.ranges().is_empty());
        assert!(
            task.ranges().iter().any(|r| r.contains_token(Token(divergent_token))),
            "sync ranges must cover the divergent token"
        );
    }
    for other in [b, c] {
        assert!(cluster.streamers[&other].launched.lock().is_empty());
    }

    wait_for(
        || service.metrics().snapshot().sessions_succeeded == 1,
        Duration::from_secs(5),
    );
    assert_eq!(service.metrics().snapshot().trees_received, 3);
}

/// Identical replicas: every pair is consistent, nothing streams.
#[test]
fn test_identical_replicas_stream_nothing() {
    let (a, b, c) = (ep(11), ep(12), ep(13));
    let cluster = cluster(&[a, b, c], &["events"], |_, _| base_rows());

    let session = cluster.services[&a]
        .submit_repair_session(repair_range(), "ks1", false, false, &["events"])
        .unwrap();

    assert!(session.completed.wait_timeout(Duration::from_secs(10)));
    wait_for(|| session.state() == SessionState::Done, Duration::from_secs(5));
    assert!(cluster.streamers[&a].launched.lock().is_empty());
}

/// Sequential session over two tables: jobs run one at a time, snapshots
/// are taken on every neighbor, and the session still ends Done.
#[test]
fn test_sequential_multi_table_session() {
    let (a, b, c) = (ep(21), ep(22), ep(23));
    let cluster = cluster(&[a, b, c], &["events", "settings"], |_, _| base_rows());

    let service = &cluster.services[&a];
    let session = service
        .submit_repair_session(repair_range(), "ks1", true, false, &["events", "settings"])
        .unwrap();

    assert!(session.completed.wait_timeout(Duration::from_secs(10)));
    wait_for(|| session.state() == SessionState::Done, Duration::from_secs(5));

    // both neighbors snapshotted both tables before validation
    for endpoint in [b, c] {
        for table in ["events", "settings"] {
            let store = &cluster.stores[&(endpoint, table.to_string())];
            assert_eq!(
                store.snapshot_tags(),
                vec![session.id().to_string()],
                "missing snapshot for {table} on {endpoint}"
            );
        }
    }

    // one tree per endpoint per table
    assert_eq!(service.metrics().snapshot().trees_received, 6);
}

/// No neighbors share the range: the session completes immediately and is
/// never queued.
#[test]
fn test_session_with_no_neighbors_is_immediately_done() {
    let a = ep(31);
    let cluster = cluster(&[a], &["events"], |_, _| base_rows());

    let service = &cluster.services[&a];
    let session = service
        .submit_repair_session(repair_range(), "ks1", false, false, &["events"])
        .unwrap();

    assert_eq!(session.state(), SessionState::Done);
    assert!(session.completed.is_signaled());
    assert!(session.differencing_done.is_signaled());
    assert_eq!(service.active_session_count(), 0);
}

/// A dead neighbor at session start fails the session before any work.
#[test]
fn test_dead_neighbor_fails_session_at_start() {
    let (a, b, c) = (ep(41), ep(42), ep(43));
    let cluster = cluster(&[a, b, c], &["events"], |_, _| base_rows());

    let service = &cluster.services[&a];
    service.failure_detector().mark_down(c);

    let session = service
        .submit_repair_session(repair_range(), "ks1", false, false, &["events"])
        .unwrap();

    assert!(session.completed.wait_timeout(Duration::from_secs(5)));
    wait_for(|| session.state() == SessionState::Failed, Duration::from_secs(5));
    let message = session.exception_message().expect("failure recorded");
    assert!(message.contains("dead"), "unexpected message: {message}");
    assert_eq!(cluster.registry.tree_requests_sent.load(Ordering::SeqCst), 0);
}

/// Terminating while a sequential session awaits snapshot acks drains the
/// latch; the session ends in a terminated state without ever requesting
/// trees.
#[test]
fn test_terminate_during_snapshot_await() {
    let (a, b, c) = (ep(51), ep(52), ep(53));
    let cluster = cluster(&[a, b, c], &["events"], |_, _| base_rows());
    cluster.registry.drop_snapshot_acks.store(true, Ordering::SeqCst);

    let service = &cluster.services[&a];
    let session = service
        .submit_repair_session(repair_range(), "ks1", true, false, &["events"])
        .unwrap();

    // let the session reach the snapshot latch, then pull the plug
    thread::sleep(Duration::from_millis(100));
    service.terminate_sessions();

    assert!(
        session.completed.wait_timeout(Duration::from_millis(500)),
        "terminate must release the session promptly"
    );
    wait_for(|| session.state() == SessionState::Failed, Duration::from_secs(5));
    assert!(session.terminated());
    assert_eq!(
        cluster.registry.tree_requests_sent.load(Ordering::SeqCst),
        0,
        "no tree requests after termination"
    );
}

/// Conviction of a session member with overwhelming phi fails the session:
/// both latches signal and the error names the dead endpoint.
#[test]
fn test_peer_conviction_fails_session() {
    let (a, b, c) = (ep(61), ep(62), ep(63));
    let cluster = cluster(&[a, b, c], &["events"], |_, _| base_rows());
    // C never answers its tree request, pinning the session in AwaitingTrees
    cluster.registry.unresponsive.lock().insert(c);

    let service = &cluster.services[&a];
    let session = service
        .submit_repair_session(repair_range(), "ks1", false, false, &["events"])
        .unwrap();

    // give the other replicas time to respond
    thread::sleep(Duration::from_millis(200));
    let threshold = service.config().phi_convict_threshold;
    service.failure_detector().convict(c, 10.0 * threshold);

    assert!(session.completed.wait_timeout(Duration::from_secs(5)));
    assert!(session.differencing_done.is_signaled());
    wait_for(|| session.state() == SessionState::Failed, Duration::from_secs(5));
    let message = session.exception_message().expect("failure recorded");
    assert!(message.contains(&format!("Endpoint {} died", c)), "unexpected message: {message}");
}

/// A weak suspicion (below 2× the configured threshold) is ignored.
#[test]
fn test_weak_conviction_is_ignored() {
    let (a, b) = (ep(71), ep(72));
    let cluster = cluster(&[a, b], &["events"], |_, _| base_rows());

    let service = &cluster.services[&a];
    let session = service
        .submit_repair_session(repair_range(), "ks1", false, false, &["events"])
        .unwrap();

    let threshold = service.config().phi_convict_threshold;
    service.failure_detector().convict(b, 1.5 * threshold);

    assert!(session.completed.wait_timeout(Duration::from_secs(10)));
    wait_for(|| session.state() == SessionState::Done, Duration::from_secs(5));
}

fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) {
    let deadline = std::time::Instant::now() + timeout;
    while !condition() {
        assert!(std::time::Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(10));
    }
}
