//! Hint dispatch plumbing.
//!
//! Hints accumulate per unreachable host and are drained by dispatch
//! tasks. One task per host id at a time (get-or-insert on the scheduled
//! map), so the per-destination rate limit never needs to be shared
//! between threads. The limit bounds traffic *towards a host from this
//! node's share of the cluster*: `configured_throttle_kB / (cluster_size −
//! 1)`; zero disables throttling.
//!
//! Hint files that fail to parse are quarantined (blacklisted) and
//! dispatch moves on — corruption never wedges the queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

use merlin_common::{HintError, StageExecutor};

#[derive(Debug, Clone)]
pub struct HintsConfig {
    /// Total outbound hint budget in KiB/s, divided across peers.
    /// Zero means unlimited.
    pub throttle_kb_per_sec: u64,
    /// Dispatch thread count.
    pub max_threads: usize,
}

impl Default for HintsConfig {
    fn default() -> Self {
        Self { throttle_kb_per_sec: 1024, max_threads: 2 }
    }
}

/// One hint file awaiting delivery to a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HintsDescriptor {
    pub host_id: Uuid,
    pub file_name: String,
}

/// Per-host hint file queue, owned by hint storage.
pub trait HintStore: Send + Sync {
    fn host_id(&self) -> Uuid;

    /// Next file to dispatch, or `None` when drained.
    fn poll(&self) -> Option<HintsDescriptor>;

    /// Put a partially dispatched file back at the head of the queue.
    fn offer_first(&self, descriptor: HintsDescriptor);

    /// Quarantine a corrupt file.
    fn blacklist(&self, descriptor: &HintsDescriptor);

    /// Delete a fully dispatched file's bookkeeping.
    fn clean_up(&self, descriptor: &HintsDescriptor);
}

/// Delivers the hints of one file to its host.
pub trait HintSink: Send + Sync {
    /// Returns `Ok(true)` when the file was fully dispatched, `Ok(false)`
    /// when dispatch stopped early (pause); `HintError::Corrupt` marks the
    /// file for quarantine.
    fn dispatch(
        &self,
        descriptor: &HintsDescriptor,
        limiter: &RateLimiter,
    ) -> Result<bool, HintError>;
}

pub struct HintsDispatchExecutor {
    config: HintsConfig,
    pool: StageExecutor,
    scheduled: Arc<DashMap<Uuid, ()>>,
    is_paused: Arc<AtomicBool>,
}

impl HintsDispatchExecutor {
    pub fn new(config: HintsConfig) -> HintsDispatchExecutor {
        let pool = StageExecutor::new("HintsDispatcher", config.max_threads.max(1));
        HintsDispatchExecutor {
            config,
            pool,
            scheduled: Arc::new(DashMap::new()),
            is_paused: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pause(&self) {
        self.is_paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.is_paused.store(false, Ordering::SeqCst);
    }

    pub fn is_scheduled(&self, host_id: Uuid) -> bool {
        self.scheduled.contains_key(&host_id)
    }

    /// Schedule a dispatch for the store's host. Dispatching the same host
    /// concurrently wins nothing, so a host already scheduled is left
    /// alone; returns whether a new task was queued.
    pub fn dispatch(
        &self,
        store: Arc<dyn HintStore>,
        sink: Arc<dyn HintSink>,
        cluster_size: usize,
    ) -> bool {
        let host_id = store.host_id();
        if self.scheduled.insert(host_id, ()).is_some() {
            return false;
        }

        let limiter = RateLimiter::new(per_peer_rate_bytes(
            self.config.throttle_kb_per_sec,
            cluster_size,
        ));
        let scheduled = self.scheduled.clone();
        let is_paused = self.is_paused.clone();
        self.pool.submit(move || {
            dispatch_host(store, sink, &limiter, &is_paused);
            scheduled.remove(&host_id);
        });
        true
    }

    /// Deschedule everything and stop the pool. Safe to call with
    /// dispatches in progress.
    pub fn shutdown_blocking(&self) {
        self.scheduled.clear();
        self.pool.shutdown();
    }
}

/// Per-peer budget: the configured node-wide rate divided by the number of
/// other nodes; `None` disables throttling.
fn per_peer_rate_bytes(throttle_kb: u64, cluster_size: usize) -> Option<u64> {
    if throttle_kb == 0 {
        return None;
    }
    let peers = cluster_size.saturating_sub(1).max(1) as u64;
    Some(throttle_kb * 1024 / peers)
}

fn dispatch_host(
    store: Arc<dyn HintStore>,
    sink: Arc<dyn HintSink>,
    limiter: &RateLimiter,
    is_paused: &AtomicBool,
) {
    loop {
        if is_paused.load(Ordering::SeqCst) {
            break;
        }
        let descriptor = match store.poll() {
            Some(descriptor) => descriptor,
            None => break,
        };

        debug!(host = %descriptor.host_id, file = %descriptor.file_name, "dispatching hints file");
        match sink.dispatch(&descriptor, limiter) {
            Ok(true) => {
                store.clean_up(&descriptor);
                info!(
                    "finished hinted handoff of file {} to endpoint {}",
                    descriptor.file_name, descriptor.host_id
                );
            }
            Ok(false) => {
                store.offer_first(descriptor);
                break;
            }
            Err(HintError::Corrupt { file, detail }) => {
                error!("failed to dispatch hints file {}: file is corrupted ({})", file, detail);
                store.clean_up(&descriptor);
                store.blacklist(&descriptor);
                // quarantined; keep draining the rest of the queue
            }
            Err(e) => {
                error!("hint dispatch interrupted: {}", e);
                store.offer_first(descriptor);
                break;
            }
        }
    }
}

// ── Rate limiter ────────────────────────────────────────────────────────────

/// Byte-per-second token bucket with a one-second burst window.
pub struct RateLimiter {
    rate_bytes_per_sec: Option<u64>,
    state: Mutex<LimiterState>,
}

struct LimiterState {
    available: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(rate_bytes_per_sec: Option<u64>) -> RateLimiter {
        RateLimiter {
            rate_bytes_per_sec,
            state: Mutex::new(LimiterState {
                available: rate_bytes_per_sec.unwrap_or(0) as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn unlimited() -> RateLimiter {
        RateLimiter::new(None)
    }

    /// Block until `bytes` may be sent.
    pub fn acquire(&self, bytes: u64) {
        let rate = match self.rate_bytes_per_sec {
            Some(rate) => rate as f64,
            None => return,
        };
        loop {
            {
                let mut state = self.state.lock();
                let elapsed = state.last_refill.elapsed().as_secs_f64();
                state.available = (state.available + elapsed * rate).min(rate);
                state.last_refill = Instant::now();
                if state.available >= bytes as f64 {
                    state.available -= bytes as f64;
                    return;
                }
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
