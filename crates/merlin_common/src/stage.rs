//! Named task executors.
//!
//! Work is modeled as closures submitted to named stages. Two shapes are
//! needed:
//!
//! - parallel pools (compaction, repair sessions) — N worker threads over a
//!   shared queue;
//! - single-threaded stages (anti-entropy) — one consumer, so every task
//!   submitted to the stage is linearized.
//!
//! Panics are not caught: a logic-invariant violation takes its stage down
//! rather than being papered over.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use tracing::debug;

type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct StageExecutor {
    name: &'static str,
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl StageExecutor {
    /// A single-threaded stage: submitted tasks run one at a time, in
    /// submission order.
    pub fn single(name: &'static str) -> StageExecutor {
        StageExecutor::new(name, 1)
    }

    pub fn new(name: &'static str, threads: usize) -> StageExecutor {
        assert!(threads > 0, "stage {} needs at least one worker", name);
        let (tx, rx) = unbounded::<Task>();
        let workers = (0..threads)
            .map(|i| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("{}-{}", name, i))
                    .spawn(move || {
                        for task in rx.iter() {
                            task();
                        }
                    })
                    .expect("failed to spawn stage worker")
            })
            .collect();

        StageExecutor { name, sender: Mutex::new(Some(tx)), workers: Mutex::new(workers) }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Submit a task. Returns false if the stage has been shut down, in
    /// which case the task is dropped.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> bool {
        match self.sender.lock().as_ref() {
            Some(tx) => tx.send(Box::new(task)).is_ok(),
            None => {
                debug!(stage = self.name, "task submitted after shutdown, dropping");
                false
            }
        }
    }

    /// Stop accepting tasks, run out the queue, and join the workers.
    pub fn shutdown(&self) {
        let tx = self.sender.lock().take();
        drop(tx);
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for StageExecutor {
    fn drop(&mut self) {
        // workers exit once the last sender is gone; nothing to join here if
        // shutdown() already ran
        self.sender.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_pool_runs_all_tasks() {
        let stage = StageExecutor::new("test-pool", 4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            assert!(stage.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        stage.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_single_stage_preserves_order() {
        let stage = StageExecutor::single("test-serial");
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let log = log.clone();
            stage.submit(move || log.lock().push(i));
        }
        stage.shutdown();
        let log = log.lock();
        assert_eq!(*log, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_submit_after_shutdown_is_rejected() {
        let stage = StageExecutor::single("test-closed");
        stage.shutdown();
        assert!(!stage.submit(|| {}));
    }
}
