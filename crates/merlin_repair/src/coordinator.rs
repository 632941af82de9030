//! Request dispatch with completion counting.
//!
//! One state machine, two disciplines: `Parallel` fires every queued
//! request at `start()`; `Sequential` fires one and sends the next only
//! when the previous completes, bounding concurrent load on replicas.
//! `completed()` returns the number of requests still outstanding — the
//! caller that observes zero owns the "all done" transition, exactly once.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPolicy {
    Sequential,
    Parallel,
}

pub struct RequestCoordinator<R: Clone + Eq + Hash> {
    policy: DispatchPolicy,
    send: Box<dyn Fn(&R) + Send>,
    started: bool,
    /// Pending order for sequential dispatch.
    queue: VecDeque<R>,
    /// In-flight set for parallel dispatch.
    outstanding: HashSet<R>,
}

impl<R: Clone + Eq + Hash> RequestCoordinator<R> {
    pub fn new(policy: DispatchPolicy, send: impl Fn(&R) + Send + 'static) -> Self {
        RequestCoordinator {
            policy,
            send: Box::new(send),
            started: false,
            queue: VecDeque::new(),
            outstanding: HashSet::new(),
        }
    }

    /// Queue a request. Only permitted before `start()`.
    pub fn add(&mut self, request: R) {
        assert!(!self.started, "add after start");
        self.queue.push_back(request);
    }

    /// Begin dispatch.
    pub fn start(&mut self) {
        assert!(!self.started, "coordinator started twice");
        self.started = true;
        match self.policy {
            DispatchPolicy::Parallel => {
                for request in self.queue.drain(..) {
                    (self.send)(&request);
                    self.outstanding.insert(request);
                }
            }
            DispatchPolicy::Sequential => {
                if let Some(front) = self.queue.front() {
                    (self.send)(front);
                }
            }
        }
    }

    /// Record a completion; returns how many requests remain. Under
    /// `Sequential` this also fires the next request.
    pub fn completed(&mut self, request: &R) -> usize {
        assert!(self.started, "completed before start");
        match self.policy {
            DispatchPolicy::Parallel => {
                self.outstanding.remove(request);
                self.outstanding.len()
            }
            DispatchPolicy::Sequential => {
                assert!(
                    self.queue.front() == Some(request),
                    "sequential completion out of order"
                );
                self.queue.pop_front();
                if let Some(next) = self.queue.front() {
                    (self.send)(next);
                }
                self.queue.len()
            }
        }
    }

    pub fn remaining(&self) -> usize {
        match self.policy {
            DispatchPolicy::Parallel => {
                if self.started {
                    self.outstanding.len()
                } else {
                    self.queue.len()
                }
            }
            DispatchPolicy::Sequential => self.queue.len(),
        }
    }
}
