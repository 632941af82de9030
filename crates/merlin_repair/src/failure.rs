//! Failure detector coupling.
//!
//! The detector itself (phi accrual) is an external collaborator; this
//! module keeps per-endpoint liveness, fans conviction reports out to
//! registered listeners, and translates membership events (`remove`,
//! `restart`) into maximal-confidence convictions.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::debug;

use merlin_common::Endpoint;

/// Receives conviction reports. Repair sessions implement this and decide
/// for themselves whether the suspicion is strong enough to fail on.
pub trait FailureListener: Send + Sync {
    fn convict(&self, endpoint: Endpoint, phi: f64);
}

pub struct FailureDetector {
    phi_convict_threshold: f64,
    alive: RwLock<HashMap<Endpoint, bool>>,
    listeners: RwLock<Vec<Weak<dyn FailureListener>>>,
}

impl FailureDetector {
    pub fn new(phi_convict_threshold: f64) -> FailureDetector {
        FailureDetector {
            phi_convict_threshold,
            alive: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn phi_convict_threshold(&self) -> f64 {
        self.phi_convict_threshold
    }

    /// Endpoints never heard from are not alive.
    pub fn is_alive(&self, endpoint: Endpoint) -> bool {
        self.alive.read().get(&endpoint).copied().unwrap_or(false)
    }

    pub fn mark_up(&self, endpoint: Endpoint) {
        self.alive.write().insert(endpoint, true);
    }

    pub fn mark_down(&self, endpoint: Endpoint) {
        self.alive.write().insert(endpoint, false);
    }

    pub fn register(&self, listener: &Arc<dyn FailureListener>) {
        self.listeners.write().push(Arc::downgrade(listener));
    }

    pub fn unregister(&self, listener: &Arc<dyn FailureListener>) {
        let target = Arc::downgrade(listener);
        self.listeners.write().retain(|w| !w.ptr_eq(&target) && w.strong_count() > 0);
    }

    /// Report a suspicion level for an endpoint to every listener.
    pub fn convict(&self, endpoint: Endpoint, phi: f64) {
        debug!(%endpoint, phi, "conviction report");
        for listener in self.snapshot_listeners() {
            listener.convict(endpoint, phi);
        }
    }

    /// Membership removal: maximal confidence.
    pub fn on_remove(&self, endpoint: Endpoint) {
        self.mark_down(endpoint);
        self.convict(endpoint, f64::MAX);
    }

    /// An endpoint restarted; any in-flight repair with it is void.
    pub fn on_restart(&self, endpoint: Endpoint) {
        self.convict(endpoint, f64::MAX);
    }

    fn snapshot_listeners(&self) -> Vec<Arc<dyn FailureListener>> {
        let mut listeners = self.listeners.write();
        listeners.retain(|w| w.strong_count() > 0);
        listeners.iter().filter_map(|w| w.upgrade()).collect()
    }
}
