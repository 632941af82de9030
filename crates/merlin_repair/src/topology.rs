//! Replica placement lookups.
//!
//! Ring ownership lives outside the repair core; sessions only need to ask
//! which replicas share a range and which datacenter an endpoint is in.

use std::collections::HashMap;

use merlin_common::{Endpoint, Range, RepairError};

pub trait ReplicaMap: Send + Sync {
    fn local_endpoint(&self) -> Endpoint;

    /// Ranges the local node replicates for a keyspace.
    fn local_ranges(&self, keyspace: &str) -> Vec<Range>;

    /// Every replica (including the local node) of an owned range.
    fn replicas_for(&self, keyspace: &str, range: &Range) -> Vec<Endpoint>;

    fn datacenter_of(&self, endpoint: Endpoint) -> Option<String>;

    fn cluster_size(&self) -> usize;
}

/// Neighbors for a repair: replicas sharing the requested range, minus the
/// local node, optionally restricted to `local_datacenter`.
///
/// The requested range must be fully contained in one locally owned range;
/// partial intersection would repair an imprecise slice and is rejected.
pub fn neighbors(
    replica_map: &dyn ReplicaMap,
    keyspace: &str,
    to_repair: &Range,
    is_local: bool,
    local_datacenter: &str,
) -> Result<Vec<Endpoint>, RepairError> {
    let mut superset = None;
    for owned in replica_map.local_ranges(keyspace) {
        if owned.contains_range(to_repair) {
            superset = Some(owned);
            break;
        }
        if owned.intersects(to_repair) {
            return Err(RepairError::ImpreciseRange(to_repair.to_string()));
        }
    }

    let superset = match superset {
        Some(range) => range,
        None => return Ok(Vec::new()),
    };

    let local = replica_map.local_endpoint();
    let mut out: Vec<Endpoint> = replica_map
        .replicas_for(keyspace, &superset)
        .into_iter()
        .filter(|&ep| ep != local)
        .collect();

    if is_local {
        out.retain(|&ep| {
            replica_map.datacenter_of(ep).as_deref() == Some(local_datacenter)
        });
    }
    out.sort();
    out.dedup();
    Ok(out)
}

/// Fixed replica map for tests and single-process deployments.
pub struct StaticReplicaMap {
    local: Endpoint,
    ranges: Vec<(Range, Vec<Endpoint>)>,
    datacenters: HashMap<Endpoint, String>,
}

impl StaticReplicaMap {
    pub fn new(local: Endpoint) -> StaticReplicaMap {
        StaticReplicaMap { local, ranges: Vec::new(), datacenters: HashMap::new() }
    }

    pub fn with_range(mut self, range: Range, replicas: Vec<Endpoint>) -> StaticReplicaMap {
        self.ranges.push((range, replicas));
        self
    }

    pub fn with_datacenter(mut self, endpoint: Endpoint, dc: impl Into<String>) -> StaticReplicaMap {
        self.datacenters.insert(endpoint, dc.into());
        self
    }
}

impl ReplicaMap for StaticReplicaMap {
    fn local_endpoint(&self) -> Endpoint {
        self.local
    }

    fn local_ranges(&self, _keyspace: &str) -> Vec<Range> {
        self.ranges
            .iter()
            .filter(|(_, replicas)| replicas.contains(&self.local))
            .map(|(range, _)| *range)
            .collect()
    }

    fn replicas_for(&self, _keyspace: &str, range: &Range) -> Vec<Endpoint> {
        self.ranges
            .iter()
            .find(|(owned, _)| owned == range)
            .map(|(_, replicas)| replicas.clone())
            .unwrap_or_default()
    }

    fn datacenter_of(&self, endpoint: Endpoint) -> Option<String> {
        self.datacenters.get(&endpoint).cloned()
    }

    fn cluster_size(&self) -> usize {
        let mut all: Vec<Endpoint> =
            self.ranges.iter().flat_map(|(_, replicas)| replicas.iter().copied()).collect();
        all.sort();
        all.dedup();
        all.len()
    }
}
