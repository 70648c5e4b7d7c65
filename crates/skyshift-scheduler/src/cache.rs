//! The scheduler's view of clusters.
//!
//! Snapshots come from the Cluster informer cache; a reservation overlay
//! deducts placements this scheduler committed but the owning Skylet has
//! not yet reflected into `allocatable_capacity`, so back-to-back queue
//! items cannot double-book the same capacity. A cluster's overlay resets
//! whenever a fresh allocatable report arrives.

use std::collections::{BTreeMap, HashMap};

use skyshift_types::{
    kinds::Cluster,
    resources::{self, NodeResourceMap, ResourceMap},
};

/// What the plugin pipeline sees of one cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSnapshot {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub allocatable: NodeResourceMap,
}

impl ClusterSnapshot {
    pub fn from_cluster(cluster: &Cluster) -> Self {
        ClusterSnapshot {
            name: cluster.metadata.name.clone(),
            labels: cluster.metadata.labels.clone(),
            allocatable: cluster.status.allocatable_capacity.clone(),
        }
    }

    /// Free resources summed across nodes.
    pub fn free_total(&self) -> ResourceMap {
        resources::total(&self.allocatable)
    }

    /// How many replicas of `request` this cluster can still hold.
    pub fn replica_capacity(&self, request: &ResourceMap) -> u32 {
        resources::count_fits_across_nodes(request, &self.allocatable)
    }
}

/// Placements committed but not yet observed back from the cluster.
#[derive(Default)]
pub struct ReservationOverlay {
    reserved: std::sync::Mutex<HashMap<String, ResourceMap>>,
}

impl ReservationOverlay {
    /// Records `replicas` placements of `request` on `cluster`.
    pub fn reserve(&self, cluster: &str, request: &ResourceMap, replicas: u32) {
        let mut reserved = match self.reserved.lock() {
            Ok(reserved) => reserved,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = reserved.entry(cluster.to_string()).or_default();
        for (resource, quantity) in request {
            *entry.entry(resource.clone()).or_insert(0.0) += quantity * f64::from(replicas);
        }
    }

    /// Drops the overlay for `cluster` once its Skylet reported fresh
    /// allocatable numbers.
    pub fn clear(&self, cluster: &str) {
        if let Ok(mut reserved) = self.reserved.lock() {
            reserved.remove(cluster);
        }
    }

    /// Applies the overlay to a snapshot, deducting reserved resources
    /// node by node.
    pub fn apply(&self, snapshot: &mut ClusterSnapshot) {
        let reserved = match self.reserved.lock() {
            Ok(reserved) => reserved,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(mut outstanding) = reserved.get(&snapshot.name).cloned() else {
            return;
        };

        // Deduction order across nodes mirrors the node-by-node fill the
        // spread uses, largest free node first.
        let mut nodes: Vec<&String> = snapshot.allocatable.keys().collect();
        nodes.sort();
        let nodes: Vec<String> = nodes.into_iter().cloned().collect();
        for node in nodes {
            if let Some(free) = snapshot.allocatable.get_mut(&node) {
                let deduction: ResourceMap = outstanding
                    .iter()
                    .map(|(resource, quantity)| {
                        let available = free.get(resource).copied().unwrap_or(0.0);
                        (resource.clone(), quantity.min(available))
                    })
                    .collect();
                resources::subtract_in_place(free, &deduction);
                resources::subtract_in_place(&mut outstanding, &deduction);
            }
        }
    }
}
