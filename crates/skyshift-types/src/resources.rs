//! Resource accounting maps.
//!
//! Capacity and allocatable capacity are maps of `node name -> resource name
//! -> quantity`; job resource requests are flat `resource name -> quantity`
//! maps. Memory quantities are carried in mebibytes.

use std::collections::BTreeMap;

pub const RESOURCE_CPUS: &str = "cpus";
pub const RESOURCE_MEMORY: &str = "memory";
pub const RESOURCE_GPUS: &str = "gpus";

/// Tolerance for floating point resource arithmetic.
const EPSILON: f64 = 1e-9;

pub type ResourceMap = BTreeMap<String, f64>;
pub type NodeResourceMap = BTreeMap<String, ResourceMap>;

/// The resource request a job gets when it does not specify one.
pub fn default_job_resources() -> ResourceMap {
    BTreeMap::from([(RESOURCE_CPUS.to_string(), 1.0)])
}

/// Whether a single replica with `request` fits into `free`.
///
/// Resources missing from `free` count as zero; zero-valued requests are
/// ignored so `gpus: 0` does not require the cluster to advertise GPUs.
pub fn fits(request: &ResourceMap, free: &ResourceMap) -> bool {
    request.iter().all(|(resource, quantity)| {
        *quantity <= EPSILON || free.get(resource).copied().unwrap_or(0.0) + EPSILON >= *quantity
    })
}

/// How many replicas with `request` fit into `free`.
pub fn count_fits(request: &ResourceMap, free: &ResourceMap) -> u32 {
    request
        .iter()
        .filter(|(_, quantity)| **quantity > EPSILON)
        .map(|(resource, quantity)| {
            let available = free.get(resource).copied().unwrap_or(0.0);
            ((available + EPSILON) / quantity).floor() as u32
        })
        .min()
        .unwrap_or(u32::MAX)
}

/// How many replicas fit across all nodes of a cluster, filling node by node.
pub fn count_fits_across_nodes(request: &ResourceMap, nodes: &NodeResourceMap) -> u32 {
    nodes
        .values()
        .map(|free| count_fits(request, free))
        .fold(0u32, u32::saturating_add)
}

/// Subtracts `request` from `free` in place, saturating at zero.
pub fn subtract_in_place(free: &mut ResourceMap, request: &ResourceMap) {
    for (resource, quantity) in request {
        let entry = free.entry(resource.clone()).or_insert(0.0);
        *entry = (*entry - quantity).max(0.0);
    }
}

/// Adds `request` onto `free` in place.
pub fn add_in_place(free: &mut ResourceMap, request: &ResourceMap) {
    for (resource, quantity) in request {
        *free.entry(resource.clone()).or_insert(0.0) += quantity;
    }
}

/// Sums a per-node map into a single cluster-wide resource map.
pub fn total(nodes: &NodeResourceMap) -> ResourceMap {
    let mut sum = ResourceMap::new();
    for free in nodes.values() {
        add_in_place(&mut sum, free);
    }
    sum
}

/// Returns every invalid entry of a resource request.
pub fn validate(request: &ResourceMap) -> Vec<String> {
    request
        .iter()
        .filter(|(_, quantity)| !quantity.is_finite() || **quantity < 0.0)
        .map(|(resource, quantity)| {
            format!("resource {resource:?} must be a non-negative number, got {quantity}")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources(pairs: &[(&str, f64)]) -> ResourceMap {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn zero_requests_are_ignored() {
        let request = resources(&[(RESOURCE_CPUS, 1.0), (RESOURCE_GPUS, 0.0)]);
        let free = resources(&[(RESOURCE_CPUS, 2.0)]);
        assert!(fits(&request, &free));
    }

    #[test]
    fn missing_resources_block_fit() {
        let request = resources(&[(RESOURCE_GPUS, 1.0)]);
        let free = resources(&[(RESOURCE_CPUS, 8.0)]);
        assert!(!fits(&request, &free));
    }

    #[test]
    fn count_fits_takes_the_scarcest_resource() {
        let request = resources(&[(RESOURCE_CPUS, 1.0), (RESOURCE_MEMORY, 1024.0)]);
        let free = resources(&[(RESOURCE_CPUS, 8.0), (RESOURCE_MEMORY, 2048.0)]);
        assert_eq!(count_fits(&request, &free), 2);
    }

    #[test]
    fn count_across_nodes_fills_node_by_node() {
        let request = resources(&[(RESOURCE_CPUS, 2.0)]);
        let nodes = NodeResourceMap::from([
            ("node-a".to_string(), resources(&[(RESOURCE_CPUS, 3.0)])),
            ("node-b".to_string(), resources(&[(RESOURCE_CPUS, 2.0)])),
        ]);
        // 1 on node-a (3/2), 1 on node-b: the leftover cpu on node-a does not
        // combine with node-b.
        assert_eq!(count_fits_across_nodes(&request, &nodes), 2);
    }

    #[test]
    fn subtract_saturates_at_zero() {
        let mut free = resources(&[(RESOURCE_CPUS, 1.0)]);
        subtract_in_place(&mut free, &resources(&[(RESOURCE_CPUS, 2.0)]));
        assert_eq!(free.get(RESOURCE_CPUS), Some(&0.0));
    }

    #[test]
    fn validation_rejects_negative_quantities() {
        let errors = validate(&resources(&[(RESOURCE_CPUS, -1.0)]));
        assert_eq!(errors.len(), 1);
        assert!(validate(&default_job_resources()).is_empty());
    }
}
