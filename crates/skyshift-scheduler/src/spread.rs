//! Spreading a job's replicas across scored clusters.

use skyshift_types::resources::ResourceMap;

use crate::cache::ClusterSnapshot;

/// One cluster's share of a job's replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub cluster: String,
    pub replicas: u32,
}

/// Greedy fill, highest score first: each cluster takes
/// `min(remaining, capacity)` until every replica is placed or clusters
/// run out. Ties break by higher score, then lexicographic cluster name,
/// so the same snapshot always produces the same allocation.
pub fn spread(
    request: &ResourceMap,
    replicas: u32,
    mut scored: Vec<(ClusterSnapshot, u32)>,
) -> Vec<Allocation> {
    scored.sort_by(|(a, score_a), (b, score_b)| {
        score_b.cmp(score_a).then_with(|| a.name.cmp(&b.name))
    });

    let mut allocations = vec![];
    let mut remaining = replicas;
    for (cluster, _) in scored {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(cluster.replica_capacity(request));
        if take == 0 {
            continue;
        }
        allocations.push(Allocation {
            cluster: cluster.name,
            replicas: take,
        });
        remaining -= take;
    }
    allocations
}

/// Total replicas covered by an allocation list.
pub fn allocated_total(allocations: &[Allocation]) -> u32 {
    allocations.iter().map(|allocation| allocation.replicas).sum()
}
