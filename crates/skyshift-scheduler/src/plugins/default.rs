//! The default plugin: resource-fit filtering and free-capacity scoring.

use skyshift_types::{
    kinds::Job,
    resources::{RESOURCE_CPUS, RESOURCE_GPUS, RESOURCE_MEMORY},
};

use super::{FilterPlugin, SchedulingContext, ScorePlugin, MAX_SCORE};
use crate::cache::ClusterSnapshot;

pub struct DefaultPlugin;

impl FilterPlugin for DefaultPlugin {
    fn name(&self) -> &'static str {
        "DefaultPlugin"
    }

    /// Keeps clusters whose allocatable capacity can hold at least one
    /// replica of the job.
    fn filter(
        &self,
        job: &Job,
        _context: &SchedulingContext,
        clusters: Vec<ClusterSnapshot>,
    ) -> Vec<ClusterSnapshot> {
        clusters
            .into_iter()
            .filter(|cluster| cluster.replica_capacity(&job.spec.resources) >= 1)
            .collect()
    }
}

impl ScorePlugin for DefaultPlugin {
    fn name(&self) -> &'static str {
        "DefaultPlugin"
    }

    /// Scores by how much of the requested resource mix the cluster has
    /// free: the average free fraction of CPU, memory and accelerators,
    /// weighted onto `0..=MAX_SCORE`. A cluster with more headroom for
    /// the job's shape scores higher.
    fn score(&self, job: &Job, _context: &SchedulingContext, cluster: &ClusterSnapshot) -> u32 {
        let free = cluster.free_total();

        let mut fractions = vec![];
        for resource in [RESOURCE_CPUS, RESOURCE_MEMORY, RESOURCE_GPUS] {
            let requested = job.spec.resources.get(resource).copied().unwrap_or(0.0);
            if requested <= 0.0 {
                continue;
            }
            let available = free.get(resource).copied().unwrap_or(0.0);
            // Headroom in units of the request, saturating at 10 replicas
            // worth so one huge cluster does not flatten the scale.
            let headroom = (available / requested).min(10.0) / 10.0;
            fractions.push(headroom);
        }

        if fractions.is_empty() {
            return MAX_SCORE / 2;
        }
        let average = fractions.iter().sum::<f64>() / fractions.len() as f64;
        (average * f64::from(MAX_SCORE)).round() as u32
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use skyshift_types::resources::{NodeResourceMap, ResourceMap};

    use super::*;
    use crate::plugins::FilterComposition;

    fn context() -> SchedulingContext {
        SchedulingContext {
            policies: vec![],
            composition: FilterComposition::Or,
        }
    }

    fn cluster(name: &str, cpus: f64) -> ClusterSnapshot {
        ClusterSnapshot {
            name: name.to_string(),
            labels: BTreeMap::new(),
            allocatable: NodeResourceMap::from([(
                "node-1".to_string(),
                ResourceMap::from([(RESOURCE_CPUS.to_string(), cpus)]),
            )]),
        }
    }

    fn job_requesting(cpus: f64) -> Job {
        let mut job = Job::new("default", "j1");
        job.spec.image = "ubuntu:22.04".to_string();
        job.spec
            .resources
            .insert(RESOURCE_CPUS.to_string(), cpus);
        job
    }

    #[test]
    fn filter_keeps_clusters_that_fit_one_replica() {
        let job = job_requesting(2.0);
        let kept = FilterPlugin::filter(
            &DefaultPlugin,
            &job,
            &context(),
            vec![cluster("small", 1.0), cluster("big", 4.0)],
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "big");
    }

    #[test]
    fn score_grows_with_headroom() {
        let job = job_requesting(1.0);
        let tight = ScorePlugin::score(&DefaultPlugin, &job, &context(), &cluster("tight", 1.0));
        let roomy = ScorePlugin::score(&DefaultPlugin, &job, &context(), &cluster("roomy", 8.0));
        assert!(roomy > tight);
        assert!(roomy <= MAX_SCORE);
    }
}
