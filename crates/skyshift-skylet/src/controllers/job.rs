//! The job controller: observes backend replica states and folds them into
//! `status.replica_status`, driving job-level lifecycle transitions.

use std::{collections::BTreeMap, sync::Arc};

use skyshift_compat::ClusterManager;
use skyshift_store::{Informer, ObjectStore};
use skyshift_types::{
    conditions::{set_condition, Condition, ConditionStatus},
    kinds::{Job, JobState, RestartPolicy},
};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{tick_or_shutdown, update_status_with_retry};

#[derive(Clone)]
pub struct JobController {
    pub cluster_name: String,
    pub store: ObjectStore,
    pub manager: Arc<dyn ClusterManager>,
    pub jobs: Informer<Job>,
    pub interval: std::time::Duration,
}

/// Whether this cluster's slice needs no further polling.
fn slice_frozen(job: &Job, slice: &BTreeMap<JobState, u32>) -> bool {
    let total: u32 = slice.values().sum();
    if total == 0 {
        return true;
    }
    let settled: u32 = slice
        .iter()
        .filter(|(state, _)| state.is_terminal() || **state == JobState::Evicted)
        .map(|(_, count)| count)
        .sum();
    // Run-to-completion jobs freeze once every replica settled.
    settled == total && job.spec.restart_policy == RestartPolicy::Never
}

/// Merges observed backend counts with the slice's bookkeeping: replicas
/// the backend has not materialized yet stay INIT.
pub(crate) fn merge_observed(
    slice_total: u32,
    observed: &BTreeMap<JobState, u32>,
) -> BTreeMap<JobState, u32> {
    let mut merged = observed.clone();
    merged.retain(|_, count| *count > 0);
    let observed_total: u32 = merged.values().sum();
    if observed_total < slice_total {
        *merged.entry(JobState::Init).or_insert(0) += slice_total - observed_total;
    }
    merged
}

/// The job-level state implied by all cluster slices.
pub(crate) fn aggregate_state(job: &Job) -> JobState {
    let mut total = 0u32;
    let mut completed = 0u32;
    let mut failed = 0u32;
    let mut running = 0u32;

    for slice in job.status.replica_status.values() {
        for (state, count) in slice {
            total += count;
            match state {
                JobState::Running => running += count,
                JobState::Completed => completed += count,
                JobState::Failed => failed += count,
                _ => {}
            }
        }
    }

    if total == 0 {
        return job.status.status;
    }
    if running > 0 {
        JobState::Running
    } else if failed > 0 && job.spec.restart_policy == RestartPolicy::Never {
        JobState::Failed
    } else if completed == total && total >= job.spec.replicas {
        JobState::Completed
    } else {
        job.status.status
    }
}

impl JobController {
    pub async fn run(self, mut shutdown: watch::Receiver<()>) {
        loop {
            for job in self.jobs.snapshot() {
                let Some(slice) = job.status.replica_status.get(&self.cluster_name) else {
                    continue;
                };
                if slice_frozen(&job, slice) {
                    continue;
                }
                // Nothing submitted yet; the flow controller goes first.
                if !job.status.job_ids.contains_key(&self.cluster_name) {
                    continue;
                }

                let observed = match self.manager.poll_job(&job).await {
                    Ok(observed) => observed,
                    Err(error) => {
                        warn!(
                            cluster = %self.cluster_name,
                            job = %job.metadata.name,
                            %error,
                            "job poll failed"
                        );
                        continue;
                    }
                };

                let cluster_name = self.cluster_name.clone();
                let namespace = job.metadata.namespace.clone();
                let result = update_status_with_retry::<Job, _>(
                    &self.store,
                    namespace.as_deref(),
                    &job.metadata.name,
                    |current| {
                        let Some(slice) = current.status.replica_status.get(&cluster_name)
                        else {
                            return false;
                        };
                        let slice_total: u32 = slice.values().sum();
                        let mut merged = merge_observed(slice_total, &observed);

                        // A deployment-style job whose replicas all exited is
                        // handed back to the scheduler as an eviction.
                        if current.spec.restart_policy == RestartPolicy::Always {
                            let settled: u32 = merged
                                .iter()
                                .filter(|(state, _)| state.is_terminal())
                                .map(|(_, count)| count)
                                .sum();
                            if settled == slice_total && slice_total > 0 {
                                merged = BTreeMap::from([(JobState::Evicted, slice_total)]);
                                current.status.job_ids.remove(&cluster_name);
                            }
                        }

                        if *slice == merged {
                            return false;
                        }
                        current
                            .status
                            .replica_status
                            .insert(cluster_name.clone(), merged);

                        let aggregated = aggregate_state(current);
                        if aggregated != current.status.status {
                            current.status.status = aggregated;
                            set_condition(
                                &mut current.status.conditions,
                                Condition::new(
                                    "StateChanged",
                                    ConditionStatus::True,
                                    aggregated.to_string(),
                                    format!("job transitioned to {aggregated}"),
                                ),
                            );
                        }
                        true
                    },
                )
                .await;

                match result {
                    Ok(_) => {
                        debug!(cluster = %self.cluster_name, job = %job.metadata.name, "replica states folded")
                    }
                    Err(error) => {
                        warn!(cluster = %self.cluster_name, job = %job.metadata.name, %error, "replica status write failed")
                    }
                }
            }

            if tick_or_shutdown(self.interval, &mut shutdown).await {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_backfills_missing_replicas_as_init() {
        let observed = BTreeMap::from([(JobState::Running, 2)]);
        let merged = merge_observed(4, &observed);
        assert_eq!(merged.get(&JobState::Running), Some(&2));
        assert_eq!(merged.get(&JobState::Init), Some(&2));
    }

    #[test]
    fn merge_keeps_exact_counts_when_all_observed() {
        let observed = BTreeMap::from([(JobState::Running, 3), (JobState::Completed, 1)]);
        let merged = merge_observed(4, &observed);
        assert_eq!(merged.values().sum::<u32>(), 4);
        assert_eq!(merged.get(&JobState::Init), None);
    }

    #[test]
    fn aggregate_prefers_running() {
        let mut job = Job::new("default", "j1");
        job.spec.replicas = 3;
        job.status.replica_status.insert(
            "c1".into(),
            BTreeMap::from([(JobState::Running, 1), (JobState::Completed, 2)]),
        );
        assert_eq!(aggregate_state(&job), JobState::Running);
    }

    #[test]
    fn aggregate_completes_when_everything_finished() {
        let mut job = Job::new("default", "j1");
        job.spec.replicas = 2;
        job.status.status = JobState::Running;
        job.status
            .replica_status
            .insert("c1".into(), BTreeMap::from([(JobState::Completed, 2)]));
        assert_eq!(aggregate_state(&job), JobState::Completed);
    }

    #[test]
    fn aggregate_fails_only_for_never_restart_policy() {
        let mut job = Job::new("default", "j1");
        job.spec.replicas = 1;
        job.status.status = JobState::Running;
        job.status
            .replica_status
            .insert("c1".into(), BTreeMap::from([(JobState::Failed, 1)]));

        job.spec.restart_policy = RestartPolicy::Never;
        assert_eq!(aggregate_state(&job), JobState::Failed);

        // OnFailure jobs are resubmitted, not failed.
        job.spec.restart_policy = RestartPolicy::OnFailure;
        assert_eq!(aggregate_state(&job), JobState::Running);
    }

    #[test]
    fn frozen_slices_are_left_alone() {
        let mut job = Job::new("default", "j1");
        job.spec.restart_policy = RestartPolicy::Never;
        let slice = BTreeMap::from([(JobState::Completed, 2)]);
        assert!(slice_frozen(&job, &slice));

        job.spec.restart_policy = RestartPolicy::Always;
        assert!(!slice_frozen(&job, &slice));
    }
}
