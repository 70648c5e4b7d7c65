//! The scheduling worker and its informer wiring.
//!
//! Producers (job events, cluster events, eviction wakeups) push job
//! references into the FIFO queue; one worker drains it and serializes all
//! placement decisions. Commits go through the optimistic status path and
//! restart the affected job's iteration on conflict.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use skyshift_store::{EventHandler, Informer, ObjectStore, StoreError};
use skyshift_types::{
    conditions::{set_condition, Condition, ConditionStatus},
    kinds::{Cluster, FilterPolicy, Job, JobState},
    resources, Object, ObjectRef,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    cache::{ClusterSnapshot, ReservationOverlay},
    plugins::{FilterComposition, PluginError, PluginSet, SchedulingContext},
    queue::WorkQueue,
    spread::{allocated_total, spread},
};

/// Condition type recorded when a job cannot be (fully) placed.
pub const UNSCHEDULABLE_CONDITION: &str = "Unschedulable";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Plugin pipeline, by registered name, in order.
    pub plugins: Vec<String>,

    /// How `placement.filters` compose. OR is the documented default.
    pub filter_composition: FilterComposition,

    /// How many conflict retries a single job's commit gets per pass.
    pub commit_retry_limit: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            plugins: vec![
                "DefaultPlugin".to_string(),
                "ClusterAffinityPlugin".to_string(),
            ],
            filter_composition: FilterComposition::Or,
            commit_retry_limit: 5,
        }
    }
}

type Waitlist = Mutex<HashSet<ObjectRef>>;

fn lock_waitlist(waitlist: &Waitlist) -> std::sync::MutexGuard<'_, HashSet<ObjectRef>> {
    match waitlist.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct Scheduler {
    store: ObjectStore,
    jobs: Informer<Job>,
    clusters: Informer<Cluster>,
    policies: Informer<FilterPolicy>,
    queue: Arc<WorkQueue>,
    waitlist: Arc<Waitlist>,
    reservations: Arc<ReservationOverlay>,
    plugins: PluginSet,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(store: ObjectStore, config: SchedulerConfig) -> Result<Self, PluginError> {
        let plugins = PluginSet::from_names(&config.plugins)?;
        let queue = Arc::new(WorkQueue::new());
        let waitlist: Arc<Waitlist> = Arc::new(Mutex::new(HashSet::new()));
        let reservations = Arc::new(ReservationOverlay::default());

        let jobs = Informer::new(store.clone(), None).with_handler(Arc::new(JobWatcher {
            queue: queue.clone(),
            waitlist: waitlist.clone(),
        }));
        let clusters =
            Informer::new(store.clone(), None).with_handler(Arc::new(ClusterWatcher {
                queue: queue.clone(),
                waitlist: waitlist.clone(),
                store: store.clone(),
                jobs: jobs.clone(),
                reservations: reservations.clone(),
            }));
        let policies = Informer::new(store.clone(), None);

        Ok(Scheduler {
            store,
            jobs,
            clusters,
            policies,
            queue,
            waitlist,
            reservations,
            plugins,
            config,
        })
    }

    /// Runs the informers and the single scheduling worker until shutdown.
    pub async fn run(self, shutdown: watch::Receiver<()>) {
        tokio::spawn(self.jobs.clone().run(shutdown.clone()));
        tokio::spawn(self.clusters.clone().run(shutdown.clone()));
        tokio::spawn(self.policies.clone().run(shutdown.clone()));

        self.jobs.wait_synced().await;
        self.clusters.wait_synced().await;
        self.policies.wait_synced().await;
        info!("scheduler started");

        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                reference = self.queue.pop() => {
                    self.schedule_one(&reference).await;
                }
            }
        }
    }

    /// Ready clusters as the plugin pipeline should see them, with
    /// not-yet-observed reservations deducted.
    fn cluster_snapshots(&self) -> Vec<ClusterSnapshot> {
        self.clusters
            .snapshot()
            .iter()
            .filter(|cluster| cluster.is_ready())
            .map(|cluster| {
                let mut snapshot = ClusterSnapshot::from_cluster(cluster);
                self.reservations.apply(&mut snapshot);
                snapshot
            })
            .collect()
    }

    fn context_for(&self, job: &Job) -> SchedulingContext {
        let policies = self
            .policies
            .snapshot()
            .into_iter()
            .filter(|policy| policy.metadata.namespace == job.metadata.namespace)
            .filter(|policy| policy.applies_to(&job.metadata.labels))
            .collect();
        SchedulingContext {
            policies,
            composition: self.config.filter_composition,
        }
    }

    async fn schedule_one(&self, reference: &ObjectRef) {
        let mut attempts = 0;
        loop {
            attempts += 1;

            let job: Job = match self
                .store
                .get(reference.namespace.as_deref(), &reference.name)
                .await
            {
                Ok(job) => job,
                Err(StoreError::NotFound { .. }) => return,
                Err(error) => {
                    warn!(%reference, %error, "failed to read job for scheduling");
                    return;
                }
            };

            if job.status.status.is_terminal() {
                return;
            }

            let outcome = self.place(&job);
            match self.commit(job, &outcome).await {
                Ok(()) => return,
                Err(StoreError::Conflict { .. }) if attempts <= self.config.commit_retry_limit => {
                    debug!(%reference, attempts, "placement commit conflicted, rereading");
                    continue;
                }
                Err(error) => {
                    warn!(%reference, %error, "placement commit failed");
                    return;
                }
            }
        }
    }

    fn place(&self, job: &Job) -> Placement {
        let remaining = job
            .spec
            .replicas
            .saturating_sub(job.status.active_replicas());
        if remaining == 0 {
            return Placement {
                allocations: vec![],
                remaining: 0,
                eligible: true,
            };
        }

        let snapshots = self.cluster_snapshots();
        let context = self.context_for(job);

        let eligible = self.plugins.filter(job, &context, snapshots);
        if eligible.is_empty() {
            return Placement {
                allocations: vec![],
                remaining,
                eligible: false,
            };
        }

        let scored = eligible
            .into_iter()
            .map(|cluster| {
                let score = self.plugins.score(job, &context, &cluster);
                (cluster, score)
            })
            .collect();

        Placement {
            allocations: spread(&job.spec.resources, remaining, scored),
            remaining,
            eligible: true,
        }
    }

    async fn commit(&self, mut job: Job, outcome: &Placement) -> Result<(), StoreError> {
        let reference = job.object_ref();
        let allocated = allocated_total(&outcome.allocations);
        let before = job.clone();

        // Evicted markers have served their purpose once the scheduler has
        // taken the eviction into account.
        for states in job.status.replica_status.values_mut() {
            states.remove(&JobState::Evicted);
        }
        job.status
            .replica_status
            .retain(|_, states| !states.is_empty());

        for allocation in &outcome.allocations {
            *job.status
                .replica_status
                .entry(allocation.cluster.clone())
                .or_default()
                .entry(JobState::Init)
                .or_insert(0) += allocation.replicas;
        }

        if outcome.remaining == 0 || allocated == outcome.remaining {
            // Do not regress a job the controllers already moved along.
            if matches!(
                job.status.status,
                JobState::Init | JobState::Pending | JobState::Scheduled
            ) {
                job.status.status = JobState::Scheduled;
            }
            set_condition(
                &mut job.status.conditions,
                Condition::new(
                    UNSCHEDULABLE_CONDITION,
                    ConditionStatus::False,
                    "Scheduled",
                    format!("all {} replicas placed", job.spec.replicas),
                ),
            );
            lock_waitlist(&self.waitlist).remove(&reference);
        } else if !outcome.eligible {
            job.status.status = JobState::Pending;
            set_condition(
                &mut job.status.conditions,
                Condition::new(
                    UNSCHEDULABLE_CONDITION,
                    ConditionStatus::True,
                    "NoEligibleCluster",
                    "no ready cluster passes the filter pipeline",
                ),
            );
            lock_waitlist(&self.waitlist).insert(reference.clone());
        } else {
            job.status.status = JobState::Pending;
            set_condition(
                &mut job.status.conditions,
                Condition::new(
                    UNSCHEDULABLE_CONDITION,
                    ConditionStatus::True,
                    "InsufficientCapacity",
                    format!(
                        "placed {allocated} of {} outstanding replicas",
                        outcome.remaining
                    ),
                ),
            );
            lock_waitlist(&self.waitlist).insert(reference.clone());
        }

        if job == before {
            // Re-running on the same observed state issues no writes.
            return Ok(());
        }

        let resources = job.spec.resources.clone();
        self.store.update_status(job).await?;

        for allocation in &outcome.allocations {
            self.reservations
                .reserve(&allocation.cluster, &resources, allocation.replicas);
        }
        if allocated > 0 {
            info!(
                %reference,
                placed = allocated,
                clusters = outcome.allocations.len(),
                "job placed"
            );
        }
        Ok(())
    }
}

struct Placement {
    allocations: Vec<crate::spread::Allocation>,
    remaining: u32,
    eligible: bool,
}

/// Enqueues jobs that need (re)scheduling.
struct JobWatcher {
    queue: Arc<WorkQueue>,
    waitlist: Arc<Waitlist>,
}

#[async_trait]
impl EventHandler<Job> for JobWatcher {
    async fn on_add(&self, new: &Job) {
        // Fresh jobs, plus unfinished ones surfacing after a restart.
        let needs_placement =
            new.spec.replicas > new.status.active_replicas() && !new.status.status.is_terminal();
        if needs_placement {
            self.queue.push(new.object_ref());
        }
    }

    async fn on_update(&self, old: &Job, new: &Job) {
        if new.status.status.is_terminal() {
            return;
        }

        let spec_changed = old.spec.placement != new.spec.placement
            || old.spec.resources != new.spec.resources
            || old.spec.replicas != new.spec.replicas;

        let evicted = |job: &Job| -> u32 {
            job.status
                .replica_status
                .values()
                .filter_map(|states| states.get(&JobState::Evicted))
                .sum()
        };
        let newly_evicted = evicted(new) > evicted(old);

        if spec_changed || newly_evicted {
            self.queue.push(new.object_ref());
        }
    }

    async fn on_delete(&self, old: &Job) {
        let reference = old.object_ref();
        self.queue.remove(&reference);
        lock_waitlist(&self.waitlist).remove(&reference);
    }
}

/// Wakes waitlisted jobs when capacity appears; purges slices of removed
/// clusters.
struct ClusterWatcher {
    queue: Arc<WorkQueue>,
    waitlist: Arc<Waitlist>,
    store: ObjectStore,
    jobs: Informer<Job>,
    reservations: Arc<ReservationOverlay>,
}

impl ClusterWatcher {
    fn wake_waitlist(&self) {
        for reference in lock_waitlist(&self.waitlist).iter() {
            self.queue.push(reference.clone());
        }
    }
}

fn allocatable_increased(old: &Cluster, new: &Cluster) -> bool {
    let before = resources::total(&old.status.allocatable_capacity);
    let after = resources::total(&new.status.allocatable_capacity);
    after
        .iter()
        .any(|(resource, quantity)| *quantity > before.get(resource).copied().unwrap_or(0.0) + 1e-9)
}

#[async_trait]
impl EventHandler<Cluster> for ClusterWatcher {
    async fn on_add(&self, new: &Cluster) {
        if new.is_ready() {
            self.wake_waitlist();
        }
    }

    async fn on_update(&self, old: &Cluster, new: &Cluster) {
        if old.status.allocatable_capacity != new.status.allocatable_capacity {
            // A fresh report from the Skylet supersedes local reservations.
            self.reservations.clear(&new.metadata.name);
        }

        let became_ready = !old.is_ready() && new.is_ready();
        if became_ready || (new.is_ready() && allocatable_increased(old, new)) {
            self.wake_waitlist();
        }
    }

    async fn on_delete(&self, old: &Cluster) {
        let cluster_name = &old.metadata.name;
        self.reservations.clear(cluster_name);

        // Purge the removed cluster's slices and re-enqueue the affected
        // jobs rather than leaving the record dangling.
        for job in self.jobs.snapshot() {
            if !job.status.replica_status.contains_key(cluster_name) {
                continue;
            }
            let reference = job.object_ref();
            for _ in 0..3 {
                let mut current: Job = match self
                    .store
                    .get(reference.namespace.as_deref(), &reference.name)
                    .await
                {
                    Ok(job) => job,
                    Err(_) => break,
                };
                current.status.replica_status.remove(cluster_name);
                current.status.job_ids.remove(cluster_name);
                match self.store.update_status(current).await {
                    Ok(_) => {
                        self.queue.push(reference.clone());
                        break;
                    }
                    Err(StoreError::Conflict { .. }) => continue,
                    Err(error) => {
                        warn!(%reference, %error, "failed to purge deleted cluster slice");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_increase_detection() {
        let mut old = Cluster::new("c1");
        old.status.allocatable_capacity.insert(
            "n1".to_string(),
            resources::ResourceMap::from([("cpus".to_string(), 2.0)]),
        );
        let mut new = old.clone();

        assert!(!allocatable_increased(&old, &new));

        new.status
            .allocatable_capacity
            .get_mut("n1")
            .expect("node present")
            .insert("cpus".to_string(), 4.0);
        assert!(allocatable_increased(&old, &new));

        // A decrease is not an increase.
        old.status
            .allocatable_capacity
            .get_mut("n1")
            .expect("node present")
            .insert("cpus".to_string(), 8.0);
        assert!(!allocatable_increased(&old, &new));
    }
}
