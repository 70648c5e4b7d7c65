//! The flow controller: the active reconciler turning `replica_status`
//! desires into backend submissions and deletions.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use skyshift_compat::ClusterManager;
use skyshift_store::{Informer, ObjectStore};
use skyshift_types::{
    conditions::{set_condition, Condition, ConditionStatus},
    kinds::{Job, JobState, RestartPolicy},
    Object, ObjectRef,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{tick_or_shutdown, update_status_with_retry};

#[derive(Clone)]
pub struct FlowController {
    pub cluster_name: String,
    pub store: ObjectStore,
    pub manager: Arc<dyn ClusterManager>,
    pub jobs: Informer<Job>,
    pub interval: std::time::Duration,

    /// How long the slice's first replica may sit PENDING before the slice
    /// is evicted. `None` disables eviction.
    pub wait_timeout: Option<Duration>,
}

impl FlowController {
    pub async fn run(self, mut shutdown: watch::Receiver<()>) {
        // When each job's slice was first observed with pending replicas
        // and nothing running yet.
        let mut pending_since: HashMap<ObjectRef, Instant> = HashMap::new();

        loop {
            for job in self.jobs.snapshot() {
                if let Err(error) = self.reconcile(&job, &mut pending_since).await {
                    warn!(
                        cluster = %self.cluster_name,
                        job = %job.metadata.name,
                        %error,
                        "flow reconcile failed"
                    );
                }
            }

            // Drop timers for jobs that no longer exist.
            let live: std::collections::HashSet<ObjectRef> = self
                .jobs
                .snapshot()
                .iter()
                .map(|job| job.object_ref())
                .collect();
            pending_since.retain(|reference, _| live.contains(reference));

            if tick_or_shutdown(self.interval, &mut shutdown).await {
                return;
            }
        }
    }

    async fn reconcile(
        &self,
        cached: &Job,
        pending_since: &mut HashMap<ObjectRef, Instant>,
    ) -> Result<(), FlowError> {
        // The informer cache can trail this controller's own status
        // writes; decisions that issue backend operations work off the
        // authoritative stored object.
        let job: &Job = &match self
            .store
            .get(cached.metadata.namespace.as_deref(), &cached.metadata.name)
            .await
        {
            Ok(job) => job,
            Err(skyshift_store::StoreError::NotFound { .. }) => return Ok(()),
            Err(error) => return Err(error.into()),
        };

        let Some(slice) = job.status.replica_status.get(&self.cluster_name) else {
            return Ok(());
        };

        let desired: u32 = slice
            .iter()
            .filter(|(state, _)| !matches!(state, JobState::Evicted | JobState::Deleted))
            .map(|(_, count)| count)
            .sum();
        if desired == 0 {
            return Ok(());
        }

        let submitted = job.status.job_ids.contains_key(&self.cluster_name);
        let init_count = slice.get(&JobState::Init).copied().unwrap_or(0);
        let failed_count = slice.get(&JobState::Failed).copied().unwrap_or(0);

        if !submitted {
            // First submission for this slice.
            let job_id = self.manager.submit_job(job, desired).await?;
            info!(
                cluster = %self.cluster_name,
                job = %job.metadata.name,
                replicas = desired,
                backend_id = %job_id,
                "slice submitted"
            );
            self.record_submission(job, &job_id).await?;
            return Ok(());
        }

        if failed_count > 0 && job.spec.restart_policy == RestartPolicy::OnFailure {
            // Resubmission path: tear the backend job down and start over.
            info!(
                cluster = %self.cluster_name,
                job = %job.metadata.name,
                failed = failed_count,
                "resubmitting failed slice"
            );
            self.manager.delete_job(job).await?;
            let job_id = self.manager.submit_job(job, desired).await?;
            self.record_submission(job, &job_id).await?;
            return Ok(());
        }

        if init_count > 0 {
            // The slice grew (scheduler added replicas); reconcile the
            // backend's replica count. Managers treat resubmission of an
            // existing job as a scale, so this stays idempotent.
            debug!(
                cluster = %self.cluster_name,
                job = %job.metadata.name,
                grow_by = init_count,
                "scaling slice"
            );
            let job_id = self.manager.submit_job(job, desired).await?;
            self.record_submission(job, &job_id).await?;
            return Ok(());
        }

        self.maybe_evict(job, slice, pending_since).await
    }

    /// Moves INIT replicas to PENDING and records the backend job id.
    async fn record_submission(&self, job: &Job, job_id: &str) -> Result<(), FlowError> {
        let cluster_name = self.cluster_name.clone();
        let job_id = job_id.to_string();
        update_status_with_retry::<Job, _>(
            &self.store,
            job.metadata.namespace.as_deref(),
            &job.metadata.name,
            |current| {
                let mut changed = false;
                if current.status.job_ids.get(&cluster_name) != Some(&job_id) {
                    current
                        .status
                        .job_ids
                        .insert(cluster_name.clone(), job_id.clone());
                    changed = true;
                }
                if let Some(slice) = current.status.replica_status.get_mut(&cluster_name) {
                    let init = slice.remove(&JobState::Init).unwrap_or(0);
                    if init > 0 {
                        *slice.entry(JobState::Pending).or_insert(0) += init;
                        changed = true;
                    }
                }
                changed
            },
        )
        .await?;
        Ok(())
    }

    /// Evicts the slice when its first replica has been PENDING longer
    /// than the configured timeout without anything starting.
    async fn maybe_evict(
        &self,
        job: &Job,
        slice: &std::collections::BTreeMap<JobState, u32>,
        pending_since: &mut HashMap<ObjectRef, Instant>,
    ) -> Result<(), FlowError> {
        let Some(timeout) = self.wait_timeout else {
            return Ok(());
        };

        let pending = slice.get(&JobState::Pending).copied().unwrap_or(0);
        let running = slice.get(&JobState::Running).copied().unwrap_or(0);
        let reference = job.object_ref();

        if pending == 0 || running > 0 {
            pending_since.remove(&reference);
            return Ok(());
        }

        let since = pending_since.entry(reference.clone()).or_insert_with(Instant::now);
        if since.elapsed() < timeout {
            return Ok(());
        }

        info!(
            cluster = %self.cluster_name,
            job = %job.metadata.name,
            pending,
            "evicting slice after pending timeout"
        );
        self.manager.delete_job(job).await?;
        pending_since.remove(&reference);

        let cluster_name = self.cluster_name.clone();
        update_status_with_retry::<Job, _>(
            &self.store,
            job.metadata.namespace.as_deref(),
            &job.metadata.name,
            |current| {
                let Some(slice) = current.status.replica_status.get_mut(&cluster_name) else {
                    return false;
                };
                let evicted: u32 = slice
                    .iter()
                    .filter(|(state, _)| !matches!(state, JobState::Evicted | JobState::Deleted))
                    .map(|(_, count)| count)
                    .sum();
                if evicted == 0 {
                    return false;
                }
                slice.clear();
                slice.insert(JobState::Evicted, evicted);
                current.status.job_ids.remove(&cluster_name);
                set_condition(
                    &mut current.status.conditions,
                    Condition::new(
                        "Evicted",
                        ConditionStatus::True,
                        "PendingTimeout",
                        format!("{evicted} replicas evicted from {cluster_name}"),
                    ),
                );
                true
            },
        )
        .await?;
        Ok(())
    }
}

/// Cleans backend jobs up when their store object is deleted.
pub struct JobDeletionHandler {
    pub cluster_name: String,
    pub manager: Arc<dyn ClusterManager>,
}

#[async_trait::async_trait]
impl skyshift_store::EventHandler<Job> for JobDeletionHandler {
    async fn on_add(&self, _new: &Job) {}

    async fn on_update(&self, _old: &Job, _new: &Job) {}

    async fn on_delete(&self, old: &Job) {
        if !old.status.replica_status.contains_key(&self.cluster_name) {
            return;
        }
        if let Err(error) = self.manager.delete_job(old).await {
            warn!(
                cluster = %self.cluster_name,
                job = %old.metadata.name,
                %error,
                "failed to delete backend job for removed object"
            );
        }
    }
}

#[derive(Debug, snafu::Snafu)]
pub enum FlowError {
    #[snafu(context(false))]
    Manager {
        source: skyshift_compat::ManagerError,
    },

    #[snafu(context(false))]
    Store {
        source: skyshift_store::StoreError,
    },
}
