//! The endpoints controller: maintains this cluster's slice of every
//! service's Endpoints object from observed replica readiness.

use skyshift_store::{Informer, ObjectStore, StoreError};
use skyshift_types::kinds::{EndpointSlice, Endpoints, Job, JobState, Service};
use tokio::sync::watch;
use tracing::warn;

use super::{service::selector_matches, tick_or_shutdown};

#[derive(Clone)]
pub struct EndpointsController {
    pub cluster_name: String,
    pub store: ObjectStore,
    pub services: Informer<Service>,
    pub jobs: Informer<Job>,
    pub interval: std::time::Duration,
}

/// Ready (RUNNING) replicas on `cluster` across jobs selected by the
/// service.
pub(crate) fn ready_endpoints(service: &Service, jobs: &[Job], cluster: &str) -> u32 {
    jobs.iter()
        .filter(|job| {
            job.metadata.namespace == service.metadata.namespace
                && selector_matches(&service.spec.selector, &job.metadata.labels)
        })
        .filter_map(|job| job.status.replica_status.get(cluster))
        .filter_map(|slice| slice.get(&JobState::Running))
        .sum()
}

impl EndpointsController {
    pub async fn run(self, mut shutdown: watch::Receiver<()>) {
        loop {
            for service in self.services.snapshot() {
                if let Err(error) = self.reconcile_service(&service).await {
                    warn!(
                        cluster = %self.cluster_name,
                        service = %service.metadata.name,
                        %error,
                        "endpoints reconcile failed"
                    );
                }
            }
            if tick_or_shutdown(self.interval, &mut shutdown).await {
                return;
            }
        }
    }

    async fn reconcile_service(&self, service: &Service) -> Result<(), StoreError> {
        let jobs = self.jobs.snapshot();
        let ready = ready_endpoints(service, &jobs, &self.cluster_name);
        let namespace = service.metadata.namespace.clone();
        let Some(namespace) = namespace else {
            return Ok(());
        };

        // The Endpoints object shares the service's identity.
        for _ in 0..5 {
            let mut endpoints: Endpoints = match self
                .store
                .get(Some(&namespace), &service.metadata.name)
                .await
            {
                Ok(endpoints) => endpoints,
                Err(StoreError::NotFound { .. }) => {
                    if ready == 0 {
                        return Ok(());
                    }
                    let mut fresh = Endpoints::new(namespace.clone(), &service.metadata.name);
                    fresh.spec.selector = service.spec.selector.clone();
                    fresh.spec.primary_cluster = service.spec.primary_cluster.clone();
                    match self.store.create(fresh).await {
                        Ok(endpoints) => endpoints,
                        // Another Skylet created it first; reread.
                        Err(StoreError::AlreadyExists { .. }) => continue,
                        Err(error) => return Err(error),
                    }
                }
                Err(error) => return Err(error),
            };

            let existing = endpoints.spec.endpoints.get(&self.cluster_name);
            let changed = match existing {
                Some(slice) => slice.num_endpoints != ready,
                None => ready > 0,
            };
            if !changed {
                return Ok(());
            }

            if ready == 0 {
                endpoints.spec.endpoints.remove(&self.cluster_name);
            } else {
                let exposed = existing.map(|slice| slice.exposed_to_cluster).unwrap_or(false);
                endpoints.spec.endpoints.insert(
                    self.cluster_name.clone(),
                    EndpointSlice {
                        num_endpoints: ready,
                        exposed_to_cluster: exposed,
                    },
                );
            }
            if endpoints.spec.primary_cluster.is_none() {
                endpoints.spec.primary_cluster = service
                    .spec
                    .primary_cluster
                    .clone()
                    .or_else(|| endpoints.spec.endpoints.keys().next().cloned());
            }

            match self.store.update(endpoints).await {
                Ok(_) => return Ok(()),
                Err(StoreError::Conflict { .. }) => continue,
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }
}
