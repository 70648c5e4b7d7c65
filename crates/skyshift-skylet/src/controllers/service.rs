//! The service controller: reconciles Service objects onto the cluster's
//! native service fabric and reads observed IPs back.

use std::{collections::BTreeMap, sync::Arc};

use skyshift_compat::{ClusterManager, ManagerError};
use skyshift_store::{Informer, ObjectStore};
use skyshift_types::kinds::{Job, Service};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{tick_or_shutdown, update_status_with_retry};

#[derive(Clone)]
pub struct ServiceController {
    pub cluster_name: String,
    pub store: ObjectStore,
    pub manager: Arc<dyn ClusterManager>,
    pub services: Informer<Service>,
    pub jobs: Informer<Job>,
    pub interval: std::time::Duration,
}

/// Whether a service has backing replicas on this cluster (or names it as
/// the primary).
pub(crate) fn service_on_cluster(service: &Service, jobs: &[Job], cluster: &str) -> bool {
    if service.spec.primary_cluster.as_deref() == Some(cluster) {
        return true;
    }
    if service.spec.primary_cluster.is_some() {
        return false;
    }
    jobs.iter().any(|job| {
        job.metadata.namespace == service.metadata.namespace
            && selector_matches(&service.spec.selector, &job.metadata.labels)
            && job.status.replica_status.contains_key(cluster)
    })
}

pub(crate) fn selector_matches(
    selector: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
) -> bool {
    !selector.is_empty() && selector.iter().all(|(key, value)| labels.get(key) == Some(value))
}

impl ServiceController {
    pub async fn run(self, mut shutdown: watch::Receiver<()>) {
        loop {
            if let Err(error) = self.reconcile_once().await {
                warn!(cluster = %self.cluster_name, %error, "service reconcile failed");
            }
            if tick_or_shutdown(self.interval, &mut shutdown).await {
                return;
            }
        }
    }

    async fn reconcile_once(&self) -> Result<(), ManagerError> {
        let jobs = self.jobs.snapshot();
        let desired: Vec<Service> = self
            .services
            .snapshot()
            .into_iter()
            .filter(|service| service_on_cluster(service, &jobs, &self.cluster_name))
            .collect();

        let deployed = match self.manager.list_services().await {
            Ok(deployed) => deployed,
            // A backend without a service fabric has nothing to reconcile.
            Err(ManagerError::Unsupported { .. }) => return Ok(()),
            Err(error) => return Err(error),
        };

        for service in &desired {
            let observed = deployed.iter().find(|existing| {
                existing.metadata.name == service.metadata.name
                    && existing.metadata.namespace == service.metadata.namespace
            });

            match observed {
                None => {
                    self.manager.submit_service(service).await?;
                    info!(
                        cluster = %self.cluster_name,
                        service = %service.metadata.name,
                        "service submitted"
                    );
                }
                Some(observed) => {
                    self.publish_ips(service, observed).await;
                }
            }
        }

        // Deployed services whose object is gone (or no longer placed
        // here) get torn down.
        for stray in &deployed {
            let still_wanted = desired.iter().any(|service| {
                service.metadata.name == stray.metadata.name
                    && service.metadata.namespace == stray.metadata.namespace
            });
            if !still_wanted {
                debug!(
                    cluster = %self.cluster_name,
                    service = %stray.metadata.name,
                    "removing stray service"
                );
                self.manager.delete_service(stray).await?;
            }
        }

        Ok(())
    }

    async fn publish_ips(&self, service: &Service, observed: &Service) {
        let cluster_ip = observed.status.cluster_ip.clone();
        let external_ip = observed.status.external_ip.clone();
        if cluster_ip.is_none() && external_ip.is_none() {
            return;
        }

        let result = update_status_with_retry::<Service, _>(
            &self.store,
            service.metadata.namespace.as_deref(),
            &service.metadata.name,
            |current| {
                let changed = current.status.cluster_ip != cluster_ip
                    || current.status.external_ip != external_ip;
                if changed {
                    current.status.cluster_ip = cluster_ip.clone();
                    current.status.external_ip = external_ip.clone();
                }
                changed
            },
        )
        .await;
        if let Err(error) = result {
            warn!(
                cluster = %self.cluster_name,
                service = %service.metadata.name,
                %error,
                "failed to publish service ips"
            );
        }
    }
}

/// Tears backend services down when their store object is deleted.
pub struct ServiceDeletionHandler {
    pub cluster_name: String,
    pub manager: Arc<dyn ClusterManager>,
}

#[async_trait::async_trait]
impl skyshift_store::EventHandler<Service> for ServiceDeletionHandler {
    async fn on_add(&self, _new: &Service) {}

    async fn on_update(&self, _old: &Service, _new: &Service) {}

    async fn on_delete(&self, old: &Service) {
        match self.manager.delete_service(old).await {
            Ok(()) | Err(ManagerError::Unsupported { .. }) => {}
            Err(error) => warn!(
                cluster = %self.cluster_name,
                service = %old.metadata.name,
                %error,
                "failed to delete backend service for removed object"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labeled_job(cluster: &str, labels: &[(&str, &str)]) -> Job {
        let mut job = Job::new("default", "j1");
        job.metadata.labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        job.status
            .replica_status
            .insert(cluster.to_string(), Default::default());
        job
    }

    #[test]
    fn explicit_primary_cluster_wins() {
        let mut service = Service::new("default", "svc");
        service.spec.primary_cluster = Some("c1".to_string());

        assert!(service_on_cluster(&service, &[], "c1"));
        assert!(!service_on_cluster(&service, &[], "c2"));
    }

    #[test]
    fn auto_placement_follows_selected_jobs() {
        let mut service = Service::new("default", "svc");
        service
            .spec
            .selector
            .insert("app".to_string(), "web".to_string());

        let jobs = vec![labeled_job("c1", &[("app", "web")])];
        assert!(service_on_cluster(&service, &jobs, "c1"));
        assert!(!service_on_cluster(&service, &jobs, "c2"));

        let unrelated = vec![labeled_job("c1", &[("app", "db")])];
        assert!(!service_on_cluster(&service, &unrelated, "c1"));
    }

    #[test]
    fn empty_selectors_match_nothing() {
        let service = Service::new("default", "svc");
        let jobs = vec![labeled_job("c1", &[("app", "web")])];
        assert!(!service_on_cluster(&service, &jobs, "c1"));
    }
}
