//! The network controller: mesh peering (Links) and cross-cluster service
//! export/import.

use std::{collections::HashSet, sync::Arc};

use skyshift_compat::{ClusterManager, ManagerError};
use skyshift_store::{Informer, ObjectStore, StoreError};
use skyshift_types::{
    conditions::{set_condition, Condition, ConditionStatus},
    kinds::{Endpoints, Link, LinkState, Service},
};
use tokio::sync::watch;
use tracing::{info, warn};

use super::{tick_or_shutdown, update_status_with_retry};

#[derive(Clone)]
pub struct NetworkController {
    pub cluster_name: String,
    pub store: ObjectStore,
    pub manager: Arc<dyn ClusterManager>,
    pub links: Informer<Link>,
    pub services: Informer<Service>,
    pub interval: std::time::Duration,
}

impl NetworkController {
    pub async fn run(self, mut shutdown: watch::Receiver<()>) {
        // Imports already performed, to keep the tick idempotent on
        // backends whose import call is not.
        let mut imported: HashSet<(String, String)> = HashSet::new();

        loop {
            for link in self.links.snapshot() {
                if let Err(error) = self.reconcile_link(&link).await {
                    warn!(
                        cluster = %self.cluster_name,
                        link = %link.metadata.name,
                        %error,
                        "link reconcile failed"
                    );
                }
            }

            if let Err(error) = self.reconcile_service_mesh(&mut imported).await {
                warn!(cluster = %self.cluster_name, %error, "service mesh reconcile failed");
            }

            if tick_or_shutdown(self.interval, &mut shutdown).await {
                return;
            }
        }
    }

    /// The source side drives link establishment; the target side only
    /// consumes its state.
    async fn reconcile_link(&self, link: &Link) -> Result<(), StoreError> {
        if link.spec.source != self.cluster_name || link.status.phase != LinkState::Init {
            return Ok(());
        }

        let (phase, condition) = match self.manager.create_link(link).await {
            Ok(()) => {
                info!(link = %link.metadata.name, "link established");
                (
                    LinkState::Active,
                    Condition::new("Established", ConditionStatus::True, "PeerCreated", ""),
                )
            }
            Err(error @ ManagerError::Unsupported { .. }) => (
                LinkState::Failed,
                Condition::new(
                    "Established",
                    ConditionStatus::False,
                    "Unsupported",
                    error.to_string(),
                ),
            ),
            Err(error) => {
                // Transient: stay INIT and let the next tick retry.
                warn!(link = %link.metadata.name, %error, "link establishment failed");
                return Ok(());
            }
        };

        update_status_with_retry::<Link, _>(
            &self.store,
            None,
            &link.metadata.name,
            move |current| {
                if current.status.phase == phase {
                    return false;
                }
                current.status.phase = phase;
                set_condition(&mut current.status.conditions, condition.clone());
                true
            },
        )
        .await?;
        Ok(())
    }

    /// Exposes local service endpoints over active links towards the
    /// primary cluster, and imports remote ones when this cluster is the
    /// primary.
    async fn reconcile_service_mesh(
        &self,
        imported: &mut HashSet<(String, String)>,
    ) -> Result<(), StoreError> {
        let links = self.links.snapshot();
        let endpoints_list = self.store.list::<Endpoints>(None).await?;

        for endpoints in endpoints_list.items {
            let Some(primary) = endpoints.spec.primary_cluster.clone() else {
                continue;
            };
            let Some(service) = self.service_for(&endpoints) else {
                continue;
            };

            // Export: our slice feeds a remote primary.
            if primary != self.cluster_name {
                let slice = endpoints.spec.endpoints.get(&self.cluster_name);
                let needs_export = slice
                    .map(|slice| slice.num_endpoints > 0 && !slice.exposed_to_cluster)
                    .unwrap_or(false);
                let linked = links
                    .iter()
                    .any(|link| link.connects(&self.cluster_name, &primary) && link.status.phase == LinkState::Active);
                if needs_export && linked {
                    match self.manager.expose_service(&service, &primary).await {
                        Ok(()) => {
                            self.mark_exposed(&endpoints).await?;
                            info!(
                                service = %service.metadata.name,
                                peer = %primary,
                                "service exposed over link"
                            );
                        }
                        Err(ManagerError::Unsupported { .. }) => {}
                        Err(error) => {
                            warn!(service = %service.metadata.name, %error, "expose failed")
                        }
                    }
                }
                continue;
            }

            // Import: we are the primary; pull in every exposed remote
            // slice.
            for (remote, slice) in &endpoints.spec.endpoints {
                if remote == &self.cluster_name || !slice.exposed_to_cluster {
                    continue;
                }
                let key = (service.metadata.name.clone(), remote.clone());
                if imported.contains(&key) {
                    continue;
                }
                match self.manager.import_service(&service, remote).await {
                    Ok(()) => {
                        imported.insert(key);
                        info!(
                            service = %service.metadata.name,
                            peer = %remote,
                            "service imported over link"
                        );
                    }
                    Err(ManagerError::Unsupported { .. }) => {}
                    Err(error) => {
                        warn!(service = %service.metadata.name, %error, "import failed")
                    }
                }
            }
        }
        Ok(())
    }

    fn service_for(&self, endpoints: &Endpoints) -> Option<Service> {
        self.services.snapshot().into_iter().find(|service| {
            service.metadata.name == endpoints.metadata.name
                && service.metadata.namespace == endpoints.metadata.namespace
        })
    }

    async fn mark_exposed(&self, endpoints: &Endpoints) -> Result<(), StoreError> {
        let namespace = endpoints.metadata.namespace.clone();
        for _ in 0..5 {
            let mut current: Endpoints = match self
                .store
                .get(namespace.as_deref(), &endpoints.metadata.name)
                .await
            {
                Ok(current) => current,
                Err(StoreError::NotFound { .. }) => return Ok(()),
                Err(error) => return Err(error),
            };
            let Some(slice) = current.spec.endpoints.get_mut(&self.cluster_name) else {
                return Ok(());
            };
            if slice.exposed_to_cluster {
                return Ok(());
            }
            slice.exposed_to_cluster = true;
            match self.store.update(current).await {
                Ok(_) => return Ok(()),
                Err(StoreError::Conflict { .. }) => continue,
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }
}

/// Tears the mesh peer down when a Link object is deleted.
pub struct LinkDeletionHandler {
    pub cluster_name: String,
    pub manager: Arc<dyn ClusterManager>,
}

#[async_trait::async_trait]
impl skyshift_store::EventHandler<Link> for LinkDeletionHandler {
    async fn on_add(&self, _new: &Link) {}

    async fn on_update(&self, _old: &Link, _new: &Link) {}

    async fn on_delete(&self, old: &Link) {
        if old.spec.source != self.cluster_name {
            return;
        }
        match self.manager.delete_link(old).await {
            Ok(()) | Err(ManagerError::Unsupported { .. }) => {}
            Err(error) => warn!(
                link = %old.metadata.name,
                %error,
                "failed to delete mesh peer for removed link"
            ),
        }
    }
}
