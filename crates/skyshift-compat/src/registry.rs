//! Opening and caching cluster managers.
//!
//! The factory is the seam between Skylets and concrete backends: the
//! Skylet manager releases a cluster's handle when its Skylet is torn down,
//! and tests substitute their own factory with a scripted manager.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use skyshift_types::kinds::{Cluster, ManagerType};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    kubernetes::KubernetesManager, ray::RayManager, slurm::SlurmManager, ClusterManager, Result,
};

#[async_trait]
pub trait ManagerFactory: Send + Sync + 'static {
    /// Opens (or returns a cached) manager for `cluster`.
    async fn open(&self, cluster: &Cluster) -> Result<Arc<dyn ClusterManager>>;

    /// Drops the cached handle for `cluster_name`, closing backend
    /// connections. Must be called before a Skylet is recreated.
    async fn release(&self, cluster_name: &str);
}

/// The production factory: one manager per registered cluster, selected by
/// the cluster's `spec.manager`.
#[derive(Default)]
pub struct DefaultManagerFactory {
    managers: Mutex<HashMap<String, Arc<dyn ClusterManager>>>,
}

#[async_trait]
impl ManagerFactory for DefaultManagerFactory {
    async fn open(&self, cluster: &Cluster) -> Result<Arc<dyn ClusterManager>> {
        let mut managers = self.managers.lock().await;
        if let Some(manager) = managers.get(&cluster.metadata.name) {
            return Ok(manager.clone());
        }

        let manager: Arc<dyn ClusterManager> = match cluster.spec.manager {
            ManagerType::K8 => Arc::new(KubernetesManager::connect(cluster).await?),
            ManagerType::Slurm => Arc::new(SlurmManager::connect(cluster).await?),
            ManagerType::Ray => Arc::new(RayManager::connect(cluster)?),
        };

        debug!(cluster = %cluster.metadata.name, manager = %cluster.spec.manager, "opened cluster manager");
        managers.insert(cluster.metadata.name.clone(), manager.clone());
        Ok(manager)
    }

    async fn release(&self, cluster_name: &str) {
        if self.managers.lock().await.remove(cluster_name).is_some() {
            debug!(cluster = %cluster_name, "released cluster manager");
        }
    }
}
