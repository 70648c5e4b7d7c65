//! One Skylet: the per-cluster supervisor hosting the reconciliation
//! controllers.

use std::{future::Future, sync::Arc, time::Duration};

use skyshift_compat::{ManagerError, ManagerFactory};
use skyshift_store::{Backoff, Informer, ObjectStore};
use skyshift_types::kinds::{Cluster, Job, Link, Service};
use snafu::Snafu;
use tokio::sync::watch;
use tracing::{error, info};

use crate::controllers::{
    cluster::ClusterController,
    endpoints::EndpointsController,
    flow::{FlowController, JobDeletionHandler},
    job::JobController,
    network::{LinkDeletionHandler, NetworkController},
    service::{ServiceController, ServiceDeletionHandler},
};

#[derive(Debug, Clone)]
pub struct SkyletConfig {
    pub cluster_poll_interval: Duration,
    pub job_poll_interval: Duration,
    pub flow_interval: Duration,
    pub service_interval: Duration,
    pub network_interval: Duration,

    /// Pending-timeout before a slice is evicted; `None` disables
    /// eviction.
    pub wait_timeout: Option<Duration>,

    /// How long a cluster may sit in ERROR before its Skylet is torn
    /// down.
    pub error_grace_period: Duration,
}

impl Default for SkyletConfig {
    fn default() -> Self {
        SkyletConfig {
            cluster_poll_interval: Duration::from_secs(10),
            job_poll_interval: Duration::from_secs(5),
            flow_interval: Duration::from_secs(5),
            service_interval: Duration::from_secs(10),
            network_interval: Duration::from_secs(15),
            wait_timeout: None,
            error_grace_period: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Snafu)]
pub enum SkyletError {
    #[snafu(display("failed to open the cluster manager"))]
    OpenManager { source: ManagerError },
}

/// Spawns a controller as a supervised task: a panic is logged and the
/// controller restarts with capped exponential backoff; a clean exit
/// (shutdown) ends supervision.
fn spawn_supervised<F, Fut>(
    name: &'static str,
    cluster: String,
    mut shutdown: watch::Receiver<()>,
    controller: F,
) where
    F: Fn(watch::Receiver<()>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = Backoff::for_reconnect();
        loop {
            let run = tokio::spawn(controller(shutdown.clone()));
            match run.await {
                Ok(()) => return,
                Err(join_error) => {
                    if join_error.is_cancelled() {
                        return;
                    }
                    error!(
                        controller = name,
                        cluster = %cluster,
                        "controller crashed; restarting"
                    );
                    let delay = backoff.next();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => return,
                    }
                }
            }
        }
    });
}

/// Runs one cluster's Skylet until `shutdown` fires.
///
/// Opens the compatibility layer, then hosts the cluster, job, flow,
/// service, endpoints and network controllers, each isolated in its own
/// supervised task.
pub async fn run_skylet(
    store: ObjectStore,
    factory: Arc<dyn ManagerFactory>,
    cluster: Cluster,
    config: SkyletConfig,
    mut shutdown: watch::Receiver<()>,
) -> Result<(), SkyletError> {
    let cluster_name = cluster.metadata.name.clone();
    let manager = factory
        .open(&cluster)
        .await
        .map_err(|source| SkyletError::OpenManager { source })?;

    info!(cluster = %cluster_name, "skylet starting");

    let jobs: Informer<Job> =
        Informer::new(store.clone(), None).with_handler(Arc::new(JobDeletionHandler {
            cluster_name: cluster_name.clone(),
            manager: manager.clone(),
        }));
    let services: Informer<Service> =
        Informer::new(store.clone(), None).with_handler(Arc::new(ServiceDeletionHandler {
            cluster_name: cluster_name.clone(),
            manager: manager.clone(),
        }));
    let links: Informer<Link> =
        Informer::new(store.clone(), None).with_handler(Arc::new(LinkDeletionHandler {
            cluster_name: cluster_name.clone(),
            manager: manager.clone(),
        }));

    tokio::spawn(jobs.clone().run(shutdown.clone()));
    tokio::spawn(services.clone().run(shutdown.clone()));
    tokio::spawn(links.clone().run(shutdown.clone()));
    jobs.wait_synced().await;
    services.wait_synced().await;
    links.wait_synced().await;

    let cluster_controller = ClusterController {
        cluster_name: cluster_name.clone(),
        store: store.clone(),
        manager: manager.clone(),
        interval: config.cluster_poll_interval,
    };
    spawn_supervised(
        "cluster",
        cluster_name.clone(),
        shutdown.clone(),
        move |shutdown| cluster_controller.clone().run(shutdown),
    );

    let job_controller = JobController {
        cluster_name: cluster_name.clone(),
        store: store.clone(),
        manager: manager.clone(),
        jobs: jobs.clone(),
        interval: config.job_poll_interval,
    };
    spawn_supervised(
        "job",
        cluster_name.clone(),
        shutdown.clone(),
        move |shutdown| job_controller.clone().run(shutdown),
    );

    let flow_controller = FlowController {
        cluster_name: cluster_name.clone(),
        store: store.clone(),
        manager: manager.clone(),
        jobs: jobs.clone(),
        interval: config.flow_interval,
        wait_timeout: config.wait_timeout,
    };
    spawn_supervised(
        "flow",
        cluster_name.clone(),
        shutdown.clone(),
        move |shutdown| flow_controller.clone().run(shutdown),
    );

    let service_controller = ServiceController {
        cluster_name: cluster_name.clone(),
        store: store.clone(),
        manager: manager.clone(),
        services: services.clone(),
        jobs: jobs.clone(),
        interval: config.service_interval,
    };
    spawn_supervised(
        "service",
        cluster_name.clone(),
        shutdown.clone(),
        move |shutdown| service_controller.clone().run(shutdown),
    );

    let endpoints_controller = EndpointsController {
        cluster_name: cluster_name.clone(),
        store: store.clone(),
        services: services.clone(),
        jobs: jobs.clone(),
        interval: config.service_interval,
    };
    spawn_supervised(
        "endpoints",
        cluster_name.clone(),
        shutdown.clone(),
        move |shutdown| endpoints_controller.clone().run(shutdown),
    );

    let network_controller = NetworkController {
        cluster_name: cluster_name.clone(),
        store: store.clone(),
        manager: manager.clone(),
        links: links.clone(),
        services: services.clone(),
        interval: config.network_interval,
    };
    spawn_supervised(
        "network",
        cluster_name.clone(),
        shutdown.clone(),
        move |shutdown| network_controller.clone().run(shutdown),
    );

    // The Skylet itself just waits for its cancellation.
    let _ = shutdown.changed().await;
    info!(cluster = %cluster_name, "skylet stopping");

    // Give the compatibility-layer handle back before the manager may
    // recreate this Skylet.
    factory.release(&cluster_name).await;
    Ok(())
}
