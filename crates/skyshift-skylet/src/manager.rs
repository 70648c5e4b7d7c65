//! The Skylet manager: one supervised Skylet per registered cluster.
//!
//! Driven by a Cluster informer: a new cluster gets a Skylet, a deleted
//! cluster (or one stuck in ERROR past the grace period) loses it. Skylets
//! are isolated from each other; a crashing Skylet restarts with capped
//! backoff and never takes the manager down.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use skyshift_compat::ManagerFactory;
use skyshift_store::{Backoff, EventHandler, Informer, ObjectStore};
use skyshift_types::kinds::{Cluster, ClusterState};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::skylet::{run_skylet, SkyletConfig};

/// How often the manager sweeps for clusters stuck in ERROR.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

struct SkyletHandle {
    shutdown: watch::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
struct ManagerState {
    skylets: HashMap<String, SkyletHandle>,
    /// When each cluster was first observed in ERROR.
    error_since: HashMap<String, Instant>,
}

pub struct SkyletManager {
    store: ObjectStore,
    factory: Arc<dyn ManagerFactory>,
    config: SkyletConfig,
    state: Arc<Mutex<ManagerState>>,
}

impl SkyletManager {
    pub fn new(
        store: ObjectStore,
        factory: Arc<dyn ManagerFactory>,
        config: SkyletConfig,
    ) -> Self {
        SkyletManager {
            store,
            factory,
            config,
            state: Arc::new(Mutex::new(ManagerState::default())),
        }
    }

    /// Runs the manager until `shutdown` fires, then tears every Skylet
    /// down.
    pub async fn run(self, mut shutdown: watch::Receiver<()>) {
        let handler = Arc::new(ClusterLifecycleHandler {
            store: self.store.clone(),
            factory: self.factory.clone(),
            config: self.config.clone(),
            state: self.state.clone(),
        });
        let clusters: Informer<Cluster> =
            Informer::new(self.store.clone(), None).with_handler(handler.clone());
        tokio::spawn(clusters.clone().run(shutdown.clone()));
        clusters.wait_synced().await;
        info!("skylet manager started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                    handler.sweep_errored(&clusters).await;
                }
            }
        }

        // Cancel every Skylet and wait for the handles to come back.
        let mut state = self.state.lock().await;
        for (cluster_name, handle) in state.skylets.drain() {
            let _ = handle.shutdown.send(());
            let _ = handle.task.await;
            info!(cluster = %cluster_name, "skylet stopped");
        }
    }
}

struct ClusterLifecycleHandler {
    store: ObjectStore,
    factory: Arc<dyn ManagerFactory>,
    config: SkyletConfig,
    state: Arc<Mutex<ManagerState>>,
}

impl ClusterLifecycleHandler {
    /// Starts a supervised Skylet for `cluster` unless one is running.
    async fn ensure_skylet(&self, cluster: &Cluster) {
        let cluster_name = cluster.metadata.name.clone();
        let mut state = self.state.lock().await;
        if state.skylets.contains_key(&cluster_name) {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let store = self.store.clone();
        let factory = self.factory.clone();
        let config = self.config.clone();
        let cluster = cluster.clone();
        let task_name = cluster_name.clone();

        let task = tokio::spawn(async move {
            let mut backoff = Backoff::for_reconnect();
            let mut shutdown_probe = shutdown_rx.clone();
            loop {
                // Run the Skylet in its own task so a panic is contained
                // and surfaces as a JoinError here.
                let run = tokio::spawn(run_skylet(
                    store.clone(),
                    factory.clone(),
                    cluster.clone(),
                    config.clone(),
                    shutdown_rx.clone(),
                ));
                match run.await {
                    Ok(Ok(())) => return,
                    Ok(Err(error)) => {
                        warn!(cluster = %task_name, %error, "skylet failed to start");
                    }
                    Err(join_error) if join_error.is_cancelled() => return,
                    Err(_) => {
                        warn!(cluster = %task_name, "skylet crashed");
                    }
                }
                // A failed Skylet must not hold backend handles across the
                // restart.
                factory.release(&task_name).await;
                let delay = backoff.next();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_probe.changed() => return,
                }
            }
        });

        info!(cluster = %cluster_name, "skylet created");
        state.skylets.insert(
            cluster_name,
            SkyletHandle {
                shutdown: shutdown_tx,
                task,
            },
        );
    }

    async fn stop_skylet(&self, cluster_name: &str) {
        let handle = {
            let mut state = self.state.lock().await;
            state.error_since.remove(cluster_name);
            state.skylets.remove(cluster_name)
        };
        let Some(handle) = handle else { return };

        let _ = handle.shutdown.send(());
        if handle.task.await.is_err() {
            warn!(cluster = %cluster_name, "skylet task ended abnormally during stop");
        }
        // The Skylet releases its own handle on a clean exit, but a
        // crashed one may not have gotten there.
        self.factory.release(cluster_name).await;
        info!(cluster = %cluster_name, "skylet torn down");
    }

    /// Stops Skylets whose cluster has been in ERROR longer than the
    /// grace period. They come back through `on_update` when the cluster
    /// recovers.
    async fn sweep_errored(&self, clusters: &Informer<Cluster>) {
        let mut expired = vec![];
        {
            let state = self.state.lock().await;
            for cluster in clusters.snapshot() {
                let name = &cluster.metadata.name;
                if cluster.status.status == ClusterState::Error {
                    if let Some(since) = state.error_since.get(name) {
                        if since.elapsed() >= self.config.error_grace_period
                            && state.skylets.contains_key(name)
                        {
                            expired.push(name.clone());
                        }
                    }
                }
            }
        }
        for cluster_name in expired {
            warn!(cluster = %cluster_name, "cluster stuck in ERROR past grace period");
            self.stop_skylet(&cluster_name).await;
        }
    }
}

#[async_trait]
impl EventHandler<Cluster> for ClusterLifecycleHandler {
    async fn on_add(&self, new: &Cluster) {
        if new.status.status != ClusterState::Deleting {
            self.ensure_skylet(new).await;
        }
    }

    async fn on_update(&self, old: &Cluster, new: &Cluster) {
        let name = new.metadata.name.clone();
        match new.status.status {
            ClusterState::Error => {
                if old.status.status != ClusterState::Error {
                    self.state
                        .lock()
                        .await
                        .error_since
                        .entry(name)
                        .or_insert_with(Instant::now);
                }
            }
            ClusterState::Deleting => {
                self.stop_skylet(&name).await;
            }
            _ => {
                self.state.lock().await.error_since.remove(&name);
                self.ensure_skylet(new).await;
            }
        }
    }

    async fn on_delete(&self, old: &Cluster) {
        self.stop_skylet(&old.metadata.name).await;
    }
}
