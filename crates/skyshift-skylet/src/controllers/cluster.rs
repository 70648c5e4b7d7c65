//! The cluster controller: heartbeats the backend and publishes capacity.

use std::sync::Arc;

use skyshift_compat::ClusterManager;
use skyshift_store::ObjectStore;
use skyshift_types::{
    conditions::{set_condition, Condition, ConditionStatus},
    kinds::{Cluster, ClusterState},
};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{tick_or_shutdown, update_status_with_retry};

/// Consecutive describe failures before the cluster is marked ERROR.
const FAILURE_THRESHOLD: u32 = 3;

const REACHABLE_CONDITION: &str = "ManagerReachable";

#[derive(Clone)]
pub struct ClusterController {
    pub cluster_name: String,
    pub store: ObjectStore,
    pub manager: Arc<dyn ClusterManager>,
    pub interval: std::time::Duration,
}

impl ClusterController {
    pub async fn run(self, mut shutdown: watch::Receiver<()>) {
        let mut consecutive_failures = 0u32;

        loop {
            match self.manager.describe().await {
                Ok(inventory) => {
                    consecutive_failures = 0;
                    let result = update_status_with_retry::<Cluster, _>(
                        &self.store,
                        None,
                        &self.cluster_name,
                        |cluster| {
                            let changed = cluster.status.capacity != inventory.capacity
                                || cluster.status.allocatable_capacity != inventory.allocatable
                                || cluster.status.status != ClusterState::Ready;
                            if !changed {
                                return false;
                            }
                            cluster.status.capacity = inventory.capacity.clone();
                            cluster.status.allocatable_capacity = inventory.allocatable.clone();
                            if cluster.status.status != ClusterState::Deleting {
                                cluster.status.status = ClusterState::Ready;
                            }
                            set_condition(
                                &mut cluster.status.conditions,
                                Condition::new(
                                    REACHABLE_CONDITION,
                                    ConditionStatus::True,
                                    "Heartbeat",
                                    "cluster manager answered describe",
                                ),
                            );
                            true
                        },
                    )
                    .await;
                    if let Err(error) = result {
                        warn!(cluster = %self.cluster_name, %error, "failed to publish capacity");
                    } else {
                        debug!(cluster = %self.cluster_name, "capacity published");
                    }
                }
                Err(error) => {
                    consecutive_failures += 1;
                    warn!(
                        cluster = %self.cluster_name,
                        %error,
                        consecutive_failures,
                        "cluster describe failed"
                    );
                    if consecutive_failures >= FAILURE_THRESHOLD {
                        let message = error.to_string();
                        let result = update_status_with_retry::<Cluster, _>(
                            &self.store,
                            None,
                            &self.cluster_name,
                            |cluster| {
                                let already_error =
                                    cluster.status.status == ClusterState::Error;
                                cluster.status.status = ClusterState::Error;
                                set_condition(
                                    &mut cluster.status.conditions,
                                    Condition::new(
                                        REACHABLE_CONDITION,
                                        ConditionStatus::False,
                                        "HeartbeatFailed",
                                        message.clone(),
                                    ),
                                );
                                !already_error
                            },
                        )
                        .await;
                        if let Err(error) = result {
                            warn!(cluster = %self.cluster_name, %error, "failed to mark cluster ERROR");
                        }
                    }
                }
            }

            if tick_or_shutdown(self.interval, &mut shutdown).await {
                return;
            }
        }
    }
}
