//! The Ray [`ClusterManager`]: containerized jobs against the head node's
//! Jobs API.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use snafu::ResultExt;
use skyshift_types::{
    kinds::{Cluster, Job, JobState},
    resources::{ResourceMap, RESOURCE_CPUS, RESOURCE_GPUS, RESOURCE_MEMORY},
};
use tracing::debug;

use crate::{
    managed_job_name, ClusterInventory, ClusterManager, ExecRequest, ExecSession, HttpSnafu,
    LogStream, LogsOptions, ManagerError, ReplicaCounts, Result, UnsupportedSnafu,
};

/// The head node's Jobs API (dashboard) port.
pub const RAY_JOBS_PORT: u16 = 8265;
/// The GCS port workers join through.
pub const RAY_NODES_PORT: u16 = 6379;
/// The Ray client server port.
pub const RAY_CLIENT_PORT: u16 = 10001;

const LOG_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct RayManager {
    cluster_name: String,
    http: reqwest::Client,
    base: String,
}

#[derive(Debug, Deserialize)]
struct JobDetails {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct JobLogs {
    #[serde(default)]
    logs: String,
}

#[derive(Debug, Deserialize)]
struct NodeSummaryResponse {
    #[serde(default)]
    data: NodeSummaryData,
}

#[derive(Debug, Default, Deserialize)]
struct NodeSummaryData {
    #[serde(default)]
    summary: Vec<NodeSummary>,
}

#[derive(Debug, Deserialize)]
struct NodeSummary {
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    raylet: RayletSummary,
}

#[derive(Debug, Default, Deserialize)]
struct RayletSummary {
    #[serde(default)]
    state: String,
    #[serde(default, rename = "resourcesTotal")]
    resources_total: BTreeMap<String, f64>,
    #[serde(default, rename = "resourcesAvailable")]
    resources_available: BTreeMap<String, f64>,
}

fn convert_ray_resources(resources: &BTreeMap<String, f64>) -> ResourceMap {
    let mut converted = ResourceMap::new();
    for (resource, amount) in resources {
        match resource.as_str() {
            "CPU" => {
                converted.insert(RESOURCE_CPUS.to_string(), *amount);
            }
            "GPU" => {
                converted.insert(RESOURCE_GPUS.to_string(), *amount);
            }
            // Ray reports memory in bytes.
            "memory" => {
                converted.insert(RESOURCE_MEMORY.to_string(), *amount / (1024.0 * 1024.0));
            }
            "object_store_memory" => {}
            _ => {}
        }
    }
    converted
}

fn ray_status_to_job_state(status: &str) -> JobState {
    match status {
        "PENDING" => JobState::Pending,
        "RUNNING" => JobState::Running,
        "SUCCEEDED" => JobState::Completed,
        "FAILED" | "STOPPED" => JobState::Failed,
        _ => JobState::Pending,
    }
}

impl RayManager {
    /// `access_config` must carry `host`, the address of the Ray head node.
    pub fn connect(cluster: &Cluster) -> Result<Self> {
        let host = cluster
            .spec
            .access_config
            .get("host")
            .ok_or(ManagerError::MissingConfig { field: "host" })?;

        Ok(RayManager {
            cluster_name: cluster.metadata.name.clone(),
            http: reqwest::Client::new(),
            base: format!("http://{host}:{RAY_JOBS_PORT}"),
        })
    }

    async fn job_details(&self, submission_id: &str) -> Result<JobDetails> {
        self.http
            .get(format!("{}/api/jobs/{submission_id}", self.base))
            .send()
            .await
            .context(HttpSnafu)?
            .error_for_status()
            .context(HttpSnafu)?
            .json()
            .await
            .context(HttpSnafu)
    }

    async fn fetch_logs(&self, submission_id: &str) -> Result<String> {
        let body: JobLogs = self
            .http
            .get(format!("{}/api/jobs/{submission_id}/logs", self.base))
            .send()
            .await
            .context(HttpSnafu)?
            .error_for_status()
            .context(HttpSnafu)?
            .json()
            .await
            .context(HttpSnafu)?;
        Ok(body.logs)
    }
}

#[async_trait]
impl ClusterManager for RayManager {
    fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    async fn describe(&self) -> Result<ClusterInventory> {
        let response: NodeSummaryResponse = self
            .http
            .get(format!("{}/nodes?view=summary", self.base))
            .send()
            .await
            .context(HttpSnafu)?
            .error_for_status()
            .context(HttpSnafu)?
            .json()
            .await
            .context(HttpSnafu)?;

        let mut inventory = ClusterInventory::default();
        for node in response.data.summary {
            if node.raylet.state != "ALIVE" {
                continue;
            }
            let capacity = convert_ray_resources(&node.raylet.resources_total);
            let allocatable = if node.raylet.resources_available.is_empty() {
                capacity.clone()
            } else {
                convert_ray_resources(&node.raylet.resources_available)
            };

            // Ray advertises accelerator types as marker resources, e.g.
            // `accelerator_type:V100`.
            for resource in node.raylet.resources_total.keys() {
                if let Some(accelerator) = resource.strip_prefix("accelerator_type:") {
                    inventory
                        .accelerator_types
                        .insert(node.hostname.clone(), accelerator.to_string());
                }
            }

            inventory.capacity.insert(node.hostname.clone(), capacity);
            inventory
                .allocatable
                .insert(node.hostname.clone(), allocatable);
        }
        Ok(inventory)
    }

    async fn submit_job(&self, job: &Job, replicas: u32) -> Result<String> {
        let submission_id = managed_job_name(job);

        let entrypoint = if job.spec.run.is_empty() {
            "true".to_string()
        } else {
            job.spec.run.clone()
        };
        let cpus = job
            .spec
            .resources
            .get(RESOURCE_CPUS)
            .copied()
            .unwrap_or(0.0);
        let gpus = job
            .spec
            .resources
            .get(RESOURCE_GPUS)
            .copied()
            .unwrap_or(0.0);

        let mut body = serde_json::json!({
            "entrypoint": entrypoint,
            "submission_id": submission_id,
            "runtime_env": {
                "env_vars": job.spec.envs,
                "container": { "image": job.spec.image },
            },
        });
        if cpus > 0.0 {
            body["entrypoint_num_cpus"] = serde_json::json!(cpus * f64::from(replicas));
        }
        if gpus > 0.0 {
            body["entrypoint_num_gpus"] = serde_json::json!(gpus * f64::from(replicas));
        }

        let response = self
            .http
            .post(format!("{}/api/jobs/", self.base))
            .json(&body)
            .send()
            .await
            .context(HttpSnafu)?;

        // A taken submission id means the job is already there; the flow
        // controller treats resubmission as reconciliation.
        if response.status() == reqwest::StatusCode::BAD_REQUEST
            || response.status() == reqwest::StatusCode::CONFLICT
        {
            return Ok(submission_id);
        }
        response.error_for_status().context(HttpSnafu)?;

        debug!(job = %submission_id, "submitted to ray");
        Ok(submission_id)
    }

    async fn delete_job(&self, job: &Job) -> Result<()> {
        let submission_id = managed_job_name(job);

        // Stop first; deleting a running job is rejected.
        let _ = self
            .http
            .post(format!("{}/api/jobs/{submission_id}/stop", self.base))
            .send()
            .await;

        let response = self
            .http
            .delete(format!("{}/api/jobs/{submission_id}", self.base))
            .send()
            .await
            .context(HttpSnafu)?;
        if response.status() != reqwest::StatusCode::NOT_FOUND {
            response.error_for_status().context(HttpSnafu)?;
        }
        Ok(())
    }

    async fn poll_job(&self, job: &Job) -> Result<ReplicaCounts> {
        let slice = job.status.replicas_on(&self.cluster_name).max(1);
        let details = self.job_details(&managed_job_name(job)).await?;
        let state = ray_status_to_job_state(&details.status);
        Ok(ReplicaCounts::from([(state, slice)]))
    }

    async fn job_logs(&self, job: &Job, options: LogsOptions) -> Result<LogStream> {
        let submission_id = managed_job_name(job);
        let manager = self.clone();
        let follow = options.follow;

        let stream = futures::stream::unfold(
            (manager, submission_id, options.offset, false),
            move |(manager, submission_id, offset, done)| async move {
                if done {
                    return None;
                }
                loop {
                    match manager.fetch_logs(&submission_id).await {
                        Ok(logs) => {
                            let bytes = logs.into_bytes();
                            if (bytes.len() as u64) <= offset {
                                if !follow {
                                    return None;
                                }
                                tokio::time::sleep(LOG_POLL_INTERVAL).await;
                                continue;
                            }
                            let chunk = Bytes::from(bytes).split_off(offset as usize);
                            let next_offset = offset + chunk.len() as u64;
                            return Some((
                                Ok(chunk),
                                (manager, submission_id, next_offset, !follow),
                            ));
                        }
                        Err(error) => {
                            return Some((
                                Err(error),
                                (manager, submission_id, offset, true),
                            ));
                        }
                    }
                }
            },
        );
        Ok(stream.boxed())
    }

    async fn exec(&self, _job: &Job, _request: ExecRequest) -> Result<ExecSession> {
        // The Jobs API has no attach surface.
        UnsupportedSnafu { operation: "exec" }.fail()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("PENDING", JobState::Pending)]
    #[case("RUNNING", JobState::Running)]
    #[case("SUCCEEDED", JobState::Completed)]
    #[case("FAILED", JobState::Failed)]
    #[case("STOPPED", JobState::Failed)]
    #[case("", JobState::Pending)]
    fn ray_statuses_map_to_replica_states(#[case] input: &str, #[case] expected: JobState) {
        assert_eq!(ray_status_to_job_state(input), expected);
    }

    #[test]
    fn ray_resources_convert_units() {
        let resources = BTreeMap::from([
            ("CPU".to_string(), 8.0),
            ("GPU".to_string(), 2.0),
            ("memory".to_string(), 4.0 * 1024.0 * 1024.0 * 1024.0),
            ("object_store_memory".to_string(), 1e9),
        ]);
        let converted = convert_ray_resources(&resources);
        assert_eq!(converted.get(RESOURCE_CPUS), Some(&8.0));
        assert_eq!(converted.get(RESOURCE_GPUS), Some(&2.0));
        assert_eq!(converted.get(RESOURCE_MEMORY), Some(&4096.0));
        assert_eq!(converted.len(), 3);
    }

    #[test]
    fn node_summary_parses_dashboard_shape() {
        let raw = serde_json::json!({
            "result": true,
            "data": {
                "summary": [{
                    "hostname": "head-1",
                    "raylet": {
                        "state": "ALIVE",
                        "resourcesTotal": { "CPU": 4.0, "memory": 8589934592.0 },
                    },
                }],
            },
        });
        let parsed: NodeSummaryResponse =
            serde_json::from_value(raw).expect("summary must parse");
        assert_eq!(parsed.data.summary.len(), 1);
        assert_eq!(parsed.data.summary[0].hostname, "head-1");
    }
}
