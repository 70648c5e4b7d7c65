//! The Slurm [`ClusterManager`]: jobs submitted over SSH with `sbatch`,
//! polled with `squeue`/`sacct`, logs streamed from the batch output file.
//!
//! Containerized jobs wrap the image in `docker run` (or `singularity exec`
//! when the cluster's access configuration says so); the job's resource
//! request is translated into `sbatch` flags.

pub mod parse;

use std::{collections::BTreeMap, time::Duration};

use async_ssh2_tokio::client::{AuthMethod, Client, ServerCheckMethod};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use snafu::ResultExt;
use skyshift_types::{
    kinds::{Cluster, Job},
    resources::{ResourceMap, RESOURCE_CPUS, RESOURCE_GPUS, RESOURCE_MEMORY},
};
use tracing::debug;

use crate::{
    managed_job_name, ClusterInventory, ClusterManager, ExecRequest, ExecSession, LogStream,
    LogsOptions, ManagerError, ReplicaCounts, Result, SshSnafu, UnsupportedSnafu,
};
use parse::{
    parse_sbatch_job_id, parse_scontrol_nodes, parse_squeue_rows, slurm_state_to_job_state,
};

const LOG_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ContainerRuntime {
    #[default]
    Docker,
    Singularity,
}

pub struct SlurmManager {
    cluster_name: String,
    client: Client,
    runtime: ContainerRuntime,
}

impl SlurmManager {
    /// Connects to the cluster's login node. `access_config` must carry
    /// `host` and `user`, plus either `password` or `key_path`.
    pub async fn connect(cluster: &Cluster) -> Result<Self> {
        let access = &cluster.spec.access_config;
        let host = access
            .get("host")
            .ok_or(ManagerError::MissingConfig { field: "host" })?;
        let user = access
            .get("user")
            .ok_or(ManagerError::MissingConfig { field: "user" })?;
        let port: u16 = access
            .get("port")
            .and_then(|p| p.parse().ok())
            .unwrap_or(22);

        let auth = if let Some(password) = access.get("password") {
            AuthMethod::with_password(password)
        } else if let Some(key_path) = access.get("key_path") {
            AuthMethod::with_key_file(key_path, None)
        } else {
            return Err(ManagerError::MissingConfig {
                field: "password or key_path",
            });
        };

        let client = Client::connect(
            (host.as_str(), port),
            user.as_str(),
            auth,
            ServerCheckMethod::NoCheck,
        )
        .await
        .context(SshSnafu)?;

        let runtime = match access.get("container_runtime").map(String::as_str) {
            Some("singularity") => ContainerRuntime::Singularity,
            _ => ContainerRuntime::Docker,
        };

        Ok(SlurmManager {
            cluster_name: cluster.metadata.name.clone(),
            client,
            runtime,
        })
    }

    async fn run(&self, command: &str) -> Result<String> {
        let result = self.client.execute(command).await.context(SshSnafu)?;
        if result.exit_status != 0 {
            return Err(ManagerError::CommandFailed {
                command: command.to_string(),
                code: result.exit_status,
                stderr: result.stderr,
            });
        }
        Ok(result.stdout)
    }

    fn log_path(job: &Job) -> String {
        format!("/tmp/{}.out", managed_job_name(job))
    }

    /// The slurm id of the currently queued or running instance, if any.
    async fn active_job_id(&self, job: &Job) -> Result<Option<String>> {
        let output = self
            .run(&format!(
                "squeue --name={} -h -o '%A|%T'",
                managed_job_name(job)
            ))
            .await?;
        Ok(parse_squeue_rows(&output).into_iter().next().map(|(id, _)| id))
    }
}

#[async_trait]
impl ClusterManager for SlurmManager {
    fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    async fn describe(&self) -> Result<ClusterInventory> {
        let output = self.run("scontrol show nodes -o").await?;
        let nodes = parse_scontrol_nodes(&output);

        let mut inventory = ClusterInventory::default();
        for node in nodes {
            let mut capacity = ResourceMap::from([
                (RESOURCE_CPUS.to_string(), node.cpus_total),
                (RESOURCE_MEMORY.to_string(), node.memory_mb_total),
            ]);
            let mut allocatable = ResourceMap::from([
                (
                    RESOURCE_CPUS.to_string(),
                    (node.cpus_total - node.cpus_alloc).max(0.0),
                ),
                (
                    RESOURCE_MEMORY.to_string(),
                    (node.memory_mb_total - node.memory_mb_alloc).max(0.0),
                ),
            ]);

            if let Some((accelerator, count)) = &node.gres {
                capacity.insert(RESOURCE_GPUS.to_string(), f64::from(*count));
                allocatable.insert(
                    RESOURCE_GPUS.to_string(),
                    f64::from(count.saturating_sub(node.gres_alloc)),
                );
                inventory
                    .accelerator_types
                    .insert(node.name.clone(), accelerator.clone());
            }

            if !node.features.is_empty() {
                inventory.node_labels.insert(
                    node.name.clone(),
                    node.features
                        .iter()
                        .map(|feature| (feature.clone(), "true".to_string()))
                        .collect::<BTreeMap<_, _>>(),
                );
            }

            inventory.capacity.insert(node.name.clone(), capacity);
            inventory.allocatable.insert(node.name, allocatable);
        }
        Ok(inventory)
    }

    async fn submit_job(&self, job: &Job, replicas: u32) -> Result<String> {
        // sbatch has no scale-in-place; an already queued instance keeps
        // its id and the flow controller reconciles by delete/resubmit.
        if let Some(existing) = self.active_job_id(job).await? {
            return Ok(existing);
        }

        let output = self
            .run(&build_sbatch_command(self.runtime, job, replicas))
            .await?;
        let id = parse_sbatch_job_id(&output).ok_or_else(|| ManagerError::Parse {
            message: format!("unexpected sbatch output: {output}"),
        })?;
        debug!(job = %managed_job_name(job), slurm_id = %id, "submitted to slurm");
        Ok(id)
    }

    async fn delete_job(&self, job: &Job) -> Result<()> {
        self.run(&format!("scancel --name={}", managed_job_name(job)))
            .await?;
        Ok(())
    }

    async fn poll_job(&self, job: &Job) -> Result<ReplicaCounts> {
        let slice = job.status.replicas_on(&self.cluster_name).max(1);

        let queued = self
            .run(&format!(
                "squeue --name={} -h -o '%A|%T'",
                managed_job_name(job)
            ))
            .await?;
        let rows = parse_squeue_rows(&queued);

        let state = if let Some((_, state)) = rows.first() {
            slurm_state_to_job_state(state)
        } else {
            // Nothing queued: ask accounting for the final state.
            let finished = self
                .run(&format!(
                    "sacct --name={} -n -X -o State",
                    managed_job_name(job)
                ))
                .await?;
            match finished.lines().last().map(str::trim) {
                Some(state) if !state.is_empty() => slurm_state_to_job_state(state),
                _ => {
                    return Err(ManagerError::JobNotSubmitted {
                        name: job.metadata.name.clone(),
                    })
                }
            }
        };

        Ok(ReplicaCounts::from([(state, slice)]))
    }

    async fn job_logs(&self, job: &Job, options: LogsOptions) -> Result<LogStream> {
        let client = self.client.clone();
        let path = Self::log_path(job);
        let follow = options.follow;

        let stream = futures::stream::unfold(
            (client, options.offset, false),
            move |(client, offset, done)| {
                let path = path.clone();
                async move {
                    if done {
                        return None;
                    }
                    loop {
                        // `tail -c +N` is 1-indexed; N = offset + 1 resumes
                        // exactly after the marker.
                        let command = format!("tail -c +{} {}", offset + 1, path);
                        match client.execute(&command).await {
                            Ok(result) if result.exit_status != 0 => {
                                return Some((
                                    Err(ManagerError::CommandFailed {
                                        command,
                                        code: result.exit_status,
                                        stderr: result.stderr,
                                    }),
                                    (client, offset, true),
                                ));
                            }
                            Ok(result) if result.stdout.is_empty() => {
                                if !follow {
                                    return None;
                                }
                                tokio::time::sleep(LOG_POLL_INTERVAL).await;
                            }
                            Ok(result) => {
                                let chunk = Bytes::from(result.stdout.into_bytes());
                                let next_offset = offset + chunk.len() as u64;
                                // A non-follow read drains once and ends.
                                return Some((Ok(chunk), (client, next_offset, !follow)));
                            }
                            Err(source) => {
                                return Some((
                                    Err(ManagerError::Ssh { source }),
                                    (client, offset, true),
                                ));
                            }
                        }
                    }
                }
            },
        );

        Ok(stream.boxed())
    }

    async fn exec(&self, job: &Job, request: ExecRequest) -> Result<ExecSession> {
        if request.interactive {
            // An interactive allocation needs a PTY on the compute node,
            // which the command transport here does not provide.
            return UnsupportedSnafu {
                operation: "interactive exec",
            }
            .fail();
        }

        let slurm_id = job
            .status
            .job_ids
            .get(&self.cluster_name)
            .ok_or_else(|| ManagerError::JobNotSubmitted {
                name: job.metadata.name.clone(),
            })?;

        let command = format!(
            "srun --overlap --jobid={slurm_id} {}",
            request
                .command
                .iter()
                .map(|part| shell_quote(part))
                .collect::<Vec<_>>()
                .join(" ")
        );
        let result = self.client.execute(&command).await.context(SshSnafu)?;

        let code = result.exit_status as i32;
        let output = futures::stream::iter(vec![Ok(Bytes::from(result.stdout.into_bytes()))]);
        Ok(ExecSession {
            stdin: None,
            output: output.boxed(),
            exit_code: async move { code }.boxed(),
        })
    }
}

fn container_command(runtime: ContainerRuntime, job: &Job) -> String {
    let run = if job.spec.run.is_empty() {
        String::new()
    } else {
        format!(" sh -c {}", shell_quote(&job.spec.run))
    };

    match runtime {
        ContainerRuntime::Docker => {
            let envs = job
                .spec
                .envs
                .iter()
                .map(|(key, value)| format!(" -e {}={}", key, shell_quote(value)))
                .collect::<String>();
            format!("docker run --rm{envs} {image}{run}", image = job.spec.image)
        }
        ContainerRuntime::Singularity => {
            let env_prefix = job
                .spec
                .envs
                .iter()
                .map(|(key, value)| format!("SINGULARITYENV_{key}={} ", shell_quote(value)))
                .collect::<String>();
            format!(
                "{env_prefix}singularity exec docker://{image}{run}",
                image = job.spec.image
            )
        }
    }
}

fn build_sbatch_command(runtime: ContainerRuntime, job: &Job, replicas: u32) -> String {
    let name = managed_job_name(job);
    let mut flags = vec![
        format!("--job-name={name}"),
        format!("--ntasks={replicas}"),
        format!("--output={}", SlurmManager::log_path(job)),
    ];

    let cpus = job
        .spec
        .resources
        .get(RESOURCE_CPUS)
        .copied()
        .unwrap_or(0.0);
    if cpus > 0.0 {
        flags.push(format!("--cpus-per-task={}", cpus.ceil() as u64));
    }
    let memory = job
        .spec
        .resources
        .get(RESOURCE_MEMORY)
        .copied()
        .unwrap_or(0.0);
    if memory > 0.0 {
        flags.push(format!("--mem={}M", memory.ceil() as u64));
    }
    let gpus = job
        .spec
        .resources
        .get(RESOURCE_GPUS)
        .copied()
        .unwrap_or(0.0);
    if gpus > 0.0 {
        flags.push(format!("--gres=gpu:{}", gpus.ceil() as u64));
    }

    format!(
        "sbatch {flags} --wrap={wrap}",
        flags = flags.join(" "),
        wrap = shell_quote(&container_command(runtime, job))
    )
}

/// Single-quotes a string for a POSIX shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        let mut job = Job::new("default", "train");
        job.spec.image = "pytorch/pytorch:latest".to_string();
        job.spec.run = "python train.py".to_string();
        job.spec
            .resources
            .insert(RESOURCE_MEMORY.to_string(), 2048.0);
        job
    }

    #[test]
    fn shell_quoting_survives_embedded_quotes() {
        assert_eq!(shell_quote("echo hi"), "'echo hi'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn sbatch_command_carries_resources_and_wrap() {
        let command = build_sbatch_command(ContainerRuntime::Docker, &job(), 2);
        assert!(command.starts_with("sbatch --job-name=skyshift-default-train --ntasks=2"));
        assert!(command.contains("--cpus-per-task=1"));
        assert!(command.contains("--mem=2048M"));
        assert!(command.contains("--output=/tmp/skyshift-default-train.out"));
        assert!(command.contains("docker run --rm"));
        assert!(command.contains("python train.py"));
        assert!(!command.contains("--gres"), "no gpus requested");
    }

    #[test]
    fn singularity_runtime_uses_docker_uri() {
        let command = build_sbatch_command(ContainerRuntime::Singularity, &job(), 1);
        assert!(command.contains("singularity exec docker://pytorch/pytorch:latest"));
    }
}
